//! Serialised access to the shared serial line.
//!
//! An RS485 bus is half duplex and multi-drop: two requests on the line at
//! the same time garble each other. [`TransactionQueue`] therefore owns the
//! stream and runs every request/reply exchange on one worker task, one
//! transaction at a time, in the order they were submitted.

use crate::{
    error::{Error, Result},
    frame::{Exception, Frame, FrameDecoder, FrameError},
};
use log::*;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, timeout_at, Instant},
};

/// Failure of one transaction after its retries are used up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Reply failed the checksum: {0}")]
    ChecksumFailed(FrameError),

    #[error("No reply from device {expected}, device {actual} answered instead")]
    NoResponse { expected: u8, actual: u8 },

    #[error("Malformed reply: {0}")]
    BusError(FrameError),

    #[error("Reply does not match the request: {0}")]
    UnexpectedReply(String),

    #[error("Device {address} rejected function {function:#04X}: {exception}")]
    Exception {
        address: u8,
        function: u8,
        exception: Exception,
    },
}

impl TransactionError {
    /// Whether a fresh transmission of the same request may succeed.
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransactionError::Exception { .. } | TransactionError::UnexpectedReply(_)
        )
    }
}

type Reply = oneshot::Sender<Result<Frame>>;

/// A request travelling through the queue together with its retry budget.
#[derive(Debug)]
struct Transaction {
    request: Frame,
    timeout: Duration,
    retries_remaining: u8,
    reply: Reply,
}

/// Handle to the worker that owns the serial stream.
///
/// Dropping the queue stops the worker and releases the stream, just like
/// [`TransactionQueue::close`] does.
#[derive(Debug)]
pub struct TransactionQueue {
    sender: mpsc::UnboundedSender<Transaction>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TransactionQueue {
    /// Spawns the worker. It becomes the only reader and writer of `stream`.
    pub fn start<S>(stream: S, silent_interval: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let worker = Worker {
            stream,
            decoder: FrameDecoder::new(silent_interval),
            silent_interval,
            last_activity: None,
            receiver,
            shutdown: shutdown_rx,
        };
        Self {
            sender,
            shutdown: Some(shutdown),
            worker: Some(tokio::spawn(worker.run())),
        }
    }

    /// Puts a request at the end of the queue.
    ///
    /// The returned receiver resolves with the reply. `max_retries` extra
    /// transmissions are made on timeouts and corrupted replies, every
    /// attempt waiting at most `timeout`.
    pub fn submit(
        &self,
        request: Frame,
        timeout: Duration,
        max_retries: u8,
    ) -> Result<oneshot::Receiver<Result<Frame>>> {
        let (reply, pending) = oneshot::channel();
        self.sender
            .send(Transaction {
                request,
                timeout,
                retries_remaining: max_retries,
                reply,
            })
            .map_err(|_| Error::NotConnected)?;
        Ok(pending)
    }

    /// Submits a request and waits for its reply.
    pub async fn enqueue(
        &self,
        request: Frame,
        timeout: Duration,
        max_retries: u8,
    ) -> Result<Frame> {
        let pending = self.submit(request, timeout, max_retries)?;
        pending.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Whether the worker has stopped, e.g. after a transport failure.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Cancels everything still waiting and releases the stream.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                error!("Transaction worker ended abnormally: {err}");
            }
        }
    }
}

/// How one transmission attempt ended.
enum Attempt {
    Reply(Frame),
    Failed(TransactionError),
    Cancelled,
    TransportFailed(std::io::Error),
}

struct Worker<S> {
    stream: S,
    decoder: FrameDecoder,
    silent_interval: Duration,
    last_activity: Option<Instant>,
    receiver: mpsc::UnboundedReceiver<Transaction>,
    shutdown: oneshot::Receiver<()>,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        loop {
            let transaction = tokio::select! {
                biased;
                _ = &mut self.shutdown => break,
                next = self.receiver.recv() => match next {
                    Some(transaction) => transaction,
                    None => break,
                },
            };
            let reply = transaction.reply;
            let outcome = self
                .execute(
                    transaction.request,
                    transaction.timeout,
                    transaction.retries_remaining,
                )
                .await;
            match outcome {
                Attempt::Reply(frame) => {
                    let _ = reply.send(Ok(frame));
                }
                Attempt::Failed(err) => {
                    let _ = reply.send(Err(err.into()));
                }
                Attempt::Cancelled => {
                    let _ = reply.send(Err(Error::Cancelled));
                    break;
                }
                Attempt::TransportFailed(err) => {
                    error!("Transport failure, closing the connection: {err}");
                    let _ = reply.send(Err(Error::Transport(err)));
                    break;
                }
            }
        }

        self.receiver.close();
        let mut cancelled = 0;
        while let Ok(transaction) = self.receiver.try_recv() {
            let _ = transaction.reply.send(Err(Error::Cancelled));
            cancelled += 1;
        }
        debug!("Transaction worker stopped, {cancelled} queued transaction(s) cancelled");
    }

    /// Runs one transaction to completion, retransmitting as allowed.
    async fn execute(
        &mut self,
        request: Frame,
        timeout: Duration,
        mut retries_remaining: u8,
    ) -> Attempt {
        let bytes = request.to_bytes();
        loop {
            let err = match self.attempt(&request, &bytes, timeout).await {
                Attempt::Failed(err) if err.is_retryable() => err,
                outcome => return outcome,
            };
            if retries_remaining == 0 {
                warn!("Device {}: {err}, giving up", request.address);
                return Attempt::Failed(err);
            }
            retries_remaining -= 1;
            debug!(
                "Device {}: {err}, retrying ({retries_remaining} retries left)",
                request.address
            );
        }
    }

    /// Discards whatever is waiting on the line, such as a reply that came
    /// in after its transaction timed out. Once something was discarded the
    /// rest of that frame is awaited for one silent interval.
    async fn drain_stale_input(&mut self) -> std::io::Result<()> {
        let mut buffer = [0u8; 64];
        let mut wait = Duration::ZERO;
        loop {
            match timeout_at(Instant::now() + wait, self.stream.read(&mut buffer)).await {
                Ok(Ok(0)) => return Err(transport_closed()),
                Ok(Ok(len)) => {
                    trace!("Discarding stale input {:02X?}", &buffer[..len]);
                    self.last_activity = Some(Instant::now());
                    wait = self.silent_interval;
                }
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => return Ok(()),
            }
        }
    }

    /// One transmission of `bytes` and the wait for its reply.
    async fn attempt(&mut self, request: &Frame, bytes: &[u8], timeout: Duration) -> Attempt {
        if let Some(last_activity) = self.last_activity {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return Attempt::Cancelled,
                _ = sleep_until(last_activity + self.silent_interval) => {}
            }
        }

        self.decoder.clear();
        if let Err(err) = self.drain_stale_input().await {
            return Attempt::TransportFailed(err);
        }
        trace!("TX {bytes:02X?}");
        if let Err(err) = write_frame(&mut self.stream, bytes).await {
            return Attempt::TransportFailed(err);
        }
        self.last_activity = Some(Instant::now());

        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; 64];
        loop {
            let wake_at = self
                .decoder
                .silence_deadline()
                .map_or(deadline, |silence| silence.min(deadline));
            let mut end_of_stream = false;
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return Attempt::Cancelled,
                read = timeout_at(wake_at, self.stream.read(&mut buffer)) => match read {
                    Ok(Ok(0)) if self.decoder.is_empty() => {
                        return Attempt::TransportFailed(transport_closed())
                    }
                    Ok(Ok(0)) => end_of_stream = true,
                    Ok(Ok(len)) => {
                        let now = Instant::now();
                        self.decoder.feed(&buffer[..len], now);
                        self.last_activity = Some(now);
                    }
                    Ok(Err(err)) => return Attempt::TransportFailed(err),
                    Err(_elapsed) => {}
                },
            }

            // end of stream terminates a frame just like silence does
            let now = if end_of_stream {
                Instant::now() + self.silent_interval
            } else {
                Instant::now()
            };
            if let Some(result) = self.decoder.try_extract_frame(now) {
                return match result {
                    Ok(reply) => {
                        trace!("RX {:02X?}", reply.to_bytes());
                        match_reply(request, reply)
                    }
                    Err(err @ FrameError::Checksum { .. }) => {
                        Attempt::Failed(TransactionError::ChecksumFailed(err))
                    }
                    Err(err) => Attempt::Failed(TransactionError::BusError(err)),
                };
            }
            if Instant::now() >= deadline {
                return Attempt::Failed(TransactionError::Timeout(timeout));
            }
        }
    }
}

fn transport_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "transport closed")
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// Checks that a checksum-valid frame really answers `request`.
fn match_reply(request: &Frame, reply: Frame) -> Attempt {
    if reply.address != request.address {
        warn!(
            "Discarding reply from device {} while waiting for device {}",
            reply.address, request.address
        );
        return Attempt::Failed(TransactionError::NoResponse {
            expected: request.address,
            actual: reply.address,
        });
    }
    if reply.function_code() != request.function_code() {
        return Attempt::Failed(TransactionError::BusError(FrameError::UnknownFunction(
            reply.function,
        )));
    }
    match reply.exception() {
        Some(exception) => Attempt::Failed(TransactionError::Exception {
            address: reply.address,
            function: request.function,
            exception,
        }),
        None => Attempt::Reply(reply),
    }
}
