//! The byte stream a client talks over.
//!
//! The client never configures the line itself; a [`Transport`] hands it an
//! open duplex stream and is otherwise left alone.
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Something that can be opened into a duplex byte stream.
pub trait Transport {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens the stream. Called once per connection.
    fn open(&mut self) -> io::Result<Self::Stream>;

    /// Human readable name used in log messages, e.g. the device path.
    fn name(&self) -> &str;
}

/// A transport over an already opened stream, e.g. a pipe.
///
/// It can be opened exactly once.
#[derive(Debug)]
pub struct StreamTransport<S> {
    name: String,
    stream: Option<S>,
}

impl<S> StreamTransport<S> {
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        Self {
            name: name.into(),
            stream: Some(stream),
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    fn open(&mut self) -> io::Result<S> {
        self.stream.take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} was already opened", self.name),
            )
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(feature = "serial")]
pub use serial::*;

#[cfg(feature = "serial")]
mod serial {
    use super::Transport;
    use crate::protocol as proto;
    use std::io;

    /// The parity used for serial communication.
    pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
    /// The number of stop bits used for serial communication.
    pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
    /// The number of data bits used for serial communication.
    pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

    /// Creates a `tokio_serial::SerialPortBuilder` with the thermostat's line settings.
    ///
    /// # Arguments
    ///
    /// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
    /// * `baud_rate` - The baud rate for the serial communication.
    pub fn serial_port_builder(
        device: &str,
        baud_rate: &proto::BaudRate,
    ) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(device, u32::from(*baud_rate))
            .parity(*PARITY)
            .stop_bits(*STOP_BITS)
            .data_bits(*DATA_BITS)
            .flow_control(tokio_serial::FlowControl::None)
    }

    /// An RS485 adapter behind a serial device path.
    #[derive(Debug, Clone)]
    pub struct SerialTransport {
        device: String,
        baud_rate: proto::BaudRate,
    }

    impl SerialTransport {
        pub fn new(device: impl Into<String>, baud_rate: proto::BaudRate) -> Self {
            Self {
                device: device.into(),
                baud_rate,
            }
        }

        pub fn baud_rate(&self) -> proto::BaudRate {
            self.baud_rate
        }
    }

    impl Transport for SerialTransport {
        type Stream = tokio_serial::SerialStream;

        fn open(&mut self) -> io::Result<Self::Stream> {
            let builder = serial_port_builder(&self.device, &self.baud_rate);
            Ok(tokio_serial::SerialStream::open(&builder)?)
        }

        fn name(&self) -> &str {
            &self.device
        }
    }
}
