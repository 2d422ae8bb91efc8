//! Modbus RTU client for Heatmiser thermostats.
//!
//! [`Client`] owns the connection to the bus and offers two primitives,
//! [`Client::read_registers`] and [`Client::write_registers`]. Every device
//! operation (switching on, setting temperatures, reading the status, ...)
//! is a composition of those, driven by the register map in
//! [`crate::protocol`].
//!
//! A client is cheap to clone; all clones share the same connection and
//! the same [`TransactionQueue`], so requests from any number of tasks are
//! put on the line one after another.
//!
//! # Example
//!
//! ```no_run
//! use hmmb_lib::{client::{Client, ClientConfig}, protocol::BaudRate, transport::SerialTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfig::default());
//!     let mut transport = SerialTransport::new("/dev/ttyUSB0", BaudRate::B9600);
//!     client.connect(&mut transport).await?;
//!
//!     let thermostat = client.add_thermostat(3)?;
//!     let result = thermostat.set_target_temperature(21.5).await;
//!
//!     // Release the serial port whether or not the operation worked.
//!     client.close().await;
//!     result?;
//!     Ok(())
//! }
//! ```

use crate::{
    error::{Error, Result},
    frame::{Frame, FunctionCode},
    protocol::{self as proto, DeviceAddress},
    queue::{TransactionError, TransactionQueue},
    thermostat::Thermostat,
    transport::Transport,
};
use log::*;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Mutex, Notify};

/// Lifecycle of a client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Timing and encoding settings of a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the reply to each transmission.
    pub timeout: Duration,
    /// How often an unanswered or corrupted request is sent again.
    pub max_retries: u8,
    /// Line silence that marks the end of a frame.
    pub silent_interval: Duration,
    /// How the firmware stores hold durations.
    pub hold_encoding: proto::HoldDurationEncoding,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_retries: 2,
            silent_interval: proto::BaudRate::default().silent_interval(),
            hold_encoding: proto::HoldDurationEncoding::default(),
        }
    }
}

/// Most registers one read (0x03) may return.
pub const MAX_READ_REGISTERS: usize = 125;
/// Most registers one write (0x10) may carry.
pub const MAX_WRITE_REGISTERS: usize = 123;

enum Link {
    Disconnected,
    Connecting,
    Connected(TransactionQueue),
    Closing,
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting => ConnectionState::Connecting,
            Link::Connected(_) => ConnectionState::Connected,
            Link::Closing => ConnectionState::Closing,
        }
    }
}

struct Inner {
    config: ClientConfig,
    link: Mutex<Link>,
    /// Signalled whenever `link` leaves `Connecting` or `Closing`.
    link_changed: Notify,
    /// Last observed unit per device address, `true` for Fahrenheit.
    fahrenheit: [AtomicBool; DeviceAddress::MAX as usize + 1],
}

/// Asynchronous client for the thermostats on one serial line.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Client {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                link: Mutex::new(Link::Disconnected),
                link_changed: Notify::new(),
                fahrenheit: std::array::from_fn(|_| AtomicBool::new(false)),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.link.lock().await.state()
    }

    /// Opens `transport` and starts serving requests over it.
    ///
    /// Connecting an already connected client does nothing. While another
    /// connect or a close is in progress, this waits for it to finish first.
    ///
    /// # Errors
    ///
    /// * [`Error::Connect`] if the transport cannot be opened.
    /// * [`Error::Cancelled`] if the client was closed while connecting.
    pub async fn connect<T: Transport>(&self, transport: &mut T) -> Result<()> {
        loop {
            let mut link = self.inner.link.lock().await;
            match *link {
                Link::Disconnected => {
                    *link = Link::Connecting;
                    break;
                }
                Link::Connected(_) => return Ok(()),
                Link::Connecting | Link::Closing => {
                    let changed = self.inner.link_changed.notified();
                    drop(link);
                    changed.await;
                }
            }
        }

        debug!("Opening {}", transport.name());
        let opened = transport.open();

        let mut link = self.inner.link.lock().await;
        if !matches!(*link, Link::Connecting) {
            debug!("{} was closed while connecting", transport.name());
            return Err(Error::Cancelled);
        }
        let result = match opened {
            Ok(stream) => {
                *link = Link::Connected(TransactionQueue::start(
                    stream,
                    self.inner.config.silent_interval,
                ));
                info!("Connected to {}", transport.name());
                Ok(())
            }
            Err(err) => {
                *link = Link::Disconnected;
                Err(Error::Connect(err))
            }
        };
        self.inner.link_changed.notify_waiters();
        result
    }

    /// Cancels outstanding operations and releases the transport.
    ///
    /// Must be called on every exit path once the client was connected,
    /// successful or not. Closing a client that is not connected is a no-op.
    pub async fn close(&self) {
        let queue = {
            let mut link = self.inner.link.lock().await;
            match std::mem::replace(&mut *link, Link::Closing) {
                Link::Connected(queue) => Some(queue),
                Link::Connecting => {
                    *link = Link::Disconnected;
                    self.inner.link_changed.notify_waiters();
                    None
                }
                previous @ (Link::Disconnected | Link::Closing) => {
                    *link = previous;
                    return;
                }
            }
        };
        if let Some(queue) = queue {
            queue.close().await;
            *self.inner.link.lock().await = Link::Disconnected;
            self.inner.link_changed.notify_waiters();
            info!("Connection closed");
        }
    }

    /// Creates a handle for the thermostat with the communications id `id`.
    pub fn add_thermostat(&self, id: u8) -> Result<Thermostat> {
        Ok(Thermostat::new(self.clone(), DeviceAddress::try_from(id)?))
    }

    /// The unit `device` was last seen to use. Celsius until observed.
    pub fn temperature_units(&self, device: DeviceAddress) -> proto::TemperatureUnit {
        if self.inner.fahrenheit[*device as usize].load(Ordering::Relaxed) {
            proto::TemperatureUnit::Fahrenheit
        } else {
            proto::TemperatureUnit::Celsius
        }
    }

    fn observe_units(&self, device: DeviceAddress, units: proto::TemperatureUnit) {
        self.inner.fahrenheit[*device as usize].store(
            units == proto::TemperatureUnit::Fahrenheit,
            Ordering::Relaxed,
        );
    }

    async fn transact(&self, request: Frame) -> Result<Frame> {
        let pending = {
            let mut link = self.inner.link.lock().await;
            let submitted = match &*link {
                Link::Connected(queue) => queue.submit(
                    request,
                    self.inner.config.timeout,
                    self.inner.config.max_retries,
                ),
                _ => return Err(Error::NotConnected),
            };
            match submitted {
                Ok(pending) => pending,
                Err(err) => {
                    // the worker is gone after a transport failure
                    *link = Link::Disconnected;
                    return Err(err);
                }
            }
        };
        let result = pending.await.unwrap_or(Err(Error::Cancelled));
        if let Err(Error::Transport(_)) = &result {
            self.close().await;
        }
        result
    }

    /// Reads `count` consecutive holding registers starting at `start`.
    pub async fn read_registers(
        &self,
        device: DeviceAddress,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        check_register_count(count as usize, MAX_READ_REGISTERS)?;
        let mut data = start.to_be_bytes().to_vec();
        data.extend_from_slice(&count.to_be_bytes());
        let reply = self
            .transact(Frame::new(*device, FunctionCode::ReadHoldingRegisters, data))
            .await?;

        let expected = count as usize * 2;
        match reply.data.split_first() {
            Some((&byte_count, words))
                if byte_count as usize == expected && words.len() == expected =>
            {
                Ok(words
                    .chunks_exact(2)
                    .map(|word| u16::from_be_bytes([word[0], word[1]]))
                    .collect())
            }
            _ => Err(TransactionError::UnexpectedReply(format!(
                "expected {count} registers, got {} data bytes",
                reply.data.len().saturating_sub(1)
            ))
            .into()),
        }
    }

    /// Writes `values` to consecutive holding registers starting at `start`.
    ///
    /// A single value goes out as Write Single Register (0x06), more as
    /// Write Multiple Registers (0x10).
    pub async fn write_registers(
        &self,
        device: DeviceAddress,
        start: u16,
        values: &[u16],
    ) -> Result<()> {
        check_register_count(values.len(), MAX_WRITE_REGISTERS)?;
        let mut data = start.to_be_bytes().to_vec();
        let (request, expected_echo) = if let [value] = values {
            data.extend_from_slice(&value.to_be_bytes());
            let echo = data.clone();
            (
                Frame::new(*device, FunctionCode::WriteSingleRegister, data),
                echo,
            )
        } else {
            data.extend_from_slice(&(values.len() as u16).to_be_bytes());
            let echo = data.clone();
            data.push((values.len() * 2) as u8);
            for value in values {
                data.extend_from_slice(&value.to_be_bytes());
            }
            (
                Frame::new(*device, FunctionCode::WriteMultipleRegisters, data),
                echo,
            )
        };

        let reply = self.transact(request).await?;
        if reply.data != expected_echo {
            return Err(TransactionError::UnexpectedReply(format!(
                "write acknowledged as {:02X?}, expected {expected_echo:02X?}",
                reply.data
            ))
            .into());
        }
        Ok(())
    }

    /// Helper function to read registers and decode them into a specific type.
    async fn read_and_decode<T, F>(
        &self,
        device: DeviceAddress,
        address: u16,
        quantity: u16,
        decoder: F,
    ) -> Result<T>
    where
        F: FnOnce(&[u16]) -> std::result::Result<T, proto::Error>,
    {
        let words = self.read_registers(device, address, quantity).await?;
        Ok(decoder(&words)?)
    }

    /// Reads the units the thermostat reports temperatures in.
    pub async fn get_temperature_units(
        &self,
        device: DeviceAddress,
    ) -> Result<proto::TemperatureUnit> {
        let units = self
            .read_and_decode(
                device,
                proto::TemperatureUnit::ADDRESS,
                proto::TemperatureUnit::QUANTITY,
                proto::TemperatureUnit::decode_from_holding_registers,
            )
            .await?;
        self.observe_units(device, units);
        Ok(units)
    }

    /// Reads the whole status block with one request.
    pub async fn read_status(&self, device: DeviceAddress) -> Result<proto::ThermostatStatus> {
        let status = self
            .read_and_decode(
                device,
                proto::ThermostatStatus::ADDRESS,
                proto::ThermostatStatus::QUANTITY,
                proto::ThermostatStatus::decode_from_holding_registers,
            )
            .await?;
        self.observe_units(device, status.units);
        Ok(status)
    }

    pub async fn turn_on(&self, device: DeviceAddress) -> Result<()> {
        self.set_power(device, proto::PowerState::On).await
    }

    pub async fn turn_off(&self, device: DeviceAddress) -> Result<()> {
        self.set_power(device, proto::PowerState::Off).await
    }

    async fn set_power(&self, device: DeviceAddress, power: proto::PowerState) -> Result<()> {
        self.write_registers(
            device,
            proto::PowerState::ADDRESS,
            &[power.encode_for_write_register()],
        )
        .await
    }

    pub async fn set_target_temperature(
        &self,
        device: DeviceAddress,
        temperature: proto::Temperature,
    ) -> Result<()> {
        self.write_registers(
            device,
            proto::TARGET_TEMPERATURE_REG_ADDR,
            &[temperature.encode_for_write_register()],
        )
        .await
    }

    /// Sets the highest temperature the floor sensor may reach.
    pub async fn set_floor_limit_temperature(
        &self,
        device: DeviceAddress,
        temperature: proto::Temperature,
    ) -> Result<()> {
        self.write_registers(
            device,
            proto::FLOOR_LIMIT_REG_ADDR,
            &[temperature.encode_for_write_register()],
        )
        .await
    }

    /// Overrides the schedule with `temperature` for `duration`.
    ///
    /// Temperature and duration are written in one request.
    pub async fn set_hold_temperature(
        &self,
        device: DeviceAddress,
        temperature: proto::Temperature,
        duration: proto::HoldDuration,
    ) -> Result<()> {
        self.write_registers(
            device,
            proto::Hold::ADDRESS,
            &proto::Hold::encode_for_write_registers(
                temperature,
                duration,
                self.inner.config.hold_encoding,
            ),
        )
        .await
    }

    pub async fn set_temperature_units(
        &self,
        device: DeviceAddress,
        units: proto::TemperatureUnit,
    ) -> Result<()> {
        self.write_registers(
            device,
            proto::TemperatureUnit::ADDRESS,
            &[units.encode_for_write_register()],
        )
        .await?;
        self.observe_units(device, units);
        Ok(())
    }

    pub async fn set_time(&self, device: DeviceAddress, time: proto::ClockTime) -> Result<()> {
        self.write_registers(
            device,
            proto::ClockTime::ADDRESS,
            &time.encode_for_write_registers(),
        )
        .await
    }

    pub async fn set_keylock(&self, device: DeviceAddress, keylock: proto::KeyLock) -> Result<()> {
        self.write_registers(
            device,
            proto::KeyLock::ADDRESS,
            &keylock.encode_for_write_registers(),
        )
        .await
    }

    /// Restores the factory settings. Modbus is disabled on the thermostat
    /// afterwards, so it will not answer any further requests.
    pub async fn factory_reset(&self, device: DeviceAddress) -> Result<()> {
        self.write_registers(
            device,
            proto::FactoryReset::ADDRESS,
            &[proto::FactoryReset::encode_for_write_register()],
        )
        .await
    }
}

fn check_register_count(count: usize, max: usize) -> Result<()> {
    if (1..=max).contains(&count) {
        Ok(())
    } else {
        Err(proto::RangeError::RegisterCount { count, min: 1, max }.into())
    }
}
