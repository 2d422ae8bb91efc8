//! A library for controlling Heatmiser thermostats via Modbus RTU.
//!
//! Several thermostats share one RS485 line. This crate turns commands such
//! as "set the target temperature of thermostat #3 to 21.5 °C" into
//! CRC-protected Modbus frames, serialises every exchange on the line and
//! decodes the replies into typed values.
//!
//! ## Layers
//!
//! - [`frame`]: Modbus RTU framing, CRC16 and the streaming reply decoder.
//! - [`protocol`]: The thermostat register map with strongly typed values
//!   (e.g. `DeviceAddress`, `Temperature`, `HoldDuration`, `KeyLock`).
//! - [`queue`]: The single worker that owns the line and runs one request
//!   at a time, with timeouts and retries.
//! - [`transport`]: Opens the byte stream, e.g. a serial port.
//! - [`client`]: Connection lifecycle, register reads/writes and the
//!   device operations built from them.
//! - [`thermostat`]: Handle for a single device that takes plain values.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hmmb_lib::{client::Client, protocol::BaudRate, transport::SerialTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::default();
//!     client
//!         .connect(&mut SerialTransport::new("/dev/ttyUSB0", BaudRate::B9600))
//!         .await?;
//!
//!     let living_room = client.add_thermostat(1)?.with_name("Living room");
//!     let result = living_room.read_status().await;
//!     client.close().await;
//!
//!     let status = result?;
//!     println!("{}: target {} °{}", living_room.name(), status.target_temperature, status.units);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod queue;
pub mod thermostat;
pub mod transport;

pub use error::{Error, Result};
