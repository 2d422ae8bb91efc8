use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use hmmb_lib::protocol as proto;
use std::{path::PathBuf, time::Duration};

pub fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<proto::DeviceAddress, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::DeviceAddress::try_from(address_val).map_err(|e| e.to_string())
}

fn parse_baud_rate(s: &str) -> Result<proto::BaudRate, String> {
    let rate_val = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    proto::BaudRate::try_from(rate_val).map_err(|e| e.to_string())
}

fn parse_units(s: &str) -> Result<proto::TemperatureUnit, String> {
    s.parse::<proto::TemperatureUnit>().map_err(|e| e.to_string())
}

/// Accepts `hours:mins` (e.g. `1:30`) or a plain number of minutes.
fn parse_hold_duration(s: &str) -> Result<u16, String> {
    let minutes = match s.split_once(':') {
        Some((hours, mins)) => {
            let hours = hours
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("Invalid hours in '{s}': {e}"))?;
            let mins = mins
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("Invalid minutes in '{s}': {e}"))?;
            if mins >= 60 {
                return Err(format!("Minutes in '{s}' must be below 60"));
            }
            hours
                .checked_mul(60)
                .and_then(|m| m.checked_add(mins))
                .ok_or_else(|| format!("Hold duration '{s}' is too long"))?
        }
        None => s
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("Invalid hold duration '{s}': {e}"))?,
    };
    proto::HoldDuration::from_minutes(minutes)
        .map(|duration| duration.minutes())
        .map_err(|e| e.to_string())
}

fn parse_pin(s: &str) -> Result<u16, String> {
    let pin = s
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("Invalid pin format: {e}"))?;
    proto::Pin::try_from(pin)
        .map(|_| pin)
        .map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Display the thermostat status, including the current temperatures.
    GetStatus,

    /// Turn the thermostat on.
    TurnOn,

    /// Turn the thermostat off.
    TurnOff,

    /// Set the target room temperature.
    /// The value is in the units the thermostat is set to (see `set-units`).
    #[clap(verbatim_doc_comment)]
    SetTemperature {
        /// The target temperature, e.g. "21.5". Resolution is half a degree.
        #[arg(allow_negative_numbers = true)]
        temperature: f32,
    },

    /// Set the temperature limit for the floor sensor.
    SetFloorLimit {
        /// The highest temperature the floor may reach.
        #[arg(allow_negative_numbers = true)]
        temperature: f32,
    },

    /// Hold a different temperature for a given time, then resume the schedule.
    SetHold {
        /// Temperature for the hold period.
        #[arg(allow_negative_numbers = true)]
        temperature: f32,
        /// Length of the hold period, as "hours:mins" (e.g. "1:30") or minutes (e.g. "90").
        /// At most 99:59.
        #[arg(value_parser = parse_hold_duration, verbatim_doc_comment)]
        duration: u16,
    },

    /// Set the temperature units used by the thermostat.
    SetUnits {
        /// "C" for Celsius or "F" for Fahrenheit. Only the first letter counts.
        #[arg(value_parser = parse_units)]
        units: proto::TemperatureUnit,
    },

    /// Sync the system clock to the thermostat.
    SetTime,

    /// Lock the keypad with a 4-digit pin.
    /// Without a pin the keypad is unlocked.
    #[clap(verbatim_doc_comment)]
    SetKeylock {
        /// The pin, 0000 to 9999.
        #[arg(value_parser = parse_pin)]
        pin: Option<u16>,
    },

    /// Restore the thermostat to its factory default settings.
    /// **Warning:** Modbus support is disabled on the thermostat after the reset.
    #[clap(verbatim_doc_comment)]
    FactoryReset {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

const fn about_text() -> &'static str {
    "Tool for controlling Heatmiser Modbus thermostats via Modbus RTU."
}

#[derive(Parser, Debug)]
#[command(name="hmmb", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The serial port device to connect to.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(short, long, env = "HMMB_DEVICE", verbatim_doc_comment)]
    pub device: Option<String>,

    /// The communications id of the thermostat to control (1 to 32).
    /// Can be specified in decimal or hexadecimal (e.g. "0x03").
    #[arg(short, long, env = "HMMB_ID", default_value_t = proto::DeviceAddress::default(), value_parser = parse_address, verbatim_doc_comment)]
    pub id: proto::DeviceAddress,

    /// Baud rate for serial communication.
    /// Supported values: 4800, 9600, 19200. Default is 9600.
    #[arg(global = true, long, value_parser = parse_baud_rate, verbatim_doc_comment)]
    pub baud_rate: Option<proto::BaudRate>,

    /// Time to wait for each reply.
    /// Examples: "1s", "500ms". Default is 500ms.
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// How often an unanswered request is sent again. Default is 2.
    #[arg(global = true, long)]
    pub retries: Option<u8>,

    /// YAML configuration file. Command line options take precedence.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,
}
