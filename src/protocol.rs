//! Register map of the Heatmiser Modbus thermostats.
//!
//! Every attribute the thermostat exposes lives in one or more holding
//! registers. The types in this module know where (`ADDRESS` / `QUANTITY`)
//! and how to convert between their typed value and the raw register words:
//!
//! | Register        | Attribute                         |
//! |-----------------|-----------------------------------|
//! | `0x0000-0x0001` | room temperature (whole, tenths)  |
//! | `0x0002-0x0003` | floor temperature (whole, tenths) |
//! | `0x0004`        | target temperature (raw / 2)      |
//! | `0x0005`        | status flags                      |
//! | `0x0006`        | operation mode                    |
//! | `0x0007`        | temperature units                 |
//! | `0x0010`        | power on/off                      |
//! | `0x0011`        | floor limit temperature (raw / 2) |
//! | `0x0012-0x0013` | hold temperature and duration     |
//! | `0x0014-0x0017` | clock (weekday, hour, min, sec)   |
//! | `0x0018-0x0019` | keylock (enabled, pin)            |
//! | `0x001F`        | factory reset trigger             |
//!
//! The addresses and layouts above are provisional. They have not been
//! checked against a vendor register map, in particular the keylock
//! `[enabled, pin]` pair and the hold duration encoding (which is
//! selectable through [`HoldDurationEncoding`]). Correct the `ADDRESS`
//! constants on the types below once the vendor data is available.
//!
//! Encoding fails with [`RangeError`] before anything is sent to the bus,
//! decoding fails with [`DecodeError`] when the device reports a value that
//! cannot be right.

use chrono::{Datelike, Timelike};
use std::{fmt, ops::Deref, ops::RangeInclusive, str::FromStr, time::Duration};

/// Errors of the register map.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A caller supplied value is outside its documented bounds.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// The device reported raw words that do not decode to a sane value.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("Device address {0} is outside the valid range {min}..={max}", min = DeviceAddress::MIN, max = DeviceAddress::MAX)]
    Address(u8),

    #[error("Temperature {value}°{unit} is outside the valid range {min}..={max}")]
    Temperature {
        value: f32,
        min: f32,
        max: f32,
        unit: TemperatureUnit,
    },

    #[error("Hold duration of {0} minutes exceeds the maximum of {max} minutes", max = HoldDuration::MAX_MINUTES)]
    HoldDuration(u16),

    #[error("Pin {0} is not a 4-digit number")]
    Pin(u16),

    #[error("Unknown temperature unit {0:?}, expected C or F")]
    Unit(String),

    #[error("Baud rate {0} is not supported, use 4800, 9600 or 19200")]
    BaudRate(u32),

    #[error("Register count {count} is outside the valid range {min}..={max}")]
    RegisterCount { count: usize, min: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Expected {expected} registers, got {actual}")]
    RegisterCount { expected: usize, actual: usize },

    #[error("Implausible raw value {raw:#06X} for {attribute}")]
    Implausible { attribute: &'static str, raw: u16 },
}

fn check_quantity(words: &[u16], expected: u16) -> Result<(), Error> {
    if words.len() == expected as usize {
        Ok(())
    } else {
        Err(DecodeError::RegisterCount {
            expected: expected as usize,
            actual: words.len(),
        }
        .into())
    }
}

fn implausible(attribute: &'static str, raw: u16) -> Error {
    DecodeError::Implausible { attribute, raw }.into()
}

/// Modbus slave id of a thermostat on the bus, 1 to 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "u8", into = "u8")
)]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 32;
}

impl Deref for DeviceAddress {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(RangeError::Address(value).into())
        }
    }
}

impl From<DeviceAddress> for u8 {
    fn from(address: DeviceAddress) -> u8 {
        address.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serial line speed. Parity, data and stop bits are fixed at 8N1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "u32", into = "u32")
)]
pub enum BaudRate {
    B4800,
    #[default]
    B9600,
    B19200,
}

impl BaudRate {
    /// Minimum bus silence that separates two RTU frames.
    ///
    /// 3.5 character times at 11 bits per character, but never below 1.75 ms.
    pub fn silent_interval(&self) -> Duration {
        const BITS_PER_CHAR: f64 = 11.0;
        const MIN_SILENT_INTERVAL_MICROS: u64 = 1_750;
        let char_time_secs = BITS_PER_CHAR / u32::from(*self) as f64;
        let micros = (3.5 * char_time_secs * 1_000_000.0) as u64;
        Duration::from_micros(micros.max(MIN_SILENT_INTERVAL_MICROS))
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            4800 => Ok(BaudRate::B4800),
            9600 => Ok(BaudRate::B9600),
            19200 => Ok(BaudRate::B19200),
            _ => Err(RangeError::BaudRate(value).into()),
        }
    }
}

impl From<BaudRate> for u32 {
    fn from(baud_rate: BaudRate) -> u32 {
        match baud_rate {
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// Temperature units the thermostat displays and reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub const ADDRESS: u16 = 0x0007;
    pub const QUANTITY: u16 = 1;

    pub fn decode_from_holding_registers(words: &[u16]) -> Result<Self, Error> {
        check_quantity(words, Self::QUANTITY)?;
        Self::decode(words[0])
    }

    fn decode(raw: u16) -> Result<Self, Error> {
        match raw {
            0 => Ok(TemperatureUnit::Celsius),
            1 => Ok(TemperatureUnit::Fahrenheit),
            _ => Err(implausible("temperature units", raw)),
        }
    }

    pub fn encode_for_write_register(&self) -> u16 {
        match self {
            TemperatureUnit::Celsius => 0,
            TemperatureUnit::Fahrenheit => 1,
        }
    }

    /// Converts a value given in degrees Celsius into this unit.
    pub fn from_celsius(&self, degrees: f32) -> f32 {
        match self {
            TemperatureUnit::Celsius => degrees,
            TemperatureUnit::Fahrenheit => degrees * 9.0 / 5.0 + 32.0,
        }
    }
}

impl fmt::Display for TemperatureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemperatureUnit::Celsius => write!(f, "C"),
            TemperatureUnit::Fahrenheit => write!(f, "F"),
        }
    }
}

impl FromStr for TemperatureUnit {
    type Err = Error;

    /// Only the first letter counts, so `c`, `C` and `Celsius` all work.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().chars().next().map(|c| c.to_ascii_uppercase()) {
            Some('C') => Ok(TemperatureUnit::Celsius),
            Some('F') => Ok(TemperatureUnit::Fahrenheit),
            _ => Err(RangeError::Unit(s.to_string()).into()),
        }
    }
}

/// A setpoint with the thermostat's resolution of half a degree.
///
/// The value is in whatever unit the thermostat is currently set to; the
/// register holds the value multiplied by two.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature(f32);

impl Temperature {
    pub const TARGET_CELSIUS: RangeInclusive<f32> = 5.0..=35.0;
    pub const FLOOR_LIMIT_CELSIUS: RangeInclusive<f32> = 5.0..=45.0;
    /// Anything outside this range is a sensor or communication fault.
    pub const PLAUSIBLE: RangeInclusive<f32> = -40.0..=150.0;

    /// A target (or hold) temperature.
    pub fn target(value: f32, unit: TemperatureUnit) -> Result<Self, Error> {
        Self::checked(value, unit, Self::TARGET_CELSIUS)
    }

    /// A floor sensor limit temperature.
    pub fn floor_limit(value: f32, unit: TemperatureUnit) -> Result<Self, Error> {
        Self::checked(value, unit, Self::FLOOR_LIMIT_CELSIUS)
    }

    fn checked(
        value: f32,
        unit: TemperatureUnit,
        celsius: RangeInclusive<f32>,
    ) -> Result<Self, Error> {
        let min = unit.from_celsius(*celsius.start());
        let max = unit.from_celsius(*celsius.end());
        if (min..=max).contains(&value) {
            Ok(Self(value))
        } else {
            Err(RangeError::Temperature {
                value,
                min,
                max,
                unit,
            }
            .into())
        }
    }

    pub fn degrees(&self) -> f32 {
        self.0
    }

    pub fn encode_for_write_register(&self) -> u16 {
        (self.0 * 2.0).round() as u16
    }

    pub fn decode_from_register(raw: u16) -> Result<Self, Error> {
        let value = raw as f32 / 2.0;
        if Self::PLAUSIBLE.contains(&value) {
            Ok(Self(value))
        } else {
            Err(implausible("setpoint temperature", raw))
        }
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.0)
    }
}

pub const TARGET_TEMPERATURE_REG_ADDR: u16 = 0x0004;
pub const FLOOR_LIMIT_REG_ADDR: u16 = 0x0011;

/// Whole-degree register value reported when no sensor is fitted.
pub const NO_SENSOR: u16 = 0x8000;

/// Decodes a measured temperature spread over a whole-degree and a tenths
/// register. Both are signed so that e.g. -0.5 is `[0, -5]`.
fn measured_temperature_decode(
    attribute: &'static str,
    whole: u16,
    tenths: u16,
) -> Result<Option<f32>, Error> {
    if whole == NO_SENSOR {
        return Ok(None);
    }
    let signed_tenths = tenths as i16;
    if !(-9..=9).contains(&signed_tenths) {
        return Err(implausible(attribute, tenths));
    }
    let value = (whole as i16 as i32 * 10 + signed_tenths as i32) as f32 / 10.0;
    if Temperature::PLAUSIBLE.contains(&value) {
        Ok(Some(value))
    } else {
        Err(implausible(attribute, whole))
    }
}

/// Whether the heating output is switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    On,
    Off,
    /// The thermostat cannot report its relay (no output fitted or not yet known).
    Unknown,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayStatus::On => write!(f, "on"),
            RelayStatus::Off => write!(f, "off"),
            RelayStatus::Unknown => write!(f, "n/a"),
        }
    }
}

/// Thermostat on/off state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub const ADDRESS: u16 = 0x0010;

    pub fn encode_for_write_register(&self) -> u16 {
        match self {
            PowerState::On => 1,
            PowerState::Off => 0,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
        }
    }
}

const FLAG_POWER_ON: u16 = 0x0001;
const FLAG_RELAY_ACTIVE: u16 = 0x0002;
const FLAG_RELAY_UNAVAILABLE: u16 = 0x0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Schedule,
    Manual,
    Hold,
    FrostProtection,
    Holiday,
}

impl OperationMode {
    fn decode(raw: u16) -> Result<Self, Error> {
        match raw {
            0 => Ok(OperationMode::Schedule),
            1 => Ok(OperationMode::Manual),
            2 => Ok(OperationMode::Hold),
            3 => Ok(OperationMode::FrostProtection),
            4 => Ok(OperationMode::Holiday),
            _ => Err(implausible("operation mode", raw)),
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationMode::Schedule => "schedule",
            OperationMode::Manual => "manual",
            OperationMode::Hold => "hold",
            OperationMode::FrostProtection => "frost protection",
            OperationMode::Holiday => "holiday",
        };
        f.write_str(name)
    }
}

/// Snapshot of the thermostat decoded from one read of the status block.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatStatus {
    /// `None` if the thermostat has no air sensor.
    pub room_temperature: Option<f32>,
    /// `None` if no floor sensor is fitted.
    pub floor_temperature: Option<f32>,
    pub target_temperature: f32,
    pub relay_status: RelayStatus,
    pub power: PowerState,
    pub operation_mode: OperationMode,
    pub units: TemperatureUnit,
}

impl ThermostatStatus {
    pub const ADDRESS: u16 = 0x0000;
    pub const QUANTITY: u16 = 8;

    pub fn decode_from_holding_registers(words: &[u16]) -> Result<Self, Error> {
        check_quantity(words, Self::QUANTITY)?;
        let flags = words[5];
        let relay_status = if flags & FLAG_RELAY_UNAVAILABLE != 0 {
            RelayStatus::Unknown
        } else if flags & FLAG_RELAY_ACTIVE != 0 {
            RelayStatus::On
        } else {
            RelayStatus::Off
        };
        let power = if flags & FLAG_POWER_ON != 0 {
            PowerState::On
        } else {
            PowerState::Off
        };
        Ok(Self {
            room_temperature: measured_temperature_decode("room temperature", words[0], words[1])?,
            floor_temperature: measured_temperature_decode(
                "floor temperature",
                words[2],
                words[3],
            )?,
            target_temperature: Temperature::decode_from_register(words[4])?.degrees(),
            relay_status,
            power,
            operation_mode: OperationMode::decode(words[6])?,
            units: TemperatureUnit::decode(words[7])?,
        })
    }
}

/// How the firmware stores the length of a hold period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum HoldDurationEncoding {
    /// One register holding the number of minutes.
    #[default]
    Minutes,
    /// Hours in the high byte, minutes in the low byte.
    HoursMinutes,
}

/// Length of a temporary temperature override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldDuration(u16);

impl HoldDuration {
    /// 99:59, the longest hold the packed encoding can express.
    pub const MAX_MINUTES: u16 = 99 * 60 + 59;

    pub fn from_minutes(minutes: u16) -> Result<Self, Error> {
        if minutes <= Self::MAX_MINUTES {
            Ok(Self(minutes))
        } else {
            Err(RangeError::HoldDuration(minutes).into())
        }
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }

    pub fn encode(&self, encoding: HoldDurationEncoding) -> u16 {
        match encoding {
            HoldDurationEncoding::Minutes => self.0,
            HoldDurationEncoding::HoursMinutes => ((self.0 / 60) << 8) | (self.0 % 60),
        }
    }
}

impl fmt::Display for HoldDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Hold temperature and hold duration, written together.
pub struct Hold;

impl Hold {
    pub const ADDRESS: u16 = 0x0012;
    pub const QUANTITY: u16 = 2;

    pub fn encode_for_write_registers(
        temperature: Temperature,
        duration: HoldDuration,
        encoding: HoldDurationEncoding,
    ) -> [u16; 2] {
        [
            temperature.encode_for_write_register(),
            duration.encode(encoding),
        ]
    }
}

/// Clock fields as the thermostat keeps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    /// 1 = Monday to 7 = Sunday.
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl ClockTime {
    pub const ADDRESS: u16 = 0x0014;
    pub const QUANTITY: u16 = 4;

    pub fn from_datetime<T: Datelike + Timelike>(time: &T) -> Self {
        Self {
            weekday: time.weekday().number_from_monday() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second().min(59) as u8,
        }
    }

    pub fn encode_for_write_registers(&self) -> [u16; 4] {
        [
            self.weekday as u16,
            self.hour as u16,
            self.minute as u16,
            self.second as u16,
        ]
    }
}

/// A 4-digit keypad pin, `0000` to `9999`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin(u16);

impl Pin {
    pub const MAX: u16 = 9999;
}

impl TryFrom<u16> for Pin {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(RangeError::Pin(value).into())
        }
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Keypad lock setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLock {
    Unlocked,
    Locked(Pin),
}

impl KeyLock {
    pub const ADDRESS: u16 = 0x0018;
    pub const QUANTITY: u16 = 2;

    pub fn encode_for_write_registers(&self) -> [u16; 2] {
        match self {
            KeyLock::Unlocked => [0, 0],
            KeyLock::Locked(pin) => [1, pin.0],
        }
    }
}

impl From<Option<Pin>> for KeyLock {
    fn from(pin: Option<Pin>) -> Self {
        pin.map_or(KeyLock::Unlocked, KeyLock::Locked)
    }
}

/// Writing the trigger value restores the factory settings.
///
/// Modbus is disabled on the thermostat afterwards.
pub struct FactoryReset;

impl FactoryReset {
    pub const ADDRESS: u16 = 0x001F;
    pub const DATA: u16 = 0x00A5;

    pub fn encode_for_write_register() -> u16 {
        Self::DATA
    }
}
