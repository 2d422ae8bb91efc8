//! Per-device handle.
//!
//! A [`Thermostat`] binds a [`DeviceAddress`] to a [`Client`] and takes plain
//! values (degrees, minutes, pins), validating them before anything is sent.
//! Temperatures are in the unit the thermostat was last seen to use; until
//! that is known Celsius is assumed. The client keeps that unit per device,
//! so every handle for the same address agrees on it.

use crate::{
    client::Client,
    error::Result,
    protocol::{self as proto, DeviceAddress, TemperatureUnit},
};
use chrono::{Datelike, Timelike};

/// Handle to one thermostat on the bus. Clones share the connection.
#[derive(Debug, Clone)]
pub struct Thermostat {
    client: Client,
    address: DeviceAddress,
    name: String,
}

impl Thermostat {
    pub(crate) fn new(client: Client, address: DeviceAddress) -> Self {
        Self {
            client,
            address,
            name: format!("Thermostat #{address}"),
        }
    }

    /// Replaces the default `Thermostat #<id>` name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// The unit temperatures are currently given in.
    pub fn units(&self) -> TemperatureUnit {
        self.client.temperature_units(self.address)
    }

    pub async fn get_temperature_units(&self) -> Result<TemperatureUnit> {
        self.client.get_temperature_units(self.address).await
    }

    pub async fn read_status(&self) -> Result<proto::ThermostatStatus> {
        self.client.read_status(self.address).await
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.client.turn_on(self.address).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.client.turn_off(self.address).await
    }

    pub async fn set_target_temperature(&self, degrees: f32) -> Result<()> {
        let temperature = proto::Temperature::target(degrees, self.units())?;
        self.client
            .set_target_temperature(self.address, temperature)
            .await
    }

    pub async fn set_floor_limit_temperature(&self, degrees: f32) -> Result<()> {
        let temperature = proto::Temperature::floor_limit(degrees, self.units())?;
        self.client
            .set_floor_limit_temperature(self.address, temperature)
            .await
    }

    /// Holds `degrees` for `minutes`, after which the schedule resumes.
    pub async fn set_hold_temperature(&self, degrees: f32, minutes: u16) -> Result<()> {
        let temperature = proto::Temperature::target(degrees, self.units())?;
        let duration = proto::HoldDuration::from_minutes(minutes)?;
        self.client
            .set_hold_temperature(self.address, temperature, duration)
            .await
    }

    pub async fn set_temperature_units(&self, units: TemperatureUnit) -> Result<()> {
        self.client.set_temperature_units(self.address, units).await
    }

    /// Sets the thermostat clock, e.g. from `chrono::Local::now()`.
    pub async fn set_time<T: Datelike + Timelike>(&self, time: &T) -> Result<()> {
        self.client
            .set_time(self.address, proto::ClockTime::from_datetime(time))
            .await
    }

    /// Locks the keypad with `pin`, or unlocks it with `None`.
    pub async fn set_keylock(&self, pin: Option<u16>) -> Result<()> {
        let pin = pin.map(proto::Pin::try_from).transpose()?;
        self.client
            .set_keylock(self.address, proto::KeyLock::from(pin))
            .await
    }

    pub async fn factory_reset(&self) -> Result<()> {
        self.client.factory_reset(self.address).await
    }
}
