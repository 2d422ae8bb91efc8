use anyhow::{Context, Result};
use hmmb_lib::protocol as proto;
use serde::Deserialize;
use std::{fs::File, path::Path, time::Duration};

/// Display name of one thermostat on the bus.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ThermostatConfig {
    pub id: proto::DeviceAddress,
    pub name: String,
}

/// Contents of the optional YAML configuration file.
///
/// ```yaml
/// device: /dev/ttyUSB0
/// baud_rate: 9600
/// timeout: 500ms
/// retries: 2
/// hold_encoding: minutes
/// thermostats:
///   - id: 1
///     name: Living room
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub device: Option<String>,
    pub baud_rate: Option<proto::BaudRate>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub retries: Option<u8>,
    pub hold_encoding: Option<proto::HoldDurationEncoding>,
    #[serde(default)]
    pub thermostats: Vec<ThermostatConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {path:?}");
        let file =
            File::open(path).with_context(|| format!("Cannot open config file {path:?}"))?;
        serde_yaml::from_reader(file).with_context(|| format!("Cannot parse config file {path:?}"))
    }

    /// The configured name of thermostat `id`, if any.
    pub fn thermostat_name(&self, id: proto::DeviceAddress) -> Option<&str> {
        self.thermostats
            .iter()
            .find(|thermostat| thermostat.id == id)
            .map(|thermostat| thermostat.name.as_str())
    }
}
