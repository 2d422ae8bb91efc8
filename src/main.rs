//! Heatmiser Modbus thermostat CLI
//!
//! A command-line interface for Heatmiser thermostats connected to an RS485
//! bus via Modbus RTU.
//!
//! This tool allows users to:
//! - Display the thermostat status, including room and floor temperatures.
//! - Turn the thermostat on and off.
//! - Set the target, floor limit and hold temperatures.
//! - Switch between Celsius and Fahrenheit.
//! - Sync the thermostat clock with the system clock.
//! - Lock and unlock the keypad.
//! - Perform a factory reset.
//!
//! The CLI leverages the `hmmb_lib` crate for the protocol and the client.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use hmmb_lib::{
    client::{Client, ClientConfig},
    protocol as proto,
    queue::TransactionError,
    thermostat::Thermostat,
    transport::SerialTransport,
};
use log::*;
use std::panic;

mod commandline;
mod config;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn display_measurement(value: Option<f32>, units: proto::TemperatureUnit) -> String {
    match value {
        Some(value) => format!("{value:.1} °{units}"),
        None => String::from("n/a"),
    }
}

async fn print_status(thermostat: &Thermostat) -> Result<()> {
    let status = thermostat
        .read_status()
        .await
        .with_context(|| format!("Cannot read status of {}", thermostat.name()))?;
    let units = status.units;
    let relay_status = match status.relay_status {
        proto::RelayStatus::On => String::from("on 🔥"),
        other => other.to_string(),
    };
    println!("{}", thermostat.name());
    println!("      Relay Status: {relay_status}");
    println!(
        "  Room Temperature: {}",
        display_measurement(status.room_temperature, units)
    );
    println!(
        " Floor Temperature: {}",
        display_measurement(status.floor_temperature, units)
    );
    println!(
        "Target Temperature: {:.1} °{units}",
        status.target_temperature
    );
    println!("      On/Off State: {}", status.power);
    println!("    Operation Mode: {}", status.operation_mode);
    Ok(())
}

/// Prompts the user before the factory reset, which also disables Modbus.
fn confirm_factory_reset(thermostat_name: &str) -> Result<bool> {
    println!("WARNING: This will restore {thermostat_name} to its factory default settings.");
    println!(
        "Modbus support will be disabled after the reset; it has to be enabled again \
         on the thermostat's keypad before this tool can reach it."
    );
    Confirm::new()
        .with_prompt("Are you sure you want to proceed with the factory reset?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

async fn execute(thermostat: &Thermostat, command: &commandline::CliCommands) -> Result<()> {
    let name = thermostat.name();
    match command {
        commandline::CliCommands::GetStatus => {
            info!("Executing: Get Status");
            print_status(thermostat).await?;
        }
        commandline::CliCommands::TurnOn => {
            println!("Turning on: {name}");
            thermostat
                .turn_on()
                .await
                .with_context(|| format!("Failed to turn on {name}"))?;
        }
        commandline::CliCommands::TurnOff => {
            println!("Turning off: {name}");
            thermostat
                .turn_off()
                .await
                .with_context(|| format!("Failed to turn off {name}"))?;
        }
        commandline::CliCommands::SetTemperature { temperature } => {
            let units = thermostat.get_temperature_units().await?;
            println!("Setting target temperature of {name} to {temperature} °{units}");
            thermostat
                .set_target_temperature(*temperature)
                .await
                .with_context(|| format!("Failed to set target temperature to {temperature}"))?;
        }
        commandline::CliCommands::SetFloorLimit { temperature } => {
            let units = thermostat.get_temperature_units().await?;
            println!("Setting floor limit temperature of {name} to {temperature} °{units}");
            thermostat
                .set_floor_limit_temperature(*temperature)
                .await
                .with_context(|| {
                    format!("Failed to set floor limit temperature to {temperature}")
                })?;
        }
        commandline::CliCommands::SetHold {
            temperature,
            duration,
        } => {
            let units = thermostat.get_temperature_units().await?;
            println!("Setting temperature of {name} to {temperature} °{units} for {duration} minutes");
            thermostat
                .set_hold_temperature(*temperature, *duration)
                .await
                .with_context(|| {
                    format!("Failed to hold {temperature} for {duration} minutes")
                })?;
        }
        commandline::CliCommands::SetUnits { units } => {
            println!("Setting temperature units of {name} to {units}");
            thermostat
                .set_temperature_units(*units)
                .await
                .with_context(|| format!("Failed to set temperature units to {units}"))?;
        }
        commandline::CliCommands::SetTime => {
            let now = chrono::Local::now();
            println!("Setting time of {name} to {}", now.format("%A %H:%M:%S"));
            thermostat
                .set_time(&now)
                .await
                .with_context(|| "Failed to set time")?;
        }
        commandline::CliCommands::SetKeylock { pin } => {
            match pin {
                Some(pin) => println!("Locking keypad of {name} with pin {pin:04}"),
                None => println!("Unlocking keypad of {name}"),
            }
            thermostat
                .set_keylock(*pin)
                .await
                .with_context(|| "Failed to set keylock")?;
        }
        commandline::CliCommands::FactoryReset { .. } => {
            println!("Performing factory reset of {name}");
            if let Err(error) = thermostat.factory_reset().await {
                // Modbus goes off with the reset, so the acknowledgement may never come.
                if let hmmb_lib::Error::Transaction(TransactionError::Timeout(_)) = error {
                    debug!("Factory reset returned a timeout, can be ignored");
                } else {
                    return Err(error).context("Failed to perform factory reset");
                }
            }
            println!("NOTE: Modbus support is now disabled on {name}");
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "hmmb started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let config = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };

    let defaults = ClientConfig::default();
    let baud_rate = args.baud_rate.or(config.baud_rate).unwrap_or_default();
    let client_config = ClientConfig {
        timeout: args.timeout.or(config.timeout).unwrap_or(defaults.timeout),
        max_retries: args.retries.or(config.retries).unwrap_or(defaults.max_retries),
        silent_interval: baud_rate.silent_interval(),
        hold_encoding: config.hold_encoding.unwrap_or(defaults.hold_encoding),
    };
    let device = args
        .device
        .clone()
        .or_else(|| config.device.clone())
        .unwrap_or_else(commandline::default_device_name);

    let client = Client::new(client_config);
    let mut thermostat = client.add_thermostat(*args.id)?;
    if let Some(name) = config.thermostat_name(args.id) {
        thermostat = thermostat.with_name(name);
    }

    if let commandline::CliCommands::FactoryReset { yes: false } = args.command {
        if !confirm_factory_reset(thermostat.name())? {
            info!("Factory reset aborted by user.");
            return Ok(());
        }
    }

    info!("Connecting to {device} at {baud_rate} baud...");
    client
        .connect(&mut SerialTransport::new(device.as_str(), baud_rate))
        .await
        .with_context(|| format!("Cannot open serial port {device}"))?;

    let result = execute(&thermostat, &args.command).await;
    client.close().await;
    result
}
