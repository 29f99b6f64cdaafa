//! Command-line interface.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

use crate::device::Device;
use crate::error::UpdateError;
use crate::feed::ReleaseFeed;
use crate::mqtt::MqttClient;
use crate::update::UpdateAggregator;
use crate::update::UpdateStatus;

#[derive(Debug, Parser)]
#[command(
    name = "tasmota-update",
    version,
    about = "Check and install firmware updates for Tasmota devices"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tasmota-update.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compare installed firmware against the latest release
    Check {
        /// Device ids to check; all configured devices if omitted
        devices: Vec<String>,
    },

    /// Ask a device to upgrade its firmware
    Install {
        /// Device id
        device: String,
    },

    /// Serve the HTTP API until interrupted
    Serve,
}

pub fn render_status(status: &UpdateStatus) -> String {
    let verdict = if status.update_available() {
        "update available"
    } else {
        "up to date"
    };
    format!(
        "{}: {} -> {} ({})",
        status.display_name, status.installed_version, status.latest_version, verdict
    )
}

pub fn render_failure(device: &Device, error: &UpdateError) -> String {
    format!("{}: update check failed: {}", device.name, error)
}

/// Resolve requested device ids; an empty request selects every device
pub fn select_devices(
    devices: &BTreeMap<String, Device>,
    requested: &[String],
) -> Result<Vec<Device>, UpdateError> {
    if requested.is_empty() {
        return Ok(devices.values().cloned().collect());
    }

    requested
        .iter()
        .map(|id| {
            devices
                .get(id)
                .cloned()
                .ok_or_else(|| UpdateError::UnknownDevice(id.clone()))
        })
        .collect()
}

/// Check each device and write one line per device to `out`
///
/// Returns the number of devices whose check failed.
pub async fn check<C, F>(
    aggregator: &UpdateAggregator<C, F>,
    devices: &[Device],
    out: &mut impl Write,
) -> std::io::Result<usize>
where
    C: MqttClient,
    F: ReleaseFeed,
{
    let mut failures = 0;
    for device in devices {
        let line = match aggregator.check(device).await {
            Ok(status) => render_status(&status),
            Err(e) => {
                failures += 1;
                render_failure(device, &e)
            }
        };
        writeln!(out, "{}", line)?;
    }
    Ok(failures)
}
