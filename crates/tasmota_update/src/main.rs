use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tasmota_update::Config;
use tasmota_update::DeviceStatusClient;
use tasmota_update::ReleaseFeedClient;
use tasmota_update::UpdateAggregator;
use tasmota_update::api;
use tasmota_update::cli;
use tasmota_update::cli::Cli;
use tasmota_update::cli::Command;
use tasmota_update::mqtt::RumqttcClient;
use tracing_subscriber::prelude::*;

type Aggregator = UpdateAggregator<RumqttcClient, ReleaseFeedClient>;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets())
        .init();

    tracing::info!("Loaded config from: {}", cli.config.display());

    let feed =
        ReleaseFeedClient::new(&config.feed).context("Failed to create release feed client")?;
    let device_client = DeviceStatusClient::new(
        RumqttcClient::new(&config.mqtt),
        config.mqtt.response_timeout(),
    );
    let aggregator: Aggregator = UpdateAggregator::new(device_client, feed).with_span(
        tracing::info_span!("firmware_update", broker = %config.mqtt.broker),
    );

    tracing::info!(
        "Connecting to MQTT broker at {}:{}",
        config.mqtt.broker,
        config.mqtt.port
    );
    aggregator
        .device_client()
        .connect()
        .await
        .context("Failed to connect to MQTT broker")?;

    let devices = config.devices();

    let exit = match cli.command {
        Command::Check { devices: requested } => {
            let selected = cli::select_devices(&devices, &requested)?;
            let failures = cli::check(&aggregator, &selected, &mut std::io::stdout()).await?;
            disconnect(&aggregator).await;
            if failures > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Install { device } => {
            let selected = cli::select_devices(&devices, std::slice::from_ref(&device))?;
            for device in &selected {
                aggregator
                    .install_firmware(&device.topic)
                    .await
                    .with_context(|| format!("Failed to start upgrade of {}", device.name))?;
                println!("{}: upgrade requested", device.name);
            }
            disconnect(&aggregator).await;
            ExitCode::SUCCESS
        }
        Command::Serve => {
            serve(&config, aggregator, devices).await?;
            ExitCode::SUCCESS
        }
    };

    Ok(exit)
}

async fn disconnect(aggregator: &Aggregator) {
    if let Err(e) = aggregator.device_client().disconnect().await {
        tracing::warn!("Failed to disconnect from MQTT broker: {}", e);
    }
}

async fn serve(
    config: &Config,
    aggregator: Aggregator,
    devices: std::collections::BTreeMap<String, tasmota_update::Device>,
) -> anyhow::Result<()> {
    let api_config = config
        .api
        .as_ref()
        .context("The [api] section is required to serve")?;

    let state_aggregator = Arc::new(aggregator);
    let state = Arc::new(api::AppState {
        version: env!("CARGO_PKG_VERSION"),
        aggregator: state_aggregator.clone(),
        devices,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn({
        let listen = api_config.listen.clone();
        let port = api_config.port;
        async move { api::serve(&listen, port, state, shutdown_rx).await }
    });

    tracing::info!("Press Ctrl+C to exit");

    // Wait for Ctrl+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    let _ = shutdown_tx.send(());
    server.await??;
    disconnect(&state_aggregator).await;

    tracing::info!("tasmota-update shutdown complete");
    Ok(())
}
