use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use tuya_ble_bridge_lib::config::{BridgeConfig, DEFAULT_CONFIG_FILE};
use tuya_ble_bridge_lib::core::bluetooth::DEFAULT_SCAN_DURATION_SECS;
use tuya_ble_bridge_lib::core::{
    BluetoothManager, PollOutcome, Poller, SensorProfile, once_exit_code,
};
use tuya_ble_bridge_lib::logging;
use tuya_ble_bridge_lib::publish::{BusClient, MqttBus, Publisher, PublisherSettings, Topics};

const EXIT_CONFIG: u8 = 2;

/// Bridges Tuya BLE sensors to Home Assistant over MQTT.
#[derive(Parser, Debug)]
#[command(name = "tuya-ble-bridge", version, about)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// List nearby Tuya BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = DEFAULT_SCAN_DURATION_SECS)]
        duration: u64,
    },
    /// Poll every configured sensor once and exit
    Once,
    /// Poll continuously until interrupted (default)
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let config = BridgeConfig::load_config(&cli.config).await;
    let level = match &config {
        Ok(config) => config.logging.level.as_str(),
        Err(_) => "info",
    };
    logging::init(logging::effective_level(level, cli.verbose));

    let result = match (command, config) {
        (Command::Scan { duration }, _) => scan(Duration::from_secs(duration)).await,
        (_, Err(e)) => {
            error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
        (Command::Once, Ok(config)) => once(config).await,
        (Command::Run, Ok(config)) => run(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn scan(duration: Duration) -> Result<ExitCode> {
    let transport = Arc::new(
        BluetoothManager::new()
            .await
            .context("Failed to open Bluetooth adapter")?,
    );
    let poller = Poller::new(transport, Vec::new(), Default::default());
    let devices = poller.scan(duration).await.context("Scan failed")?;

    if devices.is_empty() {
        println!("No Tuya BLE devices found.");
    }
    for device in devices {
        println!(
            "{}  {:>5}  {}",
            device.address,
            device.rssi.map_or_else(|| "?".to_string(), |rssi| rssi.to_string()),
            device.name.as_deref().unwrap_or("<unnamed>")
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// The pieces shared by `once` and `run`.
struct Bridge {
    poller: Poller<BluetoothManager>,
    bus: Arc<MqttBus>,
    publisher: tokio::task::JoinHandle<()>,
}

async fn start(config: BridgeConfig) -> Result<Bridge> {
    let transport = Arc::new(
        BluetoothManager::new()
            .await
            .context("Failed to open Bluetooth adapter")?,
    );

    let topics = Topics::new(&config.homeassistant);
    let bus = Arc::new(
        MqttBus::start(&config.mqtt, &topics)
            .await
            .context("Failed to configure the MQTT connection")?,
    );
    let (handle, publisher) = Publisher::new(
        Arc::clone(&bus),
        topics,
        &config.sensors,
        SensorProfile::default(),
        PublisherSettings::default(),
    )
    .spawn();

    let poller = Poller::new(transport, config.sensors, config.polling).with_publisher(handle);
    Ok(Bridge {
        poller,
        bus,
        publisher,
    })
}

async fn once(config: BridgeConfig) -> Result<ExitCode> {
    let Bridge {
        mut poller,
        bus,
        publisher,
    } = start(config).await?;

    let outcomes = poller.run_once().await;
    for outcome in &outcomes {
        print_outcome(outcome);
    }

    // Give the broker a chance to come up before the queue is flushed.
    wait_connected(&bus, Duration::from_secs(10)).await;
    drop(poller);
    finish(bus, publisher).await;

    Ok(ExitCode::from(once_exit_code(&outcomes)))
}

async fn run(config: BridgeConfig) -> Result<ExitCode> {
    let Bridge {
        mut poller,
        bus,
        publisher,
    } = start(config).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    poller.run_continuous(shutdown).await;
    drop(poller);
    finish(bus, publisher).await;
    Ok(ExitCode::SUCCESS)
}

async fn wait_connected(bus: &MqttBus, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !bus.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !bus.is_connected() {
        warn!("MQTT broker still unreachable, queued messages may be lost");
    }
}

async fn finish(bus: Arc<MqttBus>, publisher: tokio::task::JoinHandle<()>) {
    match tokio::time::timeout(Duration::from_secs(15), publisher).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Publisher task failed: {}", e),
        Err(_) => warn!("Publisher did not drain in time"),
    }
    bus.close().await;
}

fn print_outcome(outcome: &PollOutcome) {
    match &outcome.result {
        Ok(reading) => println!("{} ({}): {}", outcome.name, outcome.unique_id, reading.summary()),
        Err(failure) => println!(
            "{} ({}): FAILED [{}] after {} attempt(s): {}",
            outcome.name,
            outcome.unique_id,
            failure.kind(),
            outcome.attempts,
            failure
        ),
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down..."),
                    _ = terminate.recv() => info!("Terminated, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Interrupted, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupted, shutting down...");
    }
    shutdown.cancel();
}
