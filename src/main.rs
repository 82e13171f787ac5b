//! gattkit command-line client
//!
//! Scan for peripherals and read, write or watch characteristics through the
//! system Bluetooth adapter.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use gattkit::ble::DuplicatePolicy;
use gattkit::util::common::{display_uuid, format_value, parse_uuid, parse_value};
use gattkit::{BleConfig, BleDevice, ConnectOptions, GattClient, PeerId, ScanFilter};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "gattkit")]
#[command(about = "BLE GATT client", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON); GATTKIT_* variables override it
    #[arg(short, long, default_value = "gattkit.toml")]
    config: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby peripherals
    Scan {
        /// Only report peripherals advertising this service
        #[arg(short, long)]
        service: Vec<String>,
        /// Scan duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        seconds: u64,
        /// Report every advertisement instead of once per peripheral
        #[arg(long)]
        all: bool,
    },
    /// Read a characteristic
    Read {
        device: String,
        characteristic: String,
    },
    /// Write a hex payload to a characteristic
    Write {
        device: String,
        characteristic: String,
        value: String,
    },
    /// Print notifications from a characteristic
    Watch {
        device: String,
        characteristic: String,
        /// Stop after this many seconds
        #[arg(short = 't', long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = load_config(&cli.config)?;
    let client = GattClient::with_btleplug(config)
        .await
        .context("Failed to open Bluetooth adapter")?;
    client.central().wait_ready().await?;
    info!("📡 Adapter ready");

    match cli.command {
        Commands::Scan {
            service,
            seconds,
            all,
        } => cmd_scan(&client, service, seconds, all).await,
        Commands::Read {
            device,
            characteristic,
        } => cmd_read(&client, &device, &characteristic).await,
        Commands::Write {
            device,
            characteristic,
            value,
        } => cmd_write(&client, &device, &characteristic, &value).await,
        Commands::Watch {
            device,
            characteristic,
            seconds,
        } => cmd_watch(&client, &device, &characteristic, seconds).await,
    }
}

#[cfg(feature = "config-file")]
fn load_config(path: &str) -> Result<BleConfig> {
    BleConfig::load(path).with_context(|| format!("Failed to load configuration from {}", path))
}

#[cfg(not(feature = "config-file"))]
fn load_config(_path: &str) -> Result<BleConfig> {
    Ok(BleConfig::default())
}

async fn cmd_scan(
    client: &GattClient,
    services: Vec<String>,
    seconds: u64,
    all: bool,
) -> Result<()> {
    let mut filter = ScanFilter::new();
    for service in &services {
        filter = filter.with_service(parse_uuid(service)?);
    }
    if all {
        filter = filter.with_duplicates(DuplicatePolicy::EmitAll);
    }

    info!("🔍 Scanning for {}s...", seconds);
    let mut sightings = client
        .scan(filter)
        .take_until(tokio::time::sleep(Duration::from_secs(seconds)));
    let mut count = 0;
    while let Some(sighting) = sightings.next().await {
        let sighting = sighting?;
        count += 1;
        let services: Vec<String> = sighting
            .advertisement
            .services
            .iter()
            .map(display_uuid)
            .collect();
        println!(
            "{}  {:>4} dBm  {}  [{}]",
            sighting.device.identifier(),
            sighting.rssi,
            sighting.device.name().unwrap_or("<unnamed>"),
            services.join(", ")
        );
    }
    info!("Found {} peripheral(s)", count);
    Ok(())
}

/// Resolve a device the host already knows, falling back to a short scan
async fn find_device(client: &GattClient, id: &str) -> Result<BleDevice> {
    let peer = PeerId::from(id);
    if let Some(device) = client.retrieve_devices(&[peer.clone()]).await?.pop() {
        return Ok(device);
    }

    info!("🔍 Looking for {}...", peer);
    let mut sightings = client
        .scan(ScanFilter::new())
        .take_until(tokio::time::sleep(Duration::from_secs(15)));
    while let Some(sighting) = sightings.next().await {
        let sighting = sighting?;
        if sighting.device.identifier() == &peer {
            return Ok(sighting.device);
        }
    }
    Err(anyhow!("Peripheral {} not found", peer))
}

async fn connected_device(client: &GattClient, id: &str) -> Result<BleDevice> {
    let device = find_device(client, id).await?;
    client.connect(&device, ConnectOptions::default()).await?;
    info!("✅ Connected to {}", device.identifier());
    Ok(device)
}

async fn cmd_read(client: &GattClient, id: &str, characteristic: &str) -> Result<()> {
    let characteristic = parse_uuid(characteristic)?;
    let device = connected_device(client, id).await?;
    let result = client.read(&device, characteristic).await;
    client.disconnect(&device).await;
    println!("{}", format_value(&result?));
    Ok(())
}

async fn cmd_write(
    client: &GattClient,
    id: &str,
    characteristic: &str,
    value: &str,
) -> Result<()> {
    let characteristic = parse_uuid(characteristic)?;
    let data = parse_value(value).context("Value must be hex")?;
    let device = connected_device(client, id).await?;
    let result = client.write(&device, characteristic, data).await;
    client.disconnect(&device).await;
    let echoed = result?;
    info!("✍️ Wrote {} to {}", format_value(&echoed), display_uuid(&characteristic));
    Ok(())
}

async fn cmd_watch(
    client: &GattClient,
    id: &str,
    characteristic: &str,
    seconds: Option<u64>,
) -> Result<()> {
    let characteristic = parse_uuid(characteristic)?;
    let device = connected_device(client, id).await?;

    let watch = async {
        let mut subscription = client.subscribe(&device, characteristic);
        let Some(notifications) = subscription.next().await else {
            return Ok(());
        };
        let mut notifications = notifications?;
        info!("🔔 Watching {}", display_uuid(&characteristic));
        while let Some(value) = notifications.next().await {
            match value {
                Ok(value) => println!("{}", format_value(&value)),
                Err(e) => {
                    warn!("Notifications ended: {}", e);
                    break;
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    let result = match seconds {
        Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), watch)
            .await
            .unwrap_or(Ok(())),
        None => tokio::select! {
            result = watch => result,
            _ = tokio::signal::ctrl_c() => Ok(()),
        },
    };
    client.disconnect(&device).await;
    result
}
