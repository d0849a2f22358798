// blebridge: desktop harness for the BLE bridge core
//
// Runs the bridge against a simulated radio and manages the CLI config file.

mod config;
mod logging;
mod sim;

use anyhow::{Context, Result};
use blebridge_core::{
    uuid_from_short, BleBridge, BridgeError, ConnectionPhase, DuplicatePolicy, GattTarget,
    Notification, NotificationStream, PeripheralId, ScanFilter, ScanRequest,
};
use clap::{Parser, Subcommand};
use colored::*;
use config::CliConfig;
use sim::SimulatedRadio;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "blebridge")]
#[command(about = "BLE Bridge: central-role Bluetooth LE bridge", long_about = None)]
#[command(version = blebridge_core::VERSION)]
struct Cli {
    /// Debug logging for the bridge crates
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan, connect and stream heart rate from simulated peripherals
    Simulate {
        /// Number of simulated devices (overrides config)
        #[arg(short, long)]
        devices: Option<usize>,
        /// Scan duration in seconds
        #[arg(long, default_value = "2")]
        scan_secs: u64,
        /// How long to stream notifications, in seconds
        #[arg(long, default_value = "5")]
        stream_secs: u64,
        /// Report every advertisement instead of first sighting only
        #[arg(long)]
        all_advertisements: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    Set {
        key: String,
        value: String,
    },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = CliConfig::load();

    let log_dir = cli.log_dir.clone().or_else(|| {
        loaded
            .as_ref()
            .ok()
            .and_then(|c| c.log_dir.as_ref().map(PathBuf::from))
    });
    let _logging = logging::init(cli.verbose, log_dir.as_deref())?;

    match cli.command {
        // Must work even when the existing file is broken
        Commands::Config {
            action: ConfigAction::Init { force },
        } => cmd_config_init(force),
        Commands::Config { action } => cmd_config(loaded?, action),
        Commands::Simulate {
            devices,
            scan_secs,
            stream_secs,
            all_advertisements,
        } => {
            cmd_simulate(
                loaded?,
                devices,
                Duration::from_secs(scan_secs),
                Duration::from_secs(stream_secs),
                all_advertisements,
            )
            .await
        }
    }
}

fn cmd_config_init(force: bool) -> Result<()> {
    let path = CliConfig::config_file()?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    CliConfig::default().save_to(&path)?;
    println!("{} Wrote default config: {}", "✓".green(), path.display());
    Ok(())
}

fn cmd_config(mut config: CliConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Init { force } => cmd_config_init(force)?,

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => {
            println!("{}", CliConfig::config_file()?.display());
        }
    }

    Ok(())
}

async fn cmd_simulate(
    config: CliConfig,
    devices: Option<usize>,
    scan_for: Duration,
    stream_for: Duration,
    all_advertisements: bool,
) -> Result<()> {
    let mut sim_config = config.simulator.clone();
    if let Some(devices) = devices {
        sim_config.devices = devices;
    }

    println!("{}", "Starting BLE bridge (simulated radio)".bold());
    println!(
        "  {} {} simulated heart-rate monitors",
        "•".bright_green(),
        sim_config.devices
    );
    println!();

    let (bridge, mut notifications) =
        BleBridge::spawn(config.bridge.clone(), |sink| SimulatedRadio::new(sink, sim_config))
            .context("Failed to start bridge")?;

    // Scan

    let policy = if all_advertisements {
        DuplicatePolicy::All
    } else {
        DuplicatePolicy::FirstSeenOnly
    };
    let heart_rate = uuid_from_short(sim::HEART_RATE_SERVICE.into());
    let request = ScanRequest::default()
        .with_filter(ScanFilter::services(vec![heart_rate]))
        .with_policy(policy)
        .with_duration(scan_for);
    let session = bridge.start_scan(request).await?;
    println!("{} (session {}, {:?})", "Scanning".bold(), session, scan_for);

    let mut found = Vec::new();
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::DeviceDiscovered { peripheral, .. } => {
                println!(
                    "  {} [{}] {} {} dBm",
                    "+".bright_green(),
                    timestamp().dimmed(),
                    peripheral.id.as_str().bright_cyan(),
                    peripheral.rssi
                );
                if !found.contains(&peripheral.id) {
                    found.push(peripheral.id);
                }
            }
            Notification::ScanStopped { reason, .. } => {
                println!("  Scan stopped: {:?}", reason);
                break;
            }
            other => print_notification(&other),
        }
    }
    println!();

    if found.is_empty() {
        println!("{}", "No devices found.".dimmed());
        bridge.shutdown().await?;
        return Ok(());
    }

    // Connect and read

    let measurement = GattTarget::new(heart_rate, uuid_from_short(sim::HEART_RATE_MEASUREMENT.into()));
    let location = GattTarget::new(heart_rate, uuid_from_short(sim::BODY_SENSOR_LOCATION.into()));
    let battery = GattTarget::new(
        uuid_from_short(sim::BATTERY_SERVICE.into()),
        uuid_from_short(sim::BATTERY_LEVEL.into()),
    );

    let mut ready = Vec::new();
    for id in &found {
        match connect_and_read(&bridge, id, location, battery).await {
            Ok(()) => ready.push(id.clone()),
            Err(e) => println!("  {} {}: {}", "✗".red(), id.as_str().bright_cyan(), e),
        }
    }
    println!();

    // Stream notifications

    for id in &ready {
        bridge.subscribe(id, measurement).await?.await?;
    }
    if !ready.is_empty() {
        println!("{} for {:?}", "Streaming heart rate".bold(), stream_for);
        stream(&mut notifications, stream_for).await;
        println!();
    }

    for id in &ready {
        bridge.unsubscribe(id, measurement).await?.await?;
        bridge.disconnect(id).await?.await?;
        println!("  {} Disconnected {}", "✓".green(), id.as_str().bright_cyan());
    }

    bridge.shutdown().await?;
    println!();
    println!("{}", "Done.".green().bold());
    Ok(())
}

async fn connect_and_read(
    bridge: &BleBridge,
    id: &PeripheralId,
    location: GattTarget,
    battery: GattTarget,
) -> Result<(), BridgeError> {
    let info = bridge.connect(id).await?.await?;
    println!(
        "  {} Connected {} ({} services, MTU {})",
        "✓".green(),
        id.as_str().bright_cyan(),
        info.services.len(),
        info.mtu
    );

    // Both reads are queued before either resolves
    let location = bridge.read(id, location).await?;
    let battery = bridge.read(id, battery).await?;
    let location = location.await?.unwrap_or_default();
    let battery = battery.await?.unwrap_or_default();
    println!(
        "    sensor location: {}  battery: {}%",
        describe_location(location.first().copied()),
        battery.first().copied().unwrap_or(0)
    );

    let status = bridge.connection_status(id).await?;
    if status.phase != ConnectionPhase::Ready {
        tracing::warn!(
            "{} left ready state during reads: {} ({:?})",
            id,
            status.phase,
            status.last_error
        );
    }
    Ok(())
}

async fn stream(notifications: &mut NotificationStream, duration: Duration) {
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            notification = notifications.recv() => match notification {
                Some(n) => print_notification(&n),
                None => break,
            },
        }
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::ValueChanged { id, value, .. } => {
            let bpm = value.get(1).copied().unwrap_or(0);
            println!(
                "  [{}] {} {} bpm",
                timestamp().dimmed(),
                id.as_str().bright_cyan(),
                bpm.to_string().bright_yellow()
            );
        }
        Notification::ConnectionStateChanged { id, phase } => {
            tracing::debug!("{} -> {}", id, phase);
        }
        Notification::UnexpectedDisconnect { id, error } => {
            println!("  {} {} dropped: {}", "!".bright_red(), id.as_str().bright_cyan(), error);
        }
        Notification::MtuChanged { id, mtu } => {
            println!("  {} MTU {}", id.as_str().bright_cyan(), mtu);
        }
        Notification::AdapterStateChanged { powered_on } => {
            println!("  Adapter powered {}", if *powered_on { "on" } else { "off" });
        }
        Notification::DeviceDiscovered { .. } | Notification::ScanStopped { .. } => {}
    }
}

fn describe_location(code: Option<u8>) -> &'static str {
    match code {
        Some(0) => "other",
        Some(1) => "chest",
        Some(2) => "wrist",
        Some(3) => "finger",
        Some(4) => "hand",
        Some(5) => "ear lobe",
        Some(6) => "foot",
        _ => "unknown",
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}
