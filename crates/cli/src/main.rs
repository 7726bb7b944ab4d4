use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pulsewire_core::protocol::{five_byte, heart_rate, CommandPacket};
use pulsewire_core::{
    BiosensorService, Config, DeviceDescriptor, DeviceRole, FramedCodec, FramedCommand, Reading,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pulsewire")]
#[command(about = "Pulse oximeter and heart-rate monitor toolkit for Bluetooth LE sensors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, or TOML by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices playing a role
    Scan {
        /// pulse-ox or hr-monitor
        #[arg(short, long)]
        role: DeviceRole,
        /// How long to scan
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect and stream readings until Ctrl-C
    Monitor {
        #[arg(short, long)]
        role: DeviceRole,
        /// Only connect to this device id
        #[arg(long)]
        device: Option<String>,
        /// Keep the session alive across short dropouts
        #[arg(long)]
        session: bool,
        /// Print readings as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Decode a captured notification offline
    Decode {
        #[arg(short, long, value_enum)]
        protocol: WireProtocol,
        /// Frame bytes as hex; spaces and colons are ignored
        hex: String,
    },
    /// Print an encoded framed-protocol command
    Command {
        /// info, ping or realtime
        name: String,
        #[arg(short, long, default_value_t = 0)]
        sequence: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WireProtocol {
    FiveByte,
    Framed,
    HeartRate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Initialize logging
    let filter = if cli.debug || config.verbose_logging {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Scan { role, seconds } => scan(config, role, Duration::from_secs(seconds)).await,
        Commands::Monitor {
            role,
            device,
            session,
            json,
        } => monitor(config, role, device, session, json).await,
        Commands::Decode { protocol, hex } => decode(&config, protocol, &hex),
        Commands::Command { name, sequence } => encode_command(&name, sequence),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            let default = Config::default_path();
            if default.exists() {
                Config::load_from_file(&default)
                    .with_context(|| format!("Failed to load config from {}", default.display()))
            } else {
                Ok(Config::default())
            }
        }
    }
}

async fn start_service(config: Config) -> Result<BiosensorService> {
    let service = BiosensorService::new(config).await?;
    if !service.request_permissions().await? {
        bail!("Bluetooth permission denied");
    }
    if !service.is_radio_enabled().await? {
        bail!("No Bluetooth adapter found. Is Bluetooth enabled?");
    }
    service
        .acquire_reference()
        .await
        .context("Failed to initialize Bluetooth")?;
    Ok(service)
}

async fn scan(config: Config, role: DeviceRole, duration: Duration) -> Result<()> {
    let service = start_service(config).await?;

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    service.on_device_found(move |descriptor| {
        let _ = found_tx.send(descriptor.clone());
    });

    println!("🔍 Scanning for {} devices for {}s...", role, duration.as_secs());
    service.start_scan(role).await?;

    let mut devices: BTreeMap<String, DeviceDescriptor> = BTreeMap::new();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(descriptor) = found_rx.recv() => {
                println!("  📱 {} ({}) RSSI: {}", descriptor.display_name(), descriptor.id, rssi_label(&descriptor));
                devices.insert(descriptor.id.clone(), descriptor);
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.stop_scan().await;
    service.release_reference().await;

    if devices.is_empty() {
        println!("No {} devices found", role);
    } else {
        println!("Found {} device(s):", devices.len());
        for descriptor in devices.values() {
            let protocol = descriptor
                .protocol_hint()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "by name".to_string());
            println!("  {} - {} [{}]", descriptor.id, descriptor.display_name(), protocol);
        }
    }
    Ok(())
}

async fn monitor(
    config: Config,
    role: DeviceRole,
    device: Option<String>,
    session: bool,
    json: bool,
) -> Result<()> {
    let service = start_service(config).await?;

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    service.on_device_found(move |descriptor| {
        let _ = found_tx.send(descriptor.clone());
    });
    service.on_reading(move |role, reading| print_reading(role, reading, json));
    service.on_device_info(|role, info| {
        println!(
            "ℹ️  {} model {} serial {} firmware {}",
            role,
            info.model.as_deref().unwrap_or("?"),
            info.serial_number.as_deref().unwrap_or("?"),
            info.software_version.as_deref().unwrap_or("?")
        );
    });
    service.on_connection_status(|role, connected| {
        if connected {
            println!("🤝 {} connected", role);
        } else {
            println!("❌ {} disconnected", role);
        }
    });

    let (terminated_tx, mut terminated_rx) = mpsc::unbounded_channel();
    service.on_session_terminated(move |role| {
        let _ = terminated_tx.send(role);
    });

    if session {
        service.begin_session().await;
    }
    service.start_scan(role).await?;
    println!("🔍 Waiting for a {} device (Ctrl-C to stop)...", role);

    loop {
        tokio::select! {
            Some(descriptor) = found_rx.recv() => {
                if device.as_deref().is_some_and(|id| id != descriptor.id) {
                    continue;
                }
                println!("🔗 Connecting to {} ({})", descriptor.display_name(), descriptor.id);
                if let Err(e) = service.connect(&descriptor).await {
                    warn!("Connection to {} failed: {}", descriptor.short_id(), e);
                }
            }
            Some(role) = terminated_rx.recv() => {
                println!("⏹️ Session terminated: {} did not reconnect", role);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    service.shutdown().await?;
    service.release_reference().await;
    info!("Monitor stopped");
    println!("👋 Goodbye!");
    Ok(())
}

fn print_reading(role: DeviceRole, reading: &Reading, json: bool) {
    if json {
        match serde_json::to_string(reading) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize reading: {}", e),
        }
        return;
    }

    let mut line = format!("[{}] {}", reading.timestamp.format("%H:%M:%S%.3f"), role);
    if let Some(spo2) = reading.spo2 {
        line.push_str(&format!(" SpO2 {}%", spo2));
    }
    if let Some(pulse) = reading.pulse_rate {
        line.push_str(&format!(" pulse {} bpm", pulse));
    }
    if let Some(pi) = reading.perfusion_index {
        line.push_str(&format!(" PI {:.1}", pi));
    }
    if !reading.rr_intervals.is_empty() {
        let rr: Vec<String> = reading.rr_intervals.iter().map(|rr| format!("{:.0}", rr)).collect();
        line.push_str(&format!(" RR [{}]", rr.join(", ")));
    }
    if let Some(hrv) = &reading.hrv {
        for result in [&hrv.quick, &hrv.real].into_iter().flatten() {
            line.push_str(&format!(
                " {:?} RMSSD {:.1} ms ({}, n={})",
                result.timeframe, result.rmssd, result.stage, result.interval_count
            ));
        }
    }
    if !reading.has_vitals() {
        line.push_str(" (no vitals)");
    }
    println!("{}", line);
}

fn rssi_label(descriptor: &DeviceDescriptor) -> String {
    descriptor
        .rssi
        .map(|rssi| format!("{}dBm", rssi))
        .unwrap_or_else(|| "?".to_string())
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("Invalid hex: {}", input))
}

fn decode(config: &Config, protocol: WireProtocol, input: &str) -> Result<()> {
    let data = parse_hex(input)?;

    let reading = match protocol {
        WireProtocol::FiveByte => five_byte::decode_notification(&data),
        WireProtocol::HeartRate => heart_rate::decode_measurement(&data),
        WireProtocol::Framed => {
            let mut codec: FramedCodec = config.framed_codec();
            let response = codec.decode(&data);
            println!("{:#?}", response);
            response.into_reading()
        }
    };

    match reading {
        Some(reading) => println!("{}", serde_json::to_string_pretty(&reading)?),
        None => println!("No reading decoded from {} bytes", data.len()),
    }
    Ok(())
}

fn encode_command(name: &str, sequence: u16) -> Result<()> {
    let Some(command) = FramedCommand::try_from_name(name) else {
        bail!("Unknown command '{}'. Expected info, ping or realtime", name);
    };
    let packet = CommandPacket::new(command.code(), sequence, Vec::new()).encode();
    println!("{:?} seq {}: {}", command, sequence, hex::encode(packet));
    Ok(())
}
