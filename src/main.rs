use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use servo_serial_hub::config::{Config, ConfigLoader, LogFormat, LoggingConfig};
use servo_serial_hub::events::{HubEvent, SinkError};
use servo_serial_hub::port::PortSettings;
use servo_serial_hub::HubService;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Poll servos on a half-duplex serial bus and print telemetry as JSON lines.",
    long_about = "Opens a serial port, starts a telemetry poll for each device id and writes every \
                  event to stdout as one JSON object per line. Without --port, lists the serial \
                  ports present on this machine."
)]
struct Args {
    /// Configuration file (overrides the standard search locations).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device path or configured alias to open.
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate; defaults to `[serial] default_baud`.
    #[arg(short, long)]
    baud: Option<u32>,

    /// Device id to poll. Repeat for several devices.
    #[arg(short, long = "device", default_value = "1")]
    devices: Vec<u8>,

    /// Poll interval; defaults to `[poll] default_interval_ms`.
    #[arg(short, long)]
    interval_ms: Option<u64>,

    /// Log level or filter directive; overrides `[logging] level`.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging)?;

    let Some(port) = args.port.clone() else {
        let ports = HubService::available_ports()?;
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    };

    let baud = args.baud.unwrap_or(config.serial.default_baud);
    let interval = args.interval_ms.map(Duration::from_millis);
    let hub = HubService::with_system_ports(config);

    let _printer = hub.register_sink(print_event);

    let id = hub
        .open_port(PortSettings::new(port.as_str()).with_baud_rate(baud))
        .await?;
    for device in &args.devices {
        if let Err(e) = hub.start_poll(id, *device, interval) {
            warn!(device_id = device, "could not start poll: {}", e);
        }
    }
    info!(port_id = %id, port = %port, baud, devices = ?args.devices, "polling");

    shutdown_signal().await;
    hub.shutdown().await;
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let loader = match path {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    Ok(loader.into_config())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(false).with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}

fn print_event(event: &HubEvent) -> Result<(), SinkError> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, shutting down");
}
