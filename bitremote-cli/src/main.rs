//! Command line remote for micro:bit UART devices
//!
//! Scans for devices, fetches their control layout, watches `UPD` events and
//! sends `SET` lines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use bitremote_ble::{Connection, Session, SessionEvent, Settings, transport};
use bitremote_proto::{Config, ConfigSource, Encoding, Progress};

#[derive(Parser)]
#[command(name = "bitremote")]
#[command(about = "Remote control for micro:bit devices over BLE UART")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file [default: $BITREMOTE_HOME/settings.json]
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Device name or address to connect to
    #[arg(short, long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for devices
    Scan {
        /// Scan duration in seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Fetch and print a device's layout
    Config {
        /// Pretty-print the JSON
        #[arg(short, long)]
        pretty: bool,
        /// Seconds to wait for the transfer
        #[arg(long, default_value = "15")]
        timeout: u64,
    },
    /// Print layout and value updates until Ctrl-C
    Monitor,
    /// Send `SET <id> <value...>`
    Set {
        id: String,
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
    },
    /// Print the lines a device would send for a layout file
    Encode {
        file: PathBuf,
        /// Force chunked base64, with generated parts
        #[arg(long)]
        base64: bool,
    },
    /// Print the effective settings, optionally writing them to the file
    Settings {
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings_path = match cli.settings {
        Some(path) => path,
        None => bitremote_ble::bitremote_home()?.join("settings.json"),
    };
    let settings = Settings::load(&settings_path)?;
    let device = cli.device.as_deref();

    match cli.command {
        Commands::Scan { duration } => scan_devices(&settings, duration).await?,
        Commands::Config { pretty, timeout } => {
            fetch_config(device, &settings, pretty, Duration::from_secs(timeout)).await?
        }
        Commands::Monitor => monitor(device, &settings).await?,
        Commands::Set { id, value } => set_value(device, &settings, &id, &value.join(" ")).await?,
        Commands::Encode { file, base64 } => encode_layout(&file, base64)?,
        Commands::Settings { save } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                settings.save(&settings_path)?;
                println!("Saved to {}", settings_path.display());
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn scan_devices(settings: &Settings, duration: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let duration = duration.map(Duration::from_secs).unwrap_or_else(|| settings.scan_duration());
    println!("Scanning for devices ({} seconds)...", duration.as_secs());

    let devices = transport::scan(duration, &settings.name_prefix).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_microbit { " [MICROBIT]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }
    Ok(())
}

async fn open_session(
    device: Option<&str>,
    settings: &Settings,
) -> Result<(Connection, Session, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>), Box<dyn std::error::Error>> {
    println!("Connecting...");
    let connection = transport::connect(device, settings).await?;
    println!("Connected ({})", connection.profile());

    let inbound = connection.inbound().await?;
    let (session, events) = Session::start(connection.clone(), inbound, settings);
    Ok((connection, session, events))
}

async fn fetch_config(
    device: Option<&str>,
    settings: &Settings,
    pretty: bool,
    limit: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let (connection, session, mut events) = open_session(device, settings).await?;
    session.request_config_after_delay().await;

    let result = tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Config(config) => return Ok(config),
                SessionEvent::ConfigError(err) => return Err(err.to_string()),
                SessionEvent::Disconnected { .. } => return Err("device disconnected".to_string()),
                SessionEvent::Progress(progress) => log_progress(progress),
                _ => {}
            }
        }
        Err("session ended".to_string())
    })
    .await;

    session.close();
    if let Err(err) = connection.disconnect().await {
        debug!(error = %err, "disconnect failed");
    }

    let config = result.map_err(|_| "timed out waiting for config")??;
    print_config(&config, pretty)?;
    Ok(())
}

async fn monitor(device: Option<&str>, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let (connection, session, mut events) = open_session(device, settings).await?;
    session.request_config_after_delay().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Config(config)) => {
                    println!("Layout \"{}\" with {} widgets", config.title, config.widgets.len());
                    for widget in &config.widgets {
                        println!("  {} {} {}", widget.id, widget.kind.as_str(), widget.label.as_deref().unwrap_or(""));
                    }
                }
                Some(SessionEvent::ConfigError(err)) => warn!(error = %err, "could not decode layout"),
                Some(SessionEvent::Update(event)) => println!("{} = {}", event.id, event.value),
                Some(SessionEvent::Progress(progress)) => log_progress(progress),
                Some(SessionEvent::SendFailed { line, error }) => warn!(%line, %error, "send failed"),
                Some(SessionEvent::Disconnected { .. }) | None => {
                    println!("Disconnected");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close();
    connection.disconnect().await?;
    Ok(())
}

async fn set_value(
    device: Option<&str>,
    settings: &Settings,
    id: &str,
    value: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (connection, session, _events) = open_session(device, settings).await?;

    if !session.set(id, value) {
        return Err(format!("invalid SET {id} {value}").into());
    }
    if !session.flush(settings.queue_settings().write_timeout * 2).await {
        warn!("write did not complete");
    }
    info!(%id, %value, "sent");

    session.close();
    if let Err(err) = connection.disconnect().await {
        debug!(error = %err, "disconnect failed");
    }
    Ok(())
}

fn encode_layout(file: &Path, base64: bool) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(file)?;
    let config = Config::from_json(&text)?;
    let source = ConfigSource::new(&config)?.with_generated_base64();

    let encoding = if base64 { Encoding::ChunkedBase64 } else { source.encoding() };
    for line in source.lines_for(encoding) {
        println!("{}", line);
    }
    Ok(())
}

fn print_config(config: &Config, pretty: bool) -> Result<(), serde_json::Error> {
    let json = if pretty { serde_json::to_string_pretty(config)? } else { config.to_json()? };
    println!("{}", json);
    Ok(())
}

fn log_progress(progress: Progress) {
    match progress {
        Progress::Bytes { received, expected } => info!(received, ?expected, "receiving layout"),
        Progress::Chunks { received, expected } => info!(received, expected, "receiving layout"),
    }
}
