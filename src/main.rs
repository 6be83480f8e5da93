//! CLI entry point for cx505-daq.
//!
//! Subcommands:
//! - `run`: acquire from the configured meter until Ctrl-C
//! - `check-config`: load and validate a configuration file, then exit
//! - `decode`: decode raw captured bytes from a file and print JSON

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use clap::{Parser, Subcommand};
use cx505_daq::acquisition::AcquisitionLoop;
use cx505_daq::config::{DeviceKind, Settings};
use cx505_daq::protocol::{decode_frame, extract_frames};
use cx505_daq::sink::{IngestSink, JsonlSink, LoggingIngestSink, TracingAuditSink};
use cx505_daq::transport::{self, Transport};
use cx505_daq::{logging, transport::mock::MockMeter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

// Allocation-heavy frame churn benefits from mimalloc in multi-threaded use
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cx505-daq")]
#[command(about = "Laboratory pH/ORP/DO meter acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from the configured meter until interrupted
    Run {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,
    },

    /// Load and validate a configuration file, then exit
    CheckConfig {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,
    },

    /// Decode raw captured bytes from a file and print frames as JSON
    Decode {
        /// File of raw meter output (as captured from the serial line)
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Decode { input } => decode_file(&input),
    }
}

async fn run(config_path: &Path) -> Result<()> {
    let settings = Settings::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
    tracing::info!(config = %config_path.display(), "starting acquisition");

    for name in settings.undefined_schedule_commands() {
        tracing::warn!(command = name, "schedule references an undefined command");
    }

    let device: Box<dyn Transport> = match settings.device.kind {
        DeviceKind::Mock => Box::new(MockMeter::new()),
        DeviceKind::Serial => serial_transport(&settings)?,
    };
    let transport = transport::shared(device);

    let ingest: Box<dyn IngestSink> = match &settings.output.jsonl_path {
        Some(path) => Box::new(
            JsonlSink::create(Path::new(path))
                .with_context(|| format!("failed to open capture file {path}"))?,
        ),
        None => Box::new(LoggingIngestSink::default()),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping");
            stop_tx.send(true).ok();
        }
    });

    let mut acquisition = AcquisitionLoop::new(
        &settings,
        transport,
        ingest,
        Arc::new(TracingAuditSink),
        stop_rx,
    );
    acquisition.run().await?;

    let stats = acquisition.stats();
    tracing::info!(
        windows = stats.windows,
        frames = stats.frames_decoded,
        decode_failures = stats.decode_failures,
        commands = stats.commands_completed,
        command_failures = stats.command_failures,
        "acquisition finished"
    );
    Ok(())
}

#[cfg(feature = "transport_serial")]
fn serial_transport(settings: &Settings) -> Result<Box<dyn Transport>> {
    let port = settings
        .device
        .port
        .as_deref()
        .ok_or_else(|| anyhow!("device.port is required for the serial transport"))?;
    Ok(Box::new(cx505_daq::transport::serial::SerialTransport::new(
        port,
        settings.device.baud,
    )))
}

#[cfg(not(feature = "transport_serial"))]
fn serial_transport(_settings: &Settings) -> Result<Box<dyn Transport>> {
    Err(anyhow!(
        "this build has no serial support; rebuild with --features transport_serial"
    ))
}

fn check_config(config_path: &Path) -> Result<()> {
    let settings = Settings::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    println!("configuration OK: {}", config_path.display());
    println!("  device: {:?}", settings.device.kind);
    println!("  commands: {}", settings.commands.len());
    println!("  schedule entries: {}", settings.schedule.len());
    for name in settings.undefined_schedule_commands() {
        println!("  warning: schedule references undefined command '{name}'");
    }
    Ok(())
}

fn decode_file(input: &Path) -> Result<()> {
    let raw = std::fs::read(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let mut buffer = BytesMut::from(&raw[..]);
    let frames = extract_frames(&mut buffer);
    if frames.is_empty() {
        eprintln!("no complete frames found in {}", input.display());
        return Ok(());
    }
    let mut failures = 0usize;
    for frame in &frames {
        match decode_frame(frame) {
            Ok(decoded) => println!("{}", serde_json::to_string(&decoded)?),
            Err(err) => {
                failures += 1;
                eprintln!("malformed frame ({err}): {:?}", String::from_utf8_lossy(frame));
            }
        }
    }
    eprintln!("{} frame(s), {} malformed", frames.len(), failures);
    Ok(())
}
