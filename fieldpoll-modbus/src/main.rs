//! Modbus south plugin host.
//!
//! Loads a plugin configuration, polls the device on a fixed interval and
//! prints every measurement as one JSON line on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use fieldpoll_common::LoggingConfig;
use fieldpoll_modbus::config::{ModbusPluginConfig, TransportConfig};
use fieldpoll_modbus::register_map::RegisterMap;
use fieldpoll_modbus::session::ModbusSession;
use fieldpoll_modbus::simulator::SimulatedDevice;
use fieldpoll_modbus::transport::Transport;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Modbus south plugin (TCP/RTU).
#[derive(Parser, Debug)]
#[command(name = "fieldpoll-modbus")]
#[command(about = "Polls a Modbus register map and prints measurements")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "modbus.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds between poll cycles.
    #[arg(long, default_value_t = 5)]
    interval_secs: u64,

    /// Stop after this many poll cycles.
    #[arg(long)]
    count: Option<u64>,

    /// Poll an in-memory simulated device instead of the configured one.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ModbusPluginConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    fieldpoll_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldpoll-modbus");
    info!("Loaded configuration from {:?}", args.config);

    if args.simulate {
        let device = SimulatedDevice::new();
        let map = RegisterMap::from_config(&config.register_map()?, config.slave)?;
        device.populate(&map, config.slave);

        let session =
            ModbusSession::init_with(&config, move |_: &TransportConfig| device.clone()).await?;
        run(session, &args).await
    } else {
        let session = ModbusSession::init(&config).await?;
        run(session, &args).await
    }
}

async fn run<T: Transport>(mut session: ModbusSession<T>, args: &Args) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut polls: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }

        let measurement = session.poll().await?;
        println!("{}", serde_json::to_string(&measurement)?);

        polls += 1;
        if args.count.is_some_and(|count| polls >= count) {
            break;
        }
    }

    session.shutdown().await?;
    info!("Modbus plugin stopped after {} poll(s)", polls);

    Ok(())
}
