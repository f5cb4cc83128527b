//! regscope Daemon - Main entry point
//!
//! Runs a register session against a device and serves it over HTTP and
//! WebSocket.

mod api;
mod config;
mod map_loader;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "regscope")]
#[command(about = "Register inspection daemon for I2C, serial and SPI devices")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "regscope.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Register map JSON to load on startup
    #[arg(short, long)]
    map: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the register map, print it and exit
    #[arg(long)]
    check_map: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("regscope v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        if args.config.exists() {
            anyhow::bail!("Refusing to overwrite {}", args.config.display());
        }
        config::save_default_config(&args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override from command line
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }
    if let Some(map) = args.map {
        config.register_map.path = Some(map.display().to_string());
    }

    info!(
        bind = %config.daemon.bind,
        device = %config.device.device_path,
        simulator = config.simulator.enabled,
        "Configuration loaded"
    );

    if args.check_map {
        let Some(path) = &config.register_map.path else {
            anyhow::bail!("No register map given (use --map or [register_map] path)");
        };
        let map = map_loader::load_register_map(std::path::Path::new(path))?;
        println!("{} v{} ({} registers)", map.name, map.version, map.registers.len());
        for register in &map.registers {
            println!(
                "  {} {:<24} {:<10} {}",
                regscope_core::format_hex_address(register.address),
                register.name,
                register.kind.type_name(),
                if register.writable { "rw" } else { "ro" }
            );
        }
        return Ok(());
    }

    // Create application state and serve it
    let state = state::AppState::new(config.clone()).await?;
    server::run(state, &config.daemon.bind).await?;

    Ok(())
}
