//! Binary entrypoint for the smsgate CLI.
//!
//! Commands:
//! - `start` - connect the configured modems and dispatch queued messages until Ctrl-C
//! - `init` - write a starter `smsgate.toml`
//! - `send --to <number> --body <text>` - queue a message in the store (offline intake)
//! - `status` - print per-status message counts as JSON
//! - `probe --port <path> [-b <baud>]` - send `AT` to a modem and print the reply
//!
//! See the library crate docs for module-level details: `smsgate::`.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use smsgate::config::Config;
use smsgate::dispatch::{self, Dispatcher};
use smsgate::modem::modems_from_config;
use smsgate::storage::{status_summary, MessageStore, SledStoreBuilder};

#[derive(Parser)]
#[command(name = "smsgate")]
#[command(about = "An SMS gateway for attached GSM modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "smsgate.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start dispatching through the configured modems
    Start,
    /// Write a default configuration file
    Init,
    /// Queue a message for delivery
    Send {
        /// Destination number, digits with optional leading '+'
        #[arg(short, long)]
        to: String,
        /// Message text
        #[arg(short, long)]
        body: String,
    },
    /// Show message counts by status
    Status,
    /// Send a bare AT command to a modem and print the reply
    Probe {
        /// Modem serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let pre_config = Config::load(&cli.config).await.ok();
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Start => {
            let config = load_or(pre_config, &cli.config).await?;
            config.validate()?;
            info!(
                "Starting {} v{}",
                config.gateway.name,
                env!("CARGO_PKG_VERSION")
            );
            let store: Arc<dyn MessageStore> = Arc::new(open_store(&config)?);
            let handle = dispatch::start(
                store.clone(),
                modems_from_config(&config.devices),
                config.dispatch.settings(),
            );
            if handle.devices.is_empty() {
                warn!("No modem available; accepted messages will wait in the store");
            } else {
                info!("Dispatching through: {}", handle.devices.join(", "));
            }
            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            handle.abort();
            info!("Dispatch stats: {}", smsgate::metrics::snapshot());
            store.flush()?;
        }
        Commands::Send { to, body } => {
            let config = load_or(pre_config, &cli.config).await?;
            let store: Arc<dyn MessageStore> = Arc::new(open_store(&config)?);
            let dispatcher = Dispatcher::new(store, config.dispatch.settings());
            let id = dispatcher.submit_new_message(&to, &body)?;
            println!("{}", id);
        }
        Commands::Status => {
            let config = load_or(pre_config, &cli.config).await?;
            let store = open_store(&config)?;
            let summary = status_summary(&store, config.dispatch.retry_limit)?;
            let payload = serde_json::json!({
                "pending": summary.pending,
                "processed": summary.processed,
                "failed": summary.failed,
                "retired": summary.retired,
                "total": summary.total(),
                "retry_limit": config.dispatch.retry_limit,
            });
            println!("{}", payload);
        }
        Commands::Probe { port, baud } => {
            #[cfg(not(feature = "serial"))]
            {
                let _ = (port, baud);
                log::error!("Probe requires the 'serial' feature");
                std::process::exit(2);
            }
            #[cfg(feature = "serial")]
            {
                use smsgate::config::DeviceConfig;
                use smsgate::modem::{GsmModem, MessageReference, Modem, TransmitOutcome};
                let device = DeviceConfig {
                    device_id: "probe".to_string(),
                    port,
                    baud_rate: baud,
                    ..DeviceConfig::default()
                };
                let mut modem = GsmModem::new(&device, Arc::new(MessageReference::new()));
                modem.connect()?;
                let response = modem.send_command("AT\r", true)?;
                println!("{}", response.trim());
                let ok = TransmitOutcome::classify(&response) == TransmitOutcome::Sent;
                std::process::exit(if ok { 0 } else { 1 });
            }
        }
    }

    Ok(())
}

async fn load_or(pre_config: Option<Config>, path: &str) -> Result<Config> {
    match pre_config {
        Some(config) => Ok(config),
        None => Config::load(path).await,
    }
}

fn open_store(config: &Config) -> Result<smsgate::storage::SledStore> {
    let path = config.storage.database_path();
    SledStoreBuilder::new(&path)
        .retry_limit(config.dispatch.retry_limit)
        .open()
        .map_err(|e| anyhow!("Failed to open message store {}: {}", path.display(), e))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match (verbosity, config) {
        (0, Some(cfg)) => cfg.logging.level_filter(),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let log_file = config.as_ref().and_then(|cfg| cfg.logging.file.clone());
    let opened = log_file.as_ref().and_then(|file| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .ok()
    });
    if let Some(f) = opened {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only in the foreground
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
