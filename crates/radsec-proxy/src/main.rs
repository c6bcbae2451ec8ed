use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use radsec_proxy::config::{Config, LogDestination};

const DEFAULT_CONFIG: &str = "/etc/radsecproxy.conf";

/// RADIUS forwarding proxy with RADIUS-over-TLS transport
#[derive(Parser, Debug)]
#[command(name = "radsecproxy", disable_version_flag = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', value_name = "CONFIGFILE")]
    config: Option<PathBuf>,

    /// Log level (1=error, 2=warn, 3=info, 4=debug)
    #[arg(short = 'd', value_name = "LEVEL")]
    debug: Option<u8>,

    /// Run in the foreground, logging to stderr
    #[arg(short = 'f')]
    foreground: bool,

    /// Print version information and exit
    #[arg(short = 'v', long)]
    version: bool,
}

fn level_filter(level: u8) -> &'static str {
    match level {
        1 => "error",
        2 => "warn",
        3 => "info",
        _ => "debug",
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("radsecproxy {}", env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    if let Some(level) = cli.debug
        && !(1..=4).contains(&level)
    {
        eprintln!("Log level must be 1, 2, 3 or 4, not {level}");
        process::exit(1);
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    // -d beats the config file
    let level = cli.debug.or(config.log_level).unwrap_or(3);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(level)));

    let mut syslog_requested = false;
    let destination = if cli.foreground {
        None
    } else {
        config.log_destination.clone()
    };
    match destination {
        Some(LogDestination::File(path)) => {
            let file = match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("Error: cannot open log file {}: {e}", path.display());
                    process::exit(1);
                }
            };
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        Some(LogDestination::Syslog(_)) | None => {
            syslog_requested = matches!(destination, Some(LogDestination::Syslog(_)));
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    if syslog_requested {
        warn!("syslog output is delegated to the service manager, logging to stderr");
    }

    info!("radsecproxy {} starting", env!("CARGO_PKG_VERSION"));
    info!(config = %config_path.display(), "loaded configuration");

    if let Err(e) = radsec_proxy::run(config).await {
        error!("{e}");
        process::exit(1);
    }
}
