//! infuse: device platform CLI
//!
//! Commands:
//!   tdf decode <file|hex>            - print the records of a TDF stream
//!   logger info|dump|erase --image   - inspect a flash-map block store image
//!   schedules validate <file>        - check a TOML schedule table
//!   run                              - drive the task runner at 1 Hz

mod inspect;
mod supervisor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use infuse_core::config::InfuseConfig;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "infuse", version, about = "Infuse device platform tools")]
struct Cli {
    /// Path to infuse.toml configuration file
    #[arg(long, short = 'c', env = "INFUSE_CONFIG", default_value = "infuse.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "INFUSE_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "INFUSE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Tagged Data Format streams
    Tdf {
        #[command(subcommand)]
        action: TdfAction,
    },

    /// Flash block store images
    Logger {
        #[command(subcommand)]
        action: LoggerAction,
    },

    /// Task schedules
    Schedules {
        #[command(subcommand)]
        action: SchedulesAction,
    },

    /// Run the task runner supervisor until interrupted
    Run {
        /// Battery charge reported to schedules (percent)
        #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(0..=100))]
        battery: u8,
        /// Stop after this many iterations
        #[arg(long)]
        iterations: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum TdfAction {
    /// Decode a TDF stream from a file or a hex string
    Decode {
        /// File path, or hex bytes when no such file exists
        input: String,
        /// Print well-known payloads as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum LoggerAction {
    /// Print the recovered logger state
    Info {
        /// Flash image (overrides [logger.flash] image)
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Print the readable blocks, decoding TDF payloads
    Dump {
        #[arg(long)]
        image: Option<PathBuf>,
        /// First logical block (default: earliest readable)
        #[arg(long)]
        start: Option<u32>,
        /// Number of blocks to print
        #[arg(long)]
        count: Option<u32>,
    },
    /// Erase the image and restart logging at block 0
    Erase {
        #[arg(long)]
        image: Option<PathBuf>,
        /// Erase the whole area instead of the used blocks
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SchedulesAction {
    /// Validate the [[schedules]] table of a TOML file
    Validate {
        /// File to check (default: the configuration file)
        file: Option<PathBuf>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, &format);
    if !found {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    match cli.command {
        Commands::Tdf { action: TdfAction::Decode { input, json } } => {
            inspect::cmd_tdf_decode(&input, json)
        }
        Commands::Logger { action: LoggerAction::Info { image } } => {
            inspect::cmd_logger_info(&config, image.as_deref())
        }
        Commands::Logger { action: LoggerAction::Dump { image, start, count } } => {
            inspect::cmd_logger_dump(&config, image.as_deref(), start, count)
        }
        Commands::Logger { action: LoggerAction::Erase { image, all } } => {
            inspect::cmd_logger_erase(&config, image.as_deref(), all)
        }
        Commands::Schedules { action: SchedulesAction::Validate { file } } => {
            inspect::cmd_schedules_validate(file.as_deref().unwrap_or(&cli.config))
        }
        Commands::Run { battery, iterations } => supervisor::run(config, battery, iterations).await,
    }
}

fn load_config(path: &Path) -> Result<(InfuseConfig, bool)> {
    if path.exists() {
        let config = InfuseConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((InfuseConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("INFUSE_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
