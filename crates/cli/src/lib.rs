use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "otcx")]
#[command(about = "otcx - settlement engine for escrow-backed OTC trades")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the settlement engine with the given configuration
    Start {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config/otcx.yaml")]
        config: PathBuf,

        /// Override the log format from the configuration
        #[arg(long, value_enum)]
        log_format: Option<LogFormatArg>,

        /// Override the Prometheus exporter port (enables metrics)
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Validate configuration without starting the engine
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config/otcx.yaml")]
        config: PathBuf,
    },

    /// Initialize a new configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "otcx.yaml")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    /// Human-readable multi-line output
    Pretty,

    /// One JSON object per line
    Json,

    /// Single-line output
    Compact,
}

impl LogFormatArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormatArg::Pretty => "pretty",
            LogFormatArg::Json => "json",
            LogFormatArg::Compact => "compact",
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
