use crate::logging::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cohorts")]
#[command(about = "Inspect and maintain a cohort analysis result cache")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        global = true,
        env = "COHORTS_CACHE_DIR",
        help = "Cache root directory"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "TOML file with cache settings")]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(
        long,
        global = true,
        help = "Log output format",
        default_value = "compact",
        value_enum
    )]
    pub log_format: TracingFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "List cached entries")]
    List {
        #[arg(long, short = 'c', help = "Only entries of this computation")]
        computation: Option<String>,
        #[arg(long, help = "Emit JSON instead of text")]
        json: bool,
    },
    #[command(about = "Check that cached entries were computed under consistent tool versions")]
    Summarize {
        #[arg(long, short = 'c', help = "Only entries of this computation")]
        computation: Option<String>,
        #[arg(long, help = "Emit JSON instead of text")]
        json: bool,
    },
    #[command(about = "Delete a single cached entry")]
    Delete {
        #[arg(long, short = 'c')]
        computation: String,
        #[arg(long, short = 'p')]
        patient: String,
        #[arg(long, short = 'f', help = "Hex fingerprint of the entry")]
        fingerprint: String,
    },
    #[command(about = "Delete cached entries of one computation, or everything")]
    Clear {
        #[arg(long, short = 'c', conflicts_with = "all", required_unless_present = "all")]
        computation: Option<String>,
        #[arg(long, help = "Remove the whole cache root")]
        all: bool,
    },
}

impl Commands {
    /// Subcommand name as typed on the command line
    pub const fn name(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Summarize { .. } => "summarize",
            Self::Delete { .. } => "delete",
            Self::Clear { .. } => "clear",
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
