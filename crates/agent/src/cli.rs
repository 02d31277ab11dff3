use clap::{CommandFactory, Parser, Subcommand};
use infrastructure::config::{LogFormat, LogLevel};
use infrastructure::constants::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "keel",
    about = "Declarative control plane for the Linux IPVS load-balancing table",
    disable_version_flag = true,
)]
pub struct Cli {
    /// Print version and build information
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Log level override (takes precedence over config file)
    #[arg(short, long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Log format: text (development) or json (production)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon: reconcile continuously on config and health changes
    Start {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },

    /// Run a single reconcile pass and exit
    Once {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },

    /// Print version and build information
    Version,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn print_help() {
    let _ = Cli::command().print_help();
}
