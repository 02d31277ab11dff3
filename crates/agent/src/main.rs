#![forbid(unsafe_code)]

mod cli;
mod startup;
mod watcher;

use anyhow::Result;

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();

    match cli.command {
        Some(Command::Version) => {
            print_version();
            Ok(())
        }
        None if cli.version => {
            print_version();
            Ok(())
        }
        Some(Command::Start { ref config }) => startup::run_daemon(&cli, config).await,
        Some(Command::Once { ref config }) => startup::run_once(&cli, config).await,
        None => {
            cli::print_help();
            Ok(())
        }
    }
}

fn print_version() {
    println!("keel {}", env!("CARGO_PKG_VERSION"));
    println!("build commit: {}", option_env!("KEEL_BUILD_COMMIT").unwrap_or("unknown"));
    println!("build time:   {}", option_env!("KEEL_BUILD_TIME").unwrap_or("unknown"));
}
