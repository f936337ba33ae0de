mod config;
mod hasher;
mod logging;
mod notifier;
mod probe;
mod sink;
mod store;
mod supervisor;
mod watcher;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use crate::config::Config;
use crate::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "noidd")]
#[command(about = "File integrity monitoring daemon")]
struct Cli {
    /// Configuration file (.yml)
    #[arg(short = 'c', long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the baseline store path from the config
    #[arg(short = 'l', long)]
    leveldb: Option<PathBuf>,

    /// Override the log file path from the config
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Discard any existing baseline store on startup
    #[arg(long)]
    recreate: bool,

    /// Reserved: inotify-driven interactive mode
    #[arg(short = 'i', long)]
    interactive: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("couldn't initialize noidd - an error occurred while loading the config");
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = cli.leveldb {
        config.leveldb = Some(path);
    }
    if let Some(path) = cli.logfile {
        config.logfile = Some(path);
    }
    if cli.recreate {
        config.leveldb_recreate = true;
    }

    if cli.interactive {
        eprintln!("interactive mode is reserved and not implemented yet");
        return ExitCode::FAILURE;
    }

    logging::init(&config.log_path());
    info!(config = %cli.config.display(), watches = config.watchers.len(), "starting noidd");

    let supervisor = match Supervisor::from_config(&config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "could not initialize");
            eprintln!("couldn't initialize noidd: {e}");
            return ExitCode::FAILURE;
        }
    };

    let failures = supervisor.run().await;
    if failures > 0 {
        error!(failures, "completed with failing watchers");
    } else {
        info!("completed");
    }
    ExitCode::SUCCESS
}
