//! AEGIS Log Ingestion Node Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the stream named "web" from ./configs/server.toml
//! aegis-log-ingest run web
//!
//! # Use another config directory, with debug logging
//! aegis-log-ingest --config-dir /etc/aegis/configs -v run web
//!
//! # List configured streams
//! aegis-log-ingest streams
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aegis_log_ingest::config::{Config, Paths};
use aegis_log_ingest::server::run_server;

/// AEGIS Log Ingestion Node
#[derive(Parser, Debug)]
#[command(name = "aegis-log-ingest")]
#[command(author = "AEGIS Team")]
#[command(version)]
#[command(about = "Gatekept log collection with abuse detection and paged export", long_about = None)]
struct Cli {
    /// Directory holding server.toml and the reloadable JSON stores
    #[arg(long, default_value = "configs")]
    config_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve one log stream
    Run {
        /// Stream name from [streams.<name>] in server.toml
        stream: String,
    },

    /// List configured log streams
    Streams,

    /// Print the version
    Version {
        /// Print only the version number
        #[arg(long)]
        only_number: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,aegis_log_ingest=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version { only_number } => {
            if only_number {
                println!("{}", env!("CARGO_PKG_VERSION"));
            } else {
                println!("aegis-log-ingest {}", env!("CARGO_PKG_VERSION"));
            }
        }
        Commands::Streams => {
            let paths = Paths::new(&cli.config_dir);
            let config = Config::from_file(paths.server_config())?;
            for (name, stream) in &config.streams {
                let export = match &stream.export {
                    Some(export) => format!("{:?}", export.kind).to_lowercase(),
                    None => "none".to_string(),
                };
                println!(
                    "{:<16} {:<28} level>={} export={} file={}",
                    name,
                    stream.bind_addr(),
                    stream.level,
                    export,
                    stream.resolve_file(&paths).display()
                );
            }
        }
        Commands::Run { stream } => {
            init_tracing(cli.verbose);
            info!(
                "Starting AEGIS log ingestion node v{}",
                env!("CARGO_PKG_VERSION")
            );

            let paths = Paths::new(&cli.config_dir);
            let config = Config::from_file(paths.server_config())?;
            info!("Loaded configuration from {}", paths.server_config().display());

            run_server(config, paths, &stream).await?;
            info!("Log stream <{}> stopped", stream);
        }
    }

    Ok(())
}
