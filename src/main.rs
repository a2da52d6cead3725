//! # Grafana Operator CLI (`grafana-operator`)
//!
//! ## Usage
//!
//! ```bash
//! grafana-operator --config ./config/operator.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `init` | Create the SQLite state database |
//! | `serve` | Run the event loop and the HTTP event/status server |
//! | `replay <file>` | Feed a JSON-lines event file through the controller |
//! | `render <file>` | Render configuration for a JSON array of relations |
//! | `status` | Print the persisted controller record |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use grafana_operator::{config, migrate, render_cmd, runtime, status};

/// Grafana Operator: reconciles a Grafana unit's configuration from its
/// relations.
#[derive(Parser)]
#[command(
    name = "grafana-operator",
    about = "Grafana Operator: relation-driven configuration and lifecycle for a Grafana unit",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/operator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state database.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Run the event loop and HTTP server.
    Serve,

    /// Feed a JSON-lines event file through the controller.
    Replay {
        /// Event file, one JSON event per line.
        file: PathBuf,

        /// Write files but never start the workload.
        #[arg(long)]
        dry_run: bool,
    },

    /// Render configuration for a JSON array of relation descriptors.
    Render {
        /// Relations file.
        file: PathBuf,
    },

    /// Show the persisted controller state.
    Status,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("State database initialized.");
        }
        Commands::Serve => {
            runtime::run_serve(&cfg).await?;
        }
        Commands::Replay { file, dry_run } => {
            runtime::run_replay(&cfg, &file, dry_run).await?;
        }
        Commands::Render { file } => {
            render_cmd::run_render(&cfg, &file)?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
    }

    Ok(())
}
