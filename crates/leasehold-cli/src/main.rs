mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use leasehold_core::LeaseholdConfig;
use tracing_subscriber::EnvFilter;

/// Inspect and poke the shared scheduler store.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config (defaults to ~/.leasehold/leasehold.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the scheduler tables if they do not exist
    Init,

    /// List persisted tasks with their next run and current holder
    Tasks {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List named mutexes and their leases
    Locks {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Make an idle task due immediately
    Trigger {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },

    /// Validate the [schedules] section and show the settings each would store
    Schedules,

    /// Clear run tickets and mutex leases that have expired
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "leasehold=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = LeaseholdConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        LeaseholdConfig::default()
    });

    match cli.command {
        Commands::Init => commands::init(&config),
        Commands::Tasks { json } => commands::tasks(&config, json),
        Commands::Locks { json } => commands::locks(&config, json),
        Commands::Trigger { id } => commands::trigger(&config, &id),
        Commands::Schedules => commands::schedules(&config),
        Commands::Sweep => commands::sweep(&config),
    }
}
