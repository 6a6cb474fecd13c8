use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use kiln::config::KilnConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Turns git commits into container images and static bundles")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "kiln.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator: worker listener, scheduler, deployment loop and HTTP API
    Coordinator {
        /// Address workers connect to
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Address of the HTTP API
        #[arg(long)]
        http: Option<SocketAddr>,
    },
    /// Run a builder worker
    Worker {
        /// Coordinator address (host:port)
        #[arg(long)]
        coordinator: Option<String>,

        /// Stable worker identifier (random when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Directory for build workspaces
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Create or migrate the database, then exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = KilnConfig::load(&cli.config)?;

    match cli.command {
        Commands::Coordinator { listen, http } => {
            if let Some(addr) = listen {
                config.coordinator.listen_addr = addr;
            }
            if let Some(addr) = http {
                config.coordinator.http_addr = addr;
            }
            let _guard = kiln::logging::init(&config.logging, cli.verbose, "coordinator")?;
            cmd::cmd_coordinator(config).await?;
        }
        Commands::Worker {
            coordinator,
            id,
            work_dir,
        } => {
            if let Some(addr) = coordinator {
                config.worker.coordinator_addr = addr;
            }
            if id.is_some() {
                config.worker.worker_id = id;
            }
            if work_dir.is_some() {
                config.worker.work_dir = work_dir;
            }
            let _guard = kiln::logging::init(&config.logging, cli.verbose, "worker")?;
            cmd::cmd_worker(config).await?;
        }
        Commands::Migrate => cmd::cmd_migrate(&config)?,
    }

    Ok(())
}
