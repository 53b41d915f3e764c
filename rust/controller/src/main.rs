//! Switch aggregation controller
//!
//! Serves connection setup for aggregation workers and keeps the switch's
//! worker, slot and multicast state consistent between jobs.
//!
//! # Usage
//!
//! ```bash
//! # Start the controller with default settings
//! sml-controller
//!
//! # Start with a configuration file and a static job
//! sml-controller --config controller.toml serve --job-file job.toml
//!
//! # Inspect a running controller
//! sml-controller --server 127.0.0.1:50099 status
//! sml-controller bitmaps --start 0 --count 32
//! sml-controller queue-pairs 0 --count 8
//! ```

mod proto {
    tonic::include_proto!("sml.control");
}

mod client;
mod service;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use client::{CliError, CliResult};
use proto::switch_control_server::SwitchControlServer;
use service::SwitchControlService;
use switch_core::config::DataplaneBackend;
use switch_core::{
    ControllerConfig, JobConfiguration, JobCoordinator, JobDescription, MemoryDataplane,
    TableClient, TableOps,
};

/// Switch aggregation controller
#[derive(Parser, Debug)]
#[command(name = "sml-controller")]
#[command(about = "Control plane for in-switch gradient aggregation")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Controller to send admin commands to
    #[arg(long, global = true, default_value = "127.0.0.1:50099")]
    server: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Configure the switch and serve worker connections (default)
    Serve {
        /// Address to bind to
        #[arg(short, long)]
        address: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Job description to load at start-up
        #[arg(long)]
        job_file: Option<PathBuf>,
    },
    /// List admitted workers
    Workers,
    /// Show coordinator phase, job and multicast membership
    Status,
    /// Dump slot bitmaps
    Bitmaps {
        #[arg(long, default_value = "0")]
        start: u32,

        #[arg(long, default_value = "16")]
        count: u32,

        /// Only slots where both sets hold contributions
        #[arg(long)]
        inconsistent: bool,
    },
    /// Remove one worker
    Remove { rank: u32 },
    /// Remove every worker and clear all slot state
    Clear,
    /// Show per-slot recirculate, broadcast, retransmit and drop counters
    Counters {
        /// First counter index; each slot has two, one per set
        #[arg(long, default_value = "0")]
        start: u32,

        #[arg(long, default_value = "16")]
        count: u32,
    },
    /// Show RDMA counters of one worker's queue pairs
    QueuePairs {
        rank: u32,

        #[arg(long, default_value = "0")]
        start: u32,

        #[arg(long, default_value = "8")]
        count: u32,
    },
    /// Zero all counters
    ClearCounters,
}

fn load_config(path: Option<&PathBuf>) -> CliResult<ControllerConfig> {
    let config = match path {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };
    Ok(config.with_env_overrides())
}

async fn serve(
    config_path: Option<&PathBuf>,
    address: Option<String>,
    port: Option<u16>,
    job_file: Option<PathBuf>,
) -> CliResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(address) = address {
        config.server.address = address;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if job_file.is_some() {
        config.job.job_file = job_file;
    }
    config.validate()?;

    let dataplane: Arc<dyn TableClient> = match config.dataplane.backend {
        DataplaneBackend::Memory => Arc::new(MemoryDataplane::new()),
    };

    tracing::info!("Starting switch controller");
    tracing::info!("  Switch: {} / {}", config.switch.mac, config.switch.ipv4);
    tracing::info!("  Pool: {}+{}", config.pool.base, config.pool.size);
    tracing::info!("  Ports: {}", config.ports.len());
    tracing::info!("  Dataplane: {:?}", config.dataplane.backend);

    let ops = TableOps::from_config(dataplane, &config.dataplane);
    let coordinator = JobCoordinator::new(ops, JobConfiguration::from(&config))?;
    coordinator.configure().await?;

    if let Some(path) = &config.job.job_file {
        let description = JobDescription::from_file(path)?;
        let admissions = coordinator.load_job(description).await?;
        tracing::info!("Loaded {} workers from {}", admissions.len(), path.display());
    }

    let addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port)
        .parse()
        .map_err(|e| CliError::from(switch_core::ControlError::config_with_source("invalid server address", e)))?;

    tracing::info!("Listening on {}", addr);

    Server::builder()
        .add_service(SwitchControlServer::new(SwitchControlService::new(coordinator)))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            tracing::info!("Shutting down controller...");
        })
        .await?;

    Ok(())
}

async fn run(args: Args) -> CliResult<()> {
    let server = args.server.as_str();
    match args.command.unwrap_or(Command::Serve {
        address: None,
        port: None,
        job_file: None,
    }) {
        Command::Serve {
            address,
            port,
            job_file,
        } => serve(args.config.as_ref(), address, port, job_file).await,
        Command::Workers => client::workers(server).await,
        Command::Status => client::status(server).await,
        Command::Bitmaps {
            start,
            count,
            inconsistent,
        } => client::bitmaps(server, start, count, inconsistent).await,
        Command::Remove { rank } => client::remove(server, rank).await,
        Command::Clear => client::clear(server).await,
        Command::Counters { start, count } => client::slot_counters(server, start, count).await,
        Command::QueuePairs { rank, start, count } => client::queue_pair_counters(server, rank, start, count).await,
        Command::ClearCounters => client::clear_counters(server).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_subcommands() {
        let args = Args::parse_from(["sml-controller"]);
        assert!(args.command.is_none());

        let args = Args::parse_from(["sml-controller", "--server", "10.0.0.1:50099", "bitmaps", "--count", "4"]);
        assert_eq!(args.server, "10.0.0.1:50099");
        assert!(matches!(
            args.command,
            Some(Command::Bitmaps {
                start: 0,
                count: 4,
                inconsistent: false
            })
        ));

        let args = Args::parse_from(["sml-controller", "remove", "3"]);
        assert!(matches!(args.command, Some(Command::Remove { rank: 3 })));

        let args = Args::parse_from(["sml-controller", "queue-pairs", "2", "--count", "4"]);
        assert!(matches!(
            args.command,
            Some(Command::QueuePairs {
                rank: 2,
                start: 0,
                count: 4
            })
        ));

        let args = Args::parse_from(["sml-controller", "clear-counters"]);
        assert!(matches!(args.command, Some(Command::ClearCounters)));
    }

    #[test]
    fn test_load_config_reports_kind() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nsize = 0").unwrap();
        let err = load_config(Some(&file.path().to_path_buf())).unwrap_err();
        assert_eq!(err.kind, "Config");
        assert!(err.to_string().starts_with("error [Config]: "));
    }
}
