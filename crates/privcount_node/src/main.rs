pub mod api;
pub mod config;
pub mod daemon;
pub mod event_source;
pub mod liveness;
pub mod outcomes;
pub mod protocol;
pub mod roles;
pub mod round;
pub mod state;
pub mod transport;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use crate::config::{load_yaml, DcConfig, SkConfig, TsConfig};
use crate::daemon::DaemonManager;

#[derive(Parser)]
#[command(name = "privcount-node")]
#[command(about = "PrivCount relay-statistics aggregation node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a Tally Server
    Ts {
        #[arg(long)]
        config: PathBuf,
        /// Run in the foreground instead of backgrounding the process
        #[arg(long)]
        foreground: bool,
    },
    /// Run as a Share Keeper
    Sk {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        foreground: bool,
    },
    /// Run as a Data Collector
    Dc {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a backgrounded node
    Stop {
        /// One of ts, sk, dc
        role: String,
    },
    /// Report whether a node's daemon is running
    Status {
        role: String,
    },
}

fn run_foreground(role: &str, config_path: &PathBuf) -> std::process::ExitCode {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return std::process::ExitCode::FAILURE;
        }
    };

    let outcome = rt.block_on(async move {
        match role {
            "ts" => {
                let cfg: TsConfig = load_yaml(config_path)?;
                maybe_spawn_status_api(&cfg.common.status_api_addr, "ts");
                roles::ts::run(cfg).await
            }
            "sk" => {
                let cfg: SkConfig = load_yaml(config_path)?;
                maybe_spawn_status_api(&cfg.common.status_api_addr, "sk");
                roles::sk::run(cfg).await
            }
            "dc" => {
                let cfg: DcConfig = load_yaml(config_path)?;
                maybe_spawn_status_api(&cfg.common.status_api_addr, "dc");
                roles::dc::run(cfg).await
            }
            _ => unreachable!("role is fixed at the call site"),
        }
    });

    match outcome {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, code = e.exit_code(), "node exited with error");
            std::process::ExitCode::from(e.exit_code())
        }
    }
}

/// Spawns the read-only status API (§9.3) in the background if this role's
/// config names a bind address; a node with no `status_api_addr` runs with
/// no local HTTP surface at all.
fn maybe_spawn_status_api(addr: &Option<String>, role: &str) {
    let Some(addr) = addr.clone() else { return };
    let state: api::SharedApiState = std::sync::Arc::new(tokio::sync::RwLock::new(api::ApiState {
        role: role.to_string(),
        ..Default::default()
    }));
    tokio::spawn(async move {
        if let Err(e) = api::run_api_server(&addr, state).await {
            tracing::warn!(error = %e, "status API exited");
        }
    });
}

// `load_yaml` returns `ConfigLoadError`, not `PrivCountError`; the closure
// above needs both under one `?`, so give it a single error path to widen
// into via `From`.
impl From<config::ConfigLoadError> for privcount_core::PrivCountError {
    fn from(e: config::ConfigLoadError) -> Self {
        privcount_core::PrivCountError::ConfigInvalid {
            round_id: "startup".into(),
            reason: e.to_string(),
        }
    }
}

fn main() -> std::process::ExitCode {
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();

    match cli.command {
        Commands::Ts { config, foreground } => dispatch("ts", config, foreground),
        Commands::Sk { config, foreground } => dispatch("sk", config, foreground),
        Commands::Dc { config, foreground } => dispatch("dc", config, foreground),
        Commands::Stop { role } => match DaemonManager::stop(&role) {
            Ok(()) => {
                println!("{role} daemon stopped");
                std::process::ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                std::process::ExitCode::FAILURE
            }
        },
        Commands::Status { role } => {
            let (running, pid) = DaemonManager::status(&role);
            match pid {
                Some(pid) if running => println!("{role} daemon running (pid {pid})"),
                _ => println!("{role} daemon not running"),
            }
            std::process::ExitCode::SUCCESS
        }
    }
}

fn dispatch(role: &str, config: PathBuf, foreground: bool) -> std::process::ExitCode {
    if foreground {
        return run_foreground(role, &config);
    }
    match DaemonManager::start(role, &config.display().to_string()) {
        Ok(()) => {
            println!("{role} daemon started");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}
