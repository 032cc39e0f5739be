//! Warden - process supervisor entry point.
//!
//! - `warden supervise [-- PROGRAM ARGS..]`: run the primary, keeping
//!   `workers` copies of PROGRAM alive (default: `warden worker`)
//! - `warden worker`: run one worker serving the status endpoint
//! - `warden health`: print the last persisted health snapshot

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Mutex;

use warden_core::health::{read_snapshot, HealthMonitor, ResourceProbe, SysinfoProbe};
use warden_core::maintenance::SweepService;
use warden_core::observability::init_tracing_with;
use warden_core::rate_limiter::RateLimiter;
use warden_core::resilience::ResilienceHandle;
use warden_core::status_server::{StatusServer, StatusState};
use warden_core::supervisor::{
    slot_from_env, wait_for_termination, CommandLauncher, StdoutReporter, Supervisor,
    WorkerLauncher, WorkerRuntime,
};
use warden_core::{Config, Error, Result};

/// Exit code for unusable configuration (sysexits EX_CONFIG).
const CONFIG_EXIT_CODE: u8 = 78;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Worker process supervisor")]
struct Cli {
    /// JSON config file. WARDEN_* environment variables override it.
    #[arg(long, short, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Run the primary process and supervise workers.
    Supervise {
        /// Number of workers (overrides config).
        #[arg(long)]
        workers: Option<usize>,

        /// Worker program and its arguments.
        #[arg(last = true)]
        program: Vec<String>,
    },
    /// Run a single worker.
    Worker,
    /// Print the persisted health snapshot.
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warden: {}", e);
            return ExitCode::from(CONFIG_EXIT_CODE);
        }
    };
    init_tracing_with(&config.observability);

    let result = match cli.action {
        Action::Supervise { workers, program } => supervise(config, workers, program).await,
        Action::Worker => worker(config).await,
        Action::Health => health(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "warden_failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

async fn supervise(
    mut config: Config,
    workers: Option<usize>,
    program: Vec<String>,
) -> Result<ExitCode> {
    if let Some(workers) = workers {
        config.supervisor.workers = workers;
        config.validate()?;
    }

    let launcher: Arc<dyn WorkerLauncher> = match program.split_first() {
        Some((program, args)) => Arc::new(CommandLauncher::new(program, args.to_vec())),
        None => Arc::new(CommandLauncher::current_exe()?),
    };

    let monitor = HealthMonitor::new(config.health.clone(), Arc::new(SysinfoProbe::new()));
    let timers = monitor.start();

    let supervisor = Supervisor::new(config.supervisor.clone(), launcher, monitor.clone());
    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::info!("termination_requested");
        shutdown.cancel();
    });

    let report = supervisor.run().await?;
    monitor.stop();
    let _ = timers.await;

    tracing::info!(
        launches = report.launches,
        restarts = report.restarts,
        crashes = report.crashes,
        launch_failures = report.launch_failures,
        "warden_stopped"
    );
    Ok(ExitCode::SUCCESS)
}

async fn worker(config: Config) -> Result<ExitCode> {
    let slot = slot_from_env()?;
    let addr: SocketAddr = config.supervisor.listen_addr.parse().map_err(|e| {
        Error::config(format!(
            "invalid listen address {:?}: {}",
            config.supervisor.listen_addr, e
        ))
    })?;

    let probe: Arc<dyn ResourceProbe> = Arc::new(SysinfoProbe::new());
    let monitor = HealthMonitor::new(config.health.clone(), probe.clone());
    let timers = monitor.start();

    let limiter = Arc::new(Mutex::new(RateLimiter::new(&config.rate_limit)));
    let mut sweeper = SweepService::new(limiter.clone(), &config.rate_limit);
    let _sweep = sweeper.start();

    let server = StatusServer::new(
        addr,
        StatusState {
            monitor: monitor.clone(),
            resilience: ResilienceHandle::from_config(config.resilience.clone()),
            limiter,
        },
    );

    let exit = WorkerRuntime::new(config.supervisor.clone(), slot, probe, Arc::new(StdoutReporter))
        .with_monitor(monitor.clone())
        .run(server)
        .await;

    sweeper.stop();
    monitor.stop();
    let _ = timers.await;

    // Exit codes are 0..=143.
    Ok(ExitCode::from(exit.code() as u8))
}

async fn health(config: Config) -> Result<ExitCode> {
    let snapshot = read_snapshot(&config.health.health_file).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(ExitCode::SUCCESS)
}
