//! matrix-orchestrator CLI entry point.

use clap::Parser;
use matrix_orchestrator::chat::HttpChatClient;
use matrix_orchestrator::config::{resolve_config_path, Config};
use matrix_orchestrator::sandbox::SparkCliClient;
use matrix_orchestrator::scheduler::TaskScheduler;
use matrix_orchestrator::state::StateStore;
use matrix_orchestrator::telemetry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "matrix-orchestrator", version)]
#[command(about = "Turns Matrix lobby messages into sandboxed coding-agent tasks")]
struct Cli {
    /// Path to the orchestrator config file (defaults to
    /// MATRIX_ORCHESTRATOR_CONFIG or ./orchestrator.yaml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging, overriding LOG_LEVEL
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Reconcile, then run the sync loop until a shutdown signal (default).
    Run,
    /// Reconcile declared config against chat/sandbox resources once, then exit.
    Reconcile,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug".to_string()
    } else {
        matrix_orchestrator::config::log_level_from_env()
    };
    telemetry::init(&log_level);

    if let Err(error) = run(cli).await {
        tracing::error!(%error, "fatal startup failure");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> matrix_orchestrator::Result<()> {
    let command = cli.command.unwrap_or(Command::Run);
    let config_path = resolve_config_path(cli.config);
    let config = Config::load(&config_path)?;

    let chat = HttpChatClient::connect(&config).await?;
    let sandbox = SparkCliClient::default();
    let state = StateStore::load(&config.runtime.state_file)?;

    let mut scheduler = TaskScheduler::new(&chat, &sandbox, state, &config);
    scheduler.initialize().await?;

    if matches!(command, Command::Reconcile) {
        tracing::info!("reconcile complete, exiting");
        return Ok(());
    }

    let is_running = Arc::new(AtomicBool::new(true));
    install_signal_handlers(is_running.clone());

    tracing::info!("matrix-orchestrator started");
    scheduler.run_loop(|| is_running.load(Ordering::SeqCst)).await?;
    tracing::info!("matrix-orchestrator stopped");

    Ok(())
}

/// Install `ctrl_c` and SIGTERM handlers that flip `is_running` to false.
/// The scheduler's `shouldContinue` predicate reads this flag at the top
/// of every loop iteration.
fn install_signal_handlers(is_running: Arc<AtomicBool>) {
    let ctrl_c_flag = is_running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            ctrl_c_flag.store(false, Ordering::SeqCst);
        }
    });

    #[cfg(unix)]
    {
        let term_flag = is_running;
        tokio::spawn(async move {
            let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
                return;
            };
            if term.recv().await.is_some() {
                tracing::info!("SIGTERM received");
                term_flag.store(false, Ordering::SeqCst);
            }
        });
    }
}
