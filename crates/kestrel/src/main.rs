//! Kestrel launcher.
//!
//! `kestrel run` brings the pipeline up and drains it cleanly on
//! SIGINT/SIGTERM; `kestrel check` validates a configuration and prints
//! what would be watched. The exit code reflects the drain: 0 for a clean
//! drain, 1 for startup failure, 2 when the grace period expired with
//! residual items.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use kestrel::config::Config;
use kestrel::pipeline::{Pipeline, ShutdownOutcome};
use kestrel::sink::JsonlSink;

#[derive(Parser, Debug)]
#[command(name = "kestrel", about = "Watch folders and shares; deliver file changes downstream")]
struct Cli {
    /// Enable verbose logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short = 'c', long, global = true, default_value = "kestrel.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingestion pipeline until interrupted
    Run,
    /// Validate the configuration and list the targets it defines
    Check,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = kestrel_logging::init_logging("kestrel", cli.verbose) {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build runtime");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::Run => runtime.block_on(cmd_run(&cli.config)),
        Commands::Check => cmd_check(&cli.config),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("kestrel failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn cmd_run(config_path: &PathBuf) -> Result<ExitCode> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let sink = JsonlSink::create(&config.sink.spool_path)
        .await
        .with_context(|| {
            format!("opening spool {}", config.sink.spool_path.display())
        })?;
    info!(spool = %sink.path().display(), "delivering events to JSONL spool");

    let pipeline = Pipeline::start(&config, Arc::new(sink))
        .await
        .context("starting pipeline")?;

    wait_for_shutdown_signal().await;

    match pipeline.shutdown().await {
        ShutdownOutcome::Drained(report) => {
            if report.terminal_failures > 0 {
                info!(
                    terminal_failures = report.terminal_failures,
                    "some items terminally failed; see log for paths"
                );
            }
            Ok(ExitCode::from(0))
        }
        ShutdownOutcome::TimedOut => Ok(ExitCode::from(2)),
    }
}

fn cmd_check(config_path: &PathBuf) -> Result<ExitCode> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let targets = config.build_targets()?;

    println!("configuration ok: {} target(s)", targets.len());
    for target in &targets {
        println!(
            "  {}  {}  [{}]  poll={}ms recursive={}",
            target.id,
            target.uri,
            target.kind,
            target.poll_interval.as_millis(),
            target.recursive,
        );
    }
    Ok(ExitCode::from(0))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("termination signal received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}
