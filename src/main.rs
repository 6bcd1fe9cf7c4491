use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use restrictor::config::{AppConfig, LoggingConfig};
use restrictor::store::{CounterStore, MemoryStore, MemoryStoreConfig, TimeoutStore};
use restrictor::{Decision, Restrictor};

/// Decide admissions for subject keys read from stdin, one per line.
#[derive(Debug, Parser)]
#[command(name = "restrictor", version, about)]
struct Args {
    /// Path to a configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the rolling window in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,

    /// Override the admissions allowed per window
    #[arg(long)]
    limit: Option<u64>,

    /// Override the number of buckets per window
    #[arg(long)]
    buckets: Option<u32>,

    /// Print one JSON object per decision
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(window_ms) = args.window_ms {
        config.restrictor.window_ms = window_ms;
    }
    if let Some(limit) = args.limit {
        config.restrictor.limit = limit;
    }
    if let Some(buckets) = args.buckets {
        config.restrictor.bucket_count = buckets;
    }

    init_tracing(&config.logging);

    log_startup(args.config.as_deref());

    let store = Arc::new(MemoryStore::with_config(MemoryStoreConfig {
        shard_amount: config.store.shard_amount,
    })?);
    let sweeper = config
        .store
        .sweep_interval()
        .map(|interval| store.spawn_sweeper(interval));

    match config.store.timeout() {
        Some(timeout) => {
            let store = Arc::new(TimeoutStore::new(store, timeout));
            let restrictor = Restrictor::from_config(&config.restrictor, store)?;
            run(restrictor, args.json).await?;
        }
        None => {
            let restrictor = Restrictor::from_config(&config.restrictor, store)?;
            run(restrictor, args.json).await?;
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Restrictor stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // stdout carries decisions, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Startup banner, emitted once the subscriber is installed.
fn log_startup(config_path: Option<&Path>) {
    info!("Starting restrictor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration file");
    }
}

/// Answer one decision per input line until stdin closes or a shutdown signal arrives.
async fn run<S: CounterStore>(restrictor: Restrictor<S>, json: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            info!("Input closed");
            break;
        };

        let subject = line.trim();
        if subject.is_empty() {
            continue;
        }

        let output = match restrictor.decide(subject).await {
            Ok(decision) => format_decision(subject, decision, None, json),
            Err(e) => {
                warn!(subject = %subject, error = %e, "Decision failed, denying");
                format_decision(subject, Decision::Denied, Some(e.to_string()), json)
            }
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn format_decision(subject: &str, decision: Decision, error: Option<String>, json: bool) -> String {
    let verdict = if decision.is_admitted() { "admitted" } else { "denied" };

    if json {
        serde_json::json!({
            "subject": subject,
            "decision": verdict,
            "error": error,
        })
        .to_string()
    } else {
        match error {
            Some(error) => format!("{}\t{}\t{}", subject, verdict, error),
            None => format!("{}\t{}", subject, verdict),
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
