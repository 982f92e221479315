use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keyrate::config::{KeyrateConfig, LogFormat, LoggingConfig, SourceKind};
use keyrate::source::{ConfigSource, FileSource, MemorySource};
use keyrate::{ConfigController, RateLimiter};

/// Per-key rate limiting with hot-reloaded rules.
#[derive(Debug, Parser)]
#[command(name = "keyrate", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured log filter
    #[arg(long)]
    log_level: Option<String>,

    /// Read request keys from stdin and print a decision for each line
    #[arg(long)]
    stdin: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = KeyrateConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging);

    info!("Starting Keyrate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        config_key = %config.limiter.config_key,
        reload_interval_secs = config.limiter.reload_interval_secs,
        startup_policy = ?config.limiter.startup_policy,
        source = ?config.source.kind,
        "Configuration loaded"
    );

    let source = build_source(&config);
    let rate_limiter = Arc::new(RateLimiter::new());

    let mut controller = ConfigController::new(rate_limiter.clone(), source.clone(), &config.limiter);
    controller.bootstrap().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let daemon = {
        let source = source.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { source.daemon(shutdown).await })
    };
    let reload = tokio::spawn(controller.run(shutdown_rx));

    if args.stdin {
        tokio::select! {
            _ = answer_stdin(rate_limiter.clone()) => {}
            _ = shutdown_signal() => {}
        }
    } else {
        shutdown_signal().await;
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = daemon.await {
        warn!(error = %e, "Config source daemon ended abnormally");
    }
    reload.await?;

    info!("Keyrate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_source(config: &KeyrateConfig) -> Arc<dyn ConfigSource> {
    match config.source.kind {
        SourceKind::File => {
            let mut source = FileSource::new(&config.source.path);
            if config.source.poll_interval_secs > 0 {
                source = source.with_watch(
                    config.limiter.config_key.clone(),
                    Duration::from_secs(config.source.poll_interval_secs),
                );
            }
            info!(path = %config.source.path.display(), "Using file rule source");
            Arc::new(source)
        }
        SourceKind::Memory => {
            info!("Using empty in-memory rule source");
            Arc::new(MemorySource::new())
        }
    }
}

/// Answer one decision per stdin line until EOF.
async fn answer_stdin(rate_limiter: Arc<RateLimiter>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let key = line.trim();
                if key.is_empty() {
                    continue;
                }
                let verdict = if rate_limiter.decide(key) { "limited" } else { "allowed" };
                println!("{} {}", verdict, key);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                break;
            }
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
