//! CLI command implementations
//!
//! Each command loads the configuration, initialises logging, then runs on
//! a multi-threaded Tokio runtime built here.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::broker::{AmqpConnector, BrokerConnector};
use crate::config::{Config, LogFormat, LoggingSection};
use crate::consumer::ReplicationWorker;
use crate::envelope::MutationRequest;
use crate::mirror::PostgresMirror;
use crate::outcome::{AlertDispatcher, DailyFileOutcomeLog, SmtpAlertSender};
use crate::publisher::Publisher;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_request, write_error, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    let publishing = matches!(cli.command, Command::Publish { .. });

    let result = run_command(cli.command);
    if let (true, Err(e)) = (publishing, &result) {
        // Publish callers read stdout; give them the failure there too.
        let _ = write_error(e.code_str(), e.message());
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::io_error(format!("Failed to start runtime: {}", e)))?;

    match cmd {
        Command::Consume { config } => runtime.block_on(consume(&config)),
        Command::Publish { config, file } => runtime.block_on(publish(&config, file.as_deref())),
        Command::Topology { config } => runtime.block_on(topology(&config)),
    }
}

/// Run the replication worker until SIGINT/SIGTERM
///
/// Startup order:
/// 1. Configuration load
/// 2. Mirror pool (connections open lazily)
/// 3. Outcome log and alert dispatcher
/// 4. Broker connect under deadline, topology, subscription
pub async fn consume(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    init_logging(&config.logging);

    let store = Arc::new(PostgresMirror::connect(&config.postgres_config()?)?);
    let outcome_log = Arc::new(DailyFileOutcomeLog::new(
        &config.outcome_log.dir,
        config.outcome_log.category.clone(),
    ));

    let lost_alerts = Arc::new(AtomicU64::new(0));
    let alerts = match &config.alert {
        Some(alert_config) => {
            let sender = Arc::new(SmtpAlertSender::new(alert_config.clone()));
            let (dispatcher, mut failures) = AlertDispatcher::spawn(sender);

            let lost = Arc::clone(&lost_alerts);
            tokio::spawn(async move {
                while failures.recv().await.is_some() {
                    lost.fetch_add(1, Ordering::Relaxed);
                }
            });
            dispatcher
        }
        None => {
            info!("no alert section configured; failures are only logged");
            AlertDispatcher::disabled()
        }
    };

    let connector = Arc::new(AmqpConnector::new(
        config.broker.uri.clone(),
        config.connect_timeout(),
    ));
    let worker = ReplicationWorker::new(
        connector,
        config.topology(),
        store,
        Arc::new(config.registry()),
        outcome_log,
        alerts,
        config.worker_settings(),
    );

    let result = worker.run(wait_for_shutdown_signal()).await;

    let lost = lost_alerts.load(Ordering::Relaxed);
    if lost > 0 {
        warn!(lost, "operator alerts could not be delivered during this run");
    }

    result?;
    info!("goodbye");
    Ok(())
}

/// Publish one request read from a file or stdin
pub async fn publish(config_path: &Path, file: Option<&Path>) -> CliResult<()> {
    let config = Config::load(config_path)?;
    init_logging(&config.logging);

    let request: MutationRequest = serde_json::from_value(read_request(file)?)?;

    let connector = Arc::new(AmqpConnector::new(
        config.broker.uri.clone(),
        config.connect_timeout(),
    ));
    let receipt = Publisher::new(connector, config.topology())
        .publish(request)
        .await?;

    write_response(serde_json::to_value(&receipt)?)
}

/// Assert the broker topology and exit
pub async fn topology(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    init_logging(&config.logging);

    let topology = config.topology();
    let connector = AmqpConnector::new(config.broker.uri.clone(), config.connect_timeout());

    let channel = connector.open().await?;
    let asserted = channel.assert_topology(&topology).await;
    if let Err(e) = channel.close().await {
        warn!(error = %e, "channel close failed");
    }
    asserted?;

    info!(%topology, "topology asserted");
    write_response(json!({
        "exchange": topology.exchange,
        "queue": topology.queue,
        "dead_letter_queue": topology.dead_letter_queue,
    }))
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingSection) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout is reserved for command output
    let installed = match logging.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
