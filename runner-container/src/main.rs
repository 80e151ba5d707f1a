use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use replicator_core::config::{ReplicatorConfig, load_config};
use replicator_core::engine::EngineSettings;
use replicator_core::errors::BrokerError;
use replicator_core::processor::MessageProcessor;
use replicator_core::retry::{RetryExecutor, RetryPolicy};
use replicator_core::sink::{GrpcInventoryClient, check_readiness};
use replicator_core::source::BrokerConsumer;
use replicator_core::source::kafka::KafkaBrokerConsumer;
use replicator_core::supervisor::Supervisor;
use replicator_core::telemetry::{ConsumerMetrics, DEFAULT_LOG_DIRECTIVE, StatsCollector, init_tracing};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Long-running replication job for container hosting services.
///
/// Consumes outbox change events from Kafka and replicates them to the
/// inventory service until a shutdown signal is received.
#[derive(Parser)]
#[command(name = "runner-container")]
#[command(about = "Replicates outbox change events from Kafka to the inventory API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start consuming
    Start {
        /// YAML config file; falls back to the REPLICATOR_CONFIG environment variable
        #[arg(long, env = "REPLICATOR_CONFIG_FILE")]
        config: Option<String>,

        /// Address serving `GET /metrics`
        #[arg(long, default_value = "0.0.0.0:9000")]
        metrics_addr: SocketAddr,
    },
    /// Check that the inventory API is reachable
    Readyz {
        #[arg(long, env = "REPLICATOR_CONFIG_FILE")]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(DEFAULT_LOG_DIRECTIVE);

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Start { config, metrics_addr } => start(config.as_deref(), metrics_addr).await,
        Commands::Readyz { config } => readyz(config.as_deref()).await,
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

fn config(path: Option<&str>) -> Result<ReplicatorConfig> {
    let config = load_config(path).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    config.log_summary();
    Ok(config)
}

async fn start(config_path: Option<&str>, metrics_addr: SocketAddr) -> Result<()> {
    let config = config(config_path)?;
    let consumer_options = config.consumer.clone();

    let registry = Registry::new();
    let metrics = ConsumerMetrics::new(&registry).context("failed to register consumer metrics")?;
    let stats = StatsCollector::new(&registry, consumer_options.topics.clone())
        .context("failed to register stats metrics")?;

    let client = GrpcInventoryClient::new(&config.client).context("failed to create inventory client")?;
    let retry = RetryExecutor::new(
        RetryPolicy::for_operations(&consumer_options.retry),
        metrics.clone(),
    );
    let processor = Arc::new(MessageProcessor::new(Arc::new(client), retry, metrics.clone()));

    let cancel = CancellationToken::new();
    tokio::spawn(serve_metrics(metrics_addr, registry));
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    let options = consumer_options.clone();
    let factory = move || -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        Ok(Box::new(KafkaBrokerConsumer::new(&options)?))
    };

    let supervisor = Supervisor::new(
        factory,
        EngineSettings::from_options(&consumer_options),
        processor,
        metrics,
        RetryPolicy::for_restarts(&consumer_options.retry),
        cancel,
    )
    .with_stats(stats);

    info!("starting inventory consumer");
    supervisor.run().await.context("consumer stopped")?;
    info!("consumer stopped");
    Ok(())
}

async fn readyz(config_path: Option<&str>) -> Result<()> {
    let config = config(config_path)?;
    if !config.client.enabled {
        info!("inventory client disabled, nothing to check");
        return Ok(());
    }
    let status = check_readiness(&config.client)
        .await
        .context("inventory API is not ready")?;
    info!(%status, "inventory API is ready");
    Ok(())
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
    cancel.cancel();
}

async fn serve_metrics(addr: SocketAddr, registry: Registry) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind metrics listener");
            return;
        }
    };
    info!(%addr, "serving metrics");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "metrics server stopped");
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}
