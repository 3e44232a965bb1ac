//! Campaign Dispatch: scheduled email campaign sending, import and
//! validation queues, and send-time statistics.
//!
//! Main entry point that wires the services together and runs until Ctrl-C.

mod handlers;
mod seed;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use campaign_batch::{BatchProcessor, QueueService, QueueWorker};
use campaign_core::config::{AppConfig, MetricsConfig};
use campaign_core::event_bus::{EventSink, TracingSink};
use campaign_intelligent_delivery::{OpenHistory, SendTimeOptimizer};
use campaign_scheduler::{CampaignScheduler, InMemoryCampaignStore};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::handlers::{BatchedSender, ImportHandler, ValidationHandler};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_LOG_FILTER: &str = "campaign_dispatch=info,campaign_scheduler=info,\
campaign_batch=info,campaign_intelligent_delivery=info";

#[derive(Parser, Debug)]
#[command(name = "campaign-dispatch")]
#[command(about = "Scheduled campaign dispatch with import and validation queues")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "CAMPAIGN_DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_DISPATCH__NODE_ID")]
    node_id: Option<String>,

    /// Scheduler tick interval in seconds (overrides config)
    #[arg(long, env = "CAMPAIGN_DISPATCH__SCHEDULER__TICK_INTERVAL_SECS")]
    tick_secs: Option<u64>,

    /// Workers per queue (overrides config)
    #[arg(long, env = "CAMPAIGN_DISPATCH__QUEUE__WORKER_CONCURRENCY")]
    worker_concurrency: Option<usize>,

    /// JSON file with opens, campaigns and jobs to load at startup
    #[arg(long, env = "CAMPAIGN_DISPATCH_SEED")]
    seed: Option<PathBuf>,

    /// Run the queues only, without the campaign scheduler
    #[arg(long, default_value_t = false)]
    queues_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Dispatch starting up");

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.tick_secs {
        config.scheduler.tick_interval_secs = secs;
    }
    if let Some(workers) = cli.worker_concurrency {
        config.queue.worker_concurrency = workers;
    }
    if cli.queues_only {
        config.scheduler.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        scheduler_enabled = config.scheduler.enabled,
        tick_secs = config.scheduler.tick_interval_secs,
        worker_concurrency = config.queue.worker_concurrency,
        batch_size = config.batch.batch_size,
        "Configuration loaded"
    );

    // Start metrics exporter
    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config.metrics) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let batch = BatchProcessor::from_config(&config.batch);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // Campaign scheduler
    let scheduler = Arc::new(
        CampaignScheduler::new(
            Arc::new(InMemoryCampaignStore::new()),
            Arc::new(BatchedSender::new(batch.clone())),
            &config.scheduler,
        )
        .with_event_sink(events.clone()),
    );

    // Import and validation queues
    let queues = Arc::new(QueueService::new(&config.queue).with_event_sink(events.clone()));
    let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);

    let import_worker = Arc::new(
        QueueWorker::new(
            queues.import_queue().clone(),
            Arc::new(ImportHandler::new(batch.clone())),
            config.queue.worker_concurrency,
            poll_interval,
        )
        .with_event_sink(events.clone()),
    );
    handles.extend(import_worker.spawn(shutdown_rx.clone()));

    let validation_worker = Arc::new(
        QueueWorker::new(
            queues.validation_queue().clone(),
            Arc::new(ValidationHandler::new(batch.clone())),
            config.queue.worker_concurrency,
            poll_interval,
        )
        .with_event_sink(events.clone()),
    );
    handles.extend(validation_worker.spawn(shutdown_rx.clone()));

    // Open history and send-time statistics
    let history = Arc::new(OpenHistory::new().with_event_sink(events.clone()));
    let optimizer = SendTimeOptimizer::new(history, config.send_time.clone());

    if let Some(path) = cli.seed.as_deref() {
        let seed = seed::load(path).await?;
        seed::apply(seed, &scheduler, &queues, &optimizer, chrono::Utc::now())?;
    }

    if config.scheduler.enabled {
        handles.push(scheduler.clone().spawn(shutdown_rx.clone()));
    } else {
        info!("Campaign scheduler disabled");
    }

    // Spawn queue cleanup and statistics task
    let queues_for_maintenance = queues.clone();
    let mut maintenance_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    queues_for_maintenance.cleanup_queues(queues_for_maintenance.cleanup_grace());
                    let stats = queues_for_maintenance.get_queue_stats();
                    info!(
                        import_waiting = stats.import.waiting,
                        import_failed = stats.import.failed,
                        validation_waiting = stats.validation.waiting,
                        validation_failed = stats.validation.failed,
                        "Queue statistics"
                    );
                    if let Some((hour, day)) = optimizer.global_optimal_time() {
                        info!(
                            hour,
                            day,
                            top_hours = ?optimizer.top_open_hours(3),
                            "Global send-time statistics"
                        );
                    }
                }
                changed = maintenance_shutdown.changed() => {
                    if changed.is_err() || *maintenance_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    info!(scheduled = scheduler.list_scheduled().len(), "Campaign Dispatch is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Receivers may already be gone if every task has exited
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    let stats = queues.get_queue_stats();
    info!(
        import_active = stats.import.active,
        validation_active = stats.validation.active,
        "Campaign Dispatch stopped"
    );
    Ok(())
}

fn start_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.port, "Metrics exporter started");
    Ok(())
}
