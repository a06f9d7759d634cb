mod admin;
mod bootstrap;
mod health;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use adloop_core::config::{AppConfig, LoadOptions};
use adloop_core::queue::QueueEngine;
use adloop_db::repositories::{
    SqlActionRepository, SqlCycleRepository, SqlInsightRepository, SqlJobRepository,
    SqlLeaseRepository, SqlModelRepository, SqlSnapshotRepository,
};
use adloop_edge::{DecisionCache, EdgeState, ExperimentAssigner, HttpOrigin};
use adloop_worker::{
    ChallengerEvaluator, FeatureLedger, HttpModelService, HttpPlatformClient,
    IngestionLoop, InsightCompoundingStage, JobConsumer, LearningStage, Orchestrator,
    PatternExtractionStage, RetrainTriggerStage, SafeExecutor, SharedLedger, SnapshotIntake,
};

fn init_logging(config: &AppConfig) {
    use adloop_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let pool = app.db_pool.clone();
    let settings = app.settings.clone();
    let config = app.config;

    let snapshots = Arc::new(SqlSnapshotRepository::new(pool.clone()));
    let jobs = Arc::new(SqlJobRepository::new(pool.clone()));
    let insights = Arc::new(SqlInsightRepository::new(pool.clone()));
    let models = Arc::new(SqlModelRepository::new(pool.clone()));
    let actions = Arc::new(SqlActionRepository::new(pool.clone()));
    let lease = Arc::new(SqlLeaseRepository::new(pool.clone()));
    let cycles = Arc::new(SqlCycleRepository::new(pool.clone()));

    let queue = QueueEngine::new(config.queue.engine_config());
    let poll_interval = Duration::from_secs(config.queue.poll_interval_secs);
    let worker_id = format!("adloop-{}", Uuid::new_v4());

    let platform = Arc::new(HttpPlatformClient::new(&config.platform)?);
    let model_service = Arc::new(HttpModelService::new(&config.platform)?);

    // Intake and the durable-queue consumer.
    let intake = Arc::new(SnapshotIntake::new(
        snapshots.clone(),
        jobs.clone(),
        queue.clone(),
        settings.clone(),
    ));
    let ingestion = IngestionLoop::new(intake, platform.clone(), poll_interval);

    let evaluator = Arc::new(ChallengerEvaluator::new(
        models.clone(),
        model_service.clone(),
        settings.clone(),
    ));
    let consumer = JobConsumer::new(
        jobs.clone(),
        snapshots,
        insights.clone(),
        evaluator,
        queue.clone(),
        worker_id.clone(),
    );

    // Learning cycle under the shared feature ledger.
    let ledger: SharedLedger = Arc::new(Mutex::new(FeatureLedger::default()));
    let stages: Vec<Arc<dyn LearningStage>> = vec![
        Arc::new(PatternExtractionStage::new(insights, ledger.clone())),
        Arc::new(InsightCompoundingStage::new(ledger.clone())),
        Arc::new(RetrainTriggerStage::new(
            ledger,
            model_service,
            models,
            jobs.clone(),
            queue,
            settings.clone(),
        )),
    ];
    let orchestrator =
        Orchestrator::new(stages, lease, cycles.clone(), settings.clone(), worker_id);
    let (cycle_tx, cycle_rx) = mpsc::channel(1);

    let executor = SafeExecutor::new(actions.clone(), platform, settings.clone());

    // Edge serving layer.
    let origin = Arc::new(HttpOrigin::new(&config.edge.origin_base_url, config.edge.origin_timeout_ms)?);
    let cache = DecisionCache::new(origin.clone(), &config.edge);
    let assigner = Arc::new(ExperimentAssigner::new(origin.clone(), &config.edge));
    let edge_state = EdgeState::new(cache, assigner, origin);

    let admin_state =
        admin::AdminState::new(jobs, actions, cycles, settings.clone(), cycle_tx);
    let router = health::router(pool)
        .merge(admin::router(admin_state))
        .merge(adloop_edge::router(edge_state));

    tokio::spawn(ingestion.run());
    tokio::spawn(consumer.run_loop(poll_interval));
    tokio::spawn(orchestrator.run_loop(cycle_rx));
    tokio::spawn(executor.run_loop());

    let address = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "adloop-server started"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "adloop-server stopping"
    );

    let _ = shutdown_tx.send(());
    let grace = Duration::from_secs(config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(served) => served??,
        Err(_) => {
            tracing::warn!(
                event_name = "system.server.shutdown_timeout",
                correlation_id = "shutdown",
                grace_secs = config.server.graceful_shutdown_secs,
                "graceful shutdown window elapsed, exiting with connections open"
            );
        }
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
