//! # Tracker Worker Entry Point
//!
//! Opens the document store, classifies the catalog once, then runs every
//! periodic task on its own scheduler until Ctrl-C.

use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tracker::collector::FileCheckpointStore;
use tracker::provider::{HttpListingProvider, HttpMetricsProvider};
use tracker::{
    CollectorConfig, Compactor, ListingPoller, Pacer, PeriodicTask, Scheduler, SchedulerConfig,
    SqliteStore, Store, SummaryCalculator, TaskError, TierBoard, TierClassifier, TieredCollector,
    WorkerConfig,
};

fn scheduled<T: PeriodicTask + 'static>(
    task: Arc<T>,
    schedule: SchedulerConfig,
) -> (Arc<dyn PeriodicTask>, SchedulerConfig) {
    (task, schedule)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=================================================");
    println!("  Map Tracker - Tiered Activity Worker           ");
    println!("=================================================");

    let config = WorkerConfig::from_env()?;
    info!(
        "Upstream budget {} requests/s (hot {}, warm {}, cold {})",
        config.upstream_requests_per_second(),
        config.hot.requests_per_second,
        config.warm.requests_per_second,
        config.cold.requests_per_second
    );
    info!("Opening store at {}", config.store_path.display());
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store_path)?);

    let board = Arc::new(TierBoard::load(store.as_ref()));
    let metrics = Arc::new(HttpMetricsProvider::new(config.provider.clone())?);
    let listings = Arc::new(HttpListingProvider::new(config.provider.clone())?);

    let classifier = Arc::new(TierClassifier::new(
        Arc::clone(&store),
        Arc::clone(&board),
        config.classifier.clone(),
    ));
    match classifier.classify() {
        Ok(_) => {}
        Err(TaskError::Fatal(reason)) => return Err(reason.into()),
        Err(e) => warn!("Initial classification failed, using restored tiers: {}", e),
    }

    let collector = |collector_config: &CollectorConfig| {
        TieredCollector::new(
            collector_config.clone(),
            Arc::clone(&board),
            metrics.clone(),
            Arc::clone(&store),
            Arc::new(Pacer::per_second(collector_config.requests_per_second, 1)),
        )
    };
    let cold = collector(&config.cold)
        .with_checkpoint(Arc::new(FileCheckpointStore::open(&config.checkpoint_path)?));

    let cadences = &config.cadences;
    let mut tasks: Vec<(Arc<dyn PeriodicTask>, SchedulerConfig)> = Vec::new();
    tasks.push(scheduled(
        Arc::new(collector(&config.hot)),
        SchedulerConfig::every(config.hot.cadence),
    ));
    tasks.push(scheduled(
        Arc::new(collector(&config.warm)),
        SchedulerConfig::every(config.warm.cadence),
    ));
    tasks.push(scheduled(
        Arc::new(cold),
        SchedulerConfig::every(config.cold.cadence),
    ));
    tasks.push(scheduled(
        Arc::new(ListingPoller::new(
            listings,
            Arc::clone(&store),
            config.listing.clone(),
        )),
        SchedulerConfig::every(cadences.listing),
    ));
    tasks.push(scheduled(
        classifier,
        SchedulerConfig {
            run_on_start: false,
            ..SchedulerConfig::every(cadences.classification)
        },
    ));
    tasks.push(scheduled(
        Arc::new(SummaryCalculator::new(Arc::clone(&store))),
        SchedulerConfig::every(cadences.summary),
    ));
    tasks.push(scheduled(
        Arc::new(Compactor::new(Arc::clone(&store), config.compaction.clone())?),
        SchedulerConfig {
            run_on_start: false,
            ..SchedulerConfig::every(cadences.compaction)
        },
    ));

    let cancel = CancellationToken::new();
    let mut running = JoinSet::new();
    for (task, schedule) in tasks {
        let scheduler = Arc::new(Scheduler::new(task, schedule));
        running.spawn(scheduler.start(cancel.clone()));
    }
    info!("Started {} schedulers", running.len());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested, letting running cycles finish");
        }
        _ = async { while running.join_next().await.is_some() {} } => {
            warn!("Every scheduler has stopped");
        }
    }

    cancel.cancel();
    while let Some(result) = running.join_next().await {
        if let Err(e) = result {
            error!("Scheduler task panicked: {}", e);
        }
    }

    println!("=================================================");
    println!("  Map Tracker Shut Down");
    println!("=================================================");
    Ok(())
}
