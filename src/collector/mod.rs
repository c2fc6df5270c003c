//! # Tiered Collector
//!
//! One parameterized collector serves all three tiers. A cycle pulls the
//! tier's population from the [`TierBoard`] (or the next rotation slice for
//! Cold), requests each entity's metrics over the lookback window at the
//! pace allowed by the request budget, and streams non-empty samples into a
//! [`BulkWriter`].
//!
//! ## Per-cycle flow
//!
//! ```text
//! Idle -> Fetch(i) -> { ok | no data | transient error } -> Fetch(i+1) ... -> Flush -> Idle
//! ```
//!
//! A failed entity is counted and skipped; the next scheduled cycle retries it.
//! Only systemic failures (rejected credentials, unreachable store) end a
//! cycle early, as [`TaskError::Fatal`].

pub mod checkpoint;

pub use checkpoint::{
    load_or_reset, CheckpointStore, FileCheckpointStore, RotationCursor, StoreCheckpointStore,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CollectorConfig, PopulationSource};
use crate::error::{ProviderError, TaskError};
use crate::pacer::Pacer;
use crate::provider::{samples_from_series, MetricsProvider};
use crate::scheduler::{PeriodicTask, RunStats};
use crate::store::{collections, BulkWriter, Document, Store};
use crate::tiers::TierBoard;
use crate::types::{EntityId, Tier};

/// Counts for one collection cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleStats {
    pub tier: Option<Tier>,
    /// Entities selected for the cycle
    pub selected: usize,
    /// Entities a request was issued for
    pub processed: usize,
    /// Entities that yielded at least one sample
    pub succeeded: usize,
    /// Entities with nothing storable in the window
    pub no_data: usize,
    /// Entities whose request failed
    pub failed: usize,
    /// Subset of `failed` rejected by the provider's rate limit
    pub rate_limited: usize,
    /// Entities left unprocessed because of shutdown
    pub skipped: usize,
    pub samples_written: usize,
    pub write_failed: usize,
    pub duration_ms: u64,
}

impl From<CycleStats> for RunStats {
    fn from(stats: CycleStats) -> Self {
        RunStats {
            processed: stats.processed,
            succeeded: stats.succeeded,
            no_data: stats.no_data,
            failed: stats.failed,
            note: Some(format!(
                "samples={} write_failed={} rate_limited={} skipped={}",
                stats.samples_written, stats.write_failed, stats.rate_limited, stats.skipped
            )),
        }
    }
}

/// Collector for one tier.
pub struct TieredCollector {
    name: String,
    config: CollectorConfig,
    board: Arc<TierBoard>,
    metrics: Arc<dyn MetricsProvider>,
    store: Arc<dyn Store>,
    pacer: Arc<Pacer>,
    checkpoint: Arc<dyn CheckpointStore>,
}

impl TieredCollector {
    /// Builds a collector. Rotating collectors checkpoint into the `control`
    /// collection unless [`with_checkpoint`](Self::with_checkpoint) overrides it.
    pub fn new(
        config: CollectorConfig,
        board: Arc<TierBoard>,
        metrics: Arc<dyn MetricsProvider>,
        store: Arc<dyn Store>,
        pacer: Arc<Pacer>,
    ) -> Self {
        let checkpoint = Arc::new(StoreCheckpointStore::new(
            Arc::clone(&store),
            format!("{}_rotation", config.tier),
        ));
        Self {
            name: format!("{}-collector", config.tier),
            config,
            board,
            metrics,
            store,
            pacer,
            checkpoint,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Runs one cycle over the tier's population as of now.
    pub async fn run_tier(&self, cancel: &CancellationToken) -> Result<CycleStats, TaskError> {
        self.run_tier_at(Utc::now(), cancel).await
    }

    /// Selects the population, runs the cycle and, for a rotating
    /// population, advances the checkpoint once the cycle has completed.
    pub async fn run_tier_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleStats, TaskError> {
        let members = self.board.members(self.config.tier);

        match (&self.config.population, self.config.slice_size()) {
            (PopulationSource::Rotation { .. }, Some(slice_size)) => {
                let cursor = load_or_reset(self.checkpoint.as_ref()).map_err(|e| {
                    warn!("{} skipped, rotation checkpoint not loaded: {}", self.name, e);
                    TaskError::Failed(format!("rotation checkpoint not loaded: {}", e))
                })?;
                let (slice, mut next) = cursor.next_slice(&members, slice_size);
                debug!(
                    "{} rotation: slice of {} from index {} of {}",
                    self.name,
                    slice.len(),
                    cursor.cursor_index,
                    members.len()
                );

                let stats = self.run_cycle_at(slice, now, cancel).await?;
                if stats.skipped > 0 {
                    info!(
                        "{} interrupted with {} entities left, checkpoint not advanced",
                        self.name, stats.skipped
                    );
                    return Ok(stats);
                }

                next.last_run_at = Some(now);
                if let Err(e) = self.checkpoint.save(&next) {
                    error!(
                        "Failed to persist {} rotation checkpoint (cursor {}): {}",
                        self.name, next.cursor_index, e
                    );
                }
                Ok(stats)
            }
            _ => self.run_cycle_at(&members, now, cancel).await,
        }
    }

    /// Collects `entity_ids` over the lookback window ending now.
    pub async fn run_cycle(
        &self,
        entity_ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> Result<CycleStats, TaskError> {
        self.run_cycle_at(entity_ids, Utc::now(), cancel).await
    }

    /// Collects `entity_ids` over `[now - lookback, now)`, sequentially and paced.
    pub async fn run_cycle_at(
        &self,
        entity_ids: &[EntityId],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleStats, TaskError> {
        let start = Instant::now();
        let lookback = chrono::Duration::from_std(self.config.lookback)
            .map_err(|e| TaskError::Fatal(format!("Invalid lookback: {}", e)))?;
        let from = now - lookback;

        let mut stats = CycleStats {
            tier: Some(self.config.tier),
            selected: entity_ids.len(),
            ..Default::default()
        };
        let mut writer = BulkWriter::spawn(
            Arc::clone(&self.store),
            collections::SAMPLES,
            self.config.batch_size,
        );
        let mut fatal: Option<String> = None;

        for (i, entity_id) in entity_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                stats.skipped = entity_ids.len() - i;
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    stats.skipped = entity_ids.len() - i;
                    break;
                }
                _ = self.pacer.acquire() => {}
            }

            stats.processed += 1;
            let request = self
                .metrics
                .get_metrics(entity_id, self.config.granularity, from, now);

            let series = match tokio::time::timeout(self.config.call_timeout, request).await {
                Err(_) => Err(ProviderError::Timeout(self.config.call_timeout)),
                Ok(result) => result,
            };

            match series {
                Ok(Some(series)) => {
                    let samples = samples_from_series(entity_id, &series);
                    if samples.is_empty() {
                        stats.no_data += 1;
                        continue;
                    }
                    let mut pushed = 0;
                    for sample in &samples {
                        match Document::from_record(sample.doc_id(), sample) {
                            Ok(doc) => {
                                writer.push(doc).await;
                                pushed += 1;
                            }
                            Err(e) => {
                                warn!("Failed to encode sample {}: {}", sample.doc_id(), e);
                                stats.write_failed += 1;
                            }
                        }
                    }
                    if pushed > 0 {
                        stats.succeeded += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
                Ok(None) => stats.no_data += 1,
                Err(ProviderError::Malformed(reason)) => {
                    warn!("Unexpected metrics payload for {}: {}", entity_id, reason);
                    stats.no_data += 1;
                }
                Err(e) if e.is_systemic() => {
                    stats.failed += 1;
                    stats.skipped = entity_ids.len() - i - 1;
                    fatal = Some(format!("Metrics provider rejected credentials: {}", e));
                    break;
                }
                Err(e) => {
                    if matches!(e, ProviderError::RateLimited { .. }) {
                        stats.rate_limited += 1;
                    }
                    warn!("Metrics request for {} failed: {}", entity_id, e);
                    stats.failed += 1;
                }
            }
        }

        let write = writer.finish().await;
        stats.samples_written = write.written;
        stats.write_failed += write.failed;
        stats.duration_ms = start.elapsed().as_millis() as u64;

        if let Some(reason) = fatal.or(write.fatal) {
            return Err(TaskError::Fatal(reason));
        }
        Ok(stats)
    }
}

#[async_trait]
impl PeriodicTask for TieredCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<RunStats, TaskError> {
        self.run_tier(cancel).await.map(RunStats::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MetricPoint, MetricSeries};
    use crate::store::MemoryStore;
    use crate::types::Granularity;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Answers with one bucket per entity; behaviour per entity is scripted.
    #[derive(Default)]
    struct ScriptedMetrics {
        empty: Vec<String>,
        rate_limited: Vec<String>,
        unauthorized: Vec<String>,
        calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl MetricsProvider for ScriptedMetrics {
        async fn get_metrics(
            &self,
            entity_id: &EntityId,
            _granularity: Granularity,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Option<MetricSeries>, ProviderError> {
            let id = entity_id.to_string();
            self.calls.lock().push((id.clone(), from, to));
            if self.rate_limited.contains(&id) {
                return Err(ProviderError::RateLimited { retry_after: None });
            }
            if self.unauthorized.contains(&id) {
                return Err(ProviderError::Unauthorized(401));
            }
            if self.empty.contains(&id) {
                return Ok(None);
            }
            let mut series = MetricSeries::new();
            series.insert(
                "peakCCU".to_string(),
                vec![MetricPoint {
                    timestamp: from,
                    value: Some(7.0),
                }],
            );
            Ok(Some(series))
        }
    }

    fn ids(n: usize) -> Vec<EntityId> {
        (0..n)
            .map(|i| EntityId::parse(&format!("e{:03}", i)).unwrap())
            .collect()
    }

    fn collector(metrics: Arc<ScriptedMetrics>, store: &MemoryStore) -> TieredCollector {
        TieredCollector::new(
            CollectorConfig::hot(),
            Arc::new(TierBoard::new()),
            metrics,
            Arc::new(store.clone()),
            Arc::new(Pacer::unlimited()),
        )
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_the_cycle() {
        let metrics = Arc::new(ScriptedMetrics {
            empty: vec!["e001".into()],
            rate_limited: vec!["e002".into()],
            ..Default::default()
        });
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();

        let stats = collector(metrics.clone(), &store)
            .run_cycle_at(&ids(4), now, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.processed, 4);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.no_data, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.samples_written, 2);
        assert_eq!(store.count(collections::SAMPLES), 2);

        let calls = metrics.calls.lock();
        let (_, from, to) = &calls[0];
        assert_eq!(*to, now);
        assert_eq!(*to - *from, chrono::Duration::minutes(15));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_fatal() {
        let metrics = Arc::new(ScriptedMetrics {
            unauthorized: vec!["e001".into()],
            ..Default::default()
        });
        let store = MemoryStore::new();

        let result = collector(metrics.clone(), &store)
            .run_cycle(&ids(5), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(TaskError::Fatal(_))));
        assert_eq!(metrics.calls.lock().len(), 2);
        assert_eq!(store.count(collections::SAMPLES), 1, "earlier samples still flushed");
    }

    #[tokio::test]
    async fn test_unreachable_store_is_fatal() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = collector(Arc::new(ScriptedMetrics::default()), &store)
            .run_cycle(&ids(2), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TaskError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_skips_remaining_entities() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = collector(Arc::new(ScriptedMetrics::default()), &store)
            .run_cycle(&ids(3), &cancel)
            .await
            .unwrap();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.skipped, 3);
    }

    #[tokio::test]
    async fn test_slow_provider_is_bounded_by_timeout() {
        struct Stuck;

        #[async_trait]
        impl MetricsProvider for Stuck {
            async fn get_metrics(
                &self,
                _: &EntityId,
                _: Granularity,
                _: DateTime<Utc>,
                _: DateTime<Utc>,
            ) -> Result<Option<MetricSeries>, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
        }

        let mut config = CollectorConfig::hot();
        config.call_timeout = Duration::from_millis(20);
        let collector = TieredCollector::new(
            config,
            Arc::new(TierBoard::new()),
            Arc::new(Stuck),
            Arc::new(MemoryStore::new()),
            Arc::new(Pacer::unlimited()),
        );

        let stats = collector
            .run_cycle(&ids(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.failed, 2);
    }
}
