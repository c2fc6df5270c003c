//! Collector cycles driven through the tier board, including Cold rotation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tracker::collector::{CheckpointStore, FileCheckpointStore, RotationCursor};
use tracker::provider::{MetricPoint, MetricSeries, MetricsProvider};
use tracker::records::MetricSample;
use tracker::store::collections;
use tracker::tiers::TierSnapshot;
use tracker::{
    CheckpointError, CollectorConfig, EntityId, Granularity, MemoryStore, Pacer, PopulationSource,
    ProviderError, TaskError, TierBoard, TieredCollector,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 1, 18, 0, 0).unwrap()
}

fn population(n: usize) -> Vec<EntityId> {
    (0..n)
        .map(|i| EntityId::parse(&format!("map_{:03}", i)).unwrap())
        .collect()
}

/// Records every request; answers with two buckets, one of them empty.
#[derive(Default)]
struct RecordingMetrics {
    calls: Mutex<Vec<EntityId>>,
}

impl RecordingMetrics {
    fn call_counts(&self) -> HashMap<EntityId, usize> {
        let mut counts = HashMap::new();
        for id in self.calls.lock().iter() {
            *counts.entry(id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl MetricsProvider for RecordingMetrics {
    async fn get_metrics(
        &self,
        entity_id: &EntityId,
        _granularity: Granularity,
        from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Option<MetricSeries>, ProviderError> {
        self.calls.lock().push(entity_id.clone());
        let mut series = MetricSeries::new();
        series.insert(
            "peakCCU".to_string(),
            vec![
                MetricPoint {
                    timestamp: from,
                    value: Some(12.0),
                },
                MetricPoint {
                    timestamp: from + Duration::hours(1),
                    value: Some(0.0),
                },
            ],
        );
        series.insert(
            "plays".to_string(),
            vec![MetricPoint {
                timestamp: from + Duration::hours(1),
                value: None,
            }],
        );
        Ok(Some(series))
    }
}

fn cold_config(slice_size: usize) -> CollectorConfig {
    CollectorConfig {
        population: PopulationSource::Rotation {
            slice_size: Some(slice_size),
        },
        ..CollectorConfig::cold()
    }
}

fn board_with_cold(members: Vec<EntityId>) -> Arc<TierBoard> {
    let board = Arc::new(TierBoard::new());
    board.replace(TierSnapshot {
        cold: members,
        ..Default::default()
    });
    board
}

#[tokio::test]
async fn test_rotation_covers_population_exactly_once() {
    let members = population(23);
    let metrics = Arc::new(RecordingMetrics::default());
    let store = MemoryStore::new();
    let temp_dir = tempfile::tempdir().unwrap();
    let checkpoint = Arc::new(FileCheckpointStore::open(temp_dir.path().join("cold.json")).unwrap());

    let collector = TieredCollector::new(
        cold_config(5),
        board_with_cold(members.clone()),
        metrics.clone(),
        Arc::new(store.clone()),
        Arc::new(Pacer::unlimited()),
    )
    .with_checkpoint(checkpoint.clone());

    let cancel = CancellationToken::new();
    for _ in 0..23usize.div_ceil(5) {
        collector.run_tier_at(now(), &cancel).await.unwrap();
    }

    let counts = metrics.call_counts();
    assert_eq!(counts.len(), 23);
    assert!(counts.values().all(|&c| c == 1), "each entity in exactly one slice");

    let cursor = checkpoint.load().unwrap().unwrap();
    assert_eq!(cursor.cycles_completed, 1);
    assert_eq!(cursor.cursor_index, 0);
    assert_eq!(cursor.total_population_size, 23);
    assert_eq!(cursor.last_run_at, Some(now()));
}

#[tokio::test]
async fn test_rotation_resumes_after_restart() {
    let members = population(10);
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("cold.json");
    let store = MemoryStore::new();

    let first = Arc::new(RecordingMetrics::default());
    TieredCollector::new(
        cold_config(4),
        board_with_cold(members.clone()),
        first.clone(),
        Arc::new(store.clone()),
        Arc::new(Pacer::unlimited()),
    )
    .with_checkpoint(Arc::new(FileCheckpointStore::open(&path).unwrap()))
    .run_tier_at(now(), &CancellationToken::new())
    .await
    .unwrap();

    // A fresh process picks up where the last one stopped.
    let second = Arc::new(RecordingMetrics::default());
    TieredCollector::new(
        cold_config(4),
        board_with_cold(members.clone()),
        second.clone(),
        Arc::new(store),
        Arc::new(Pacer::unlimited()),
    )
    .with_checkpoint(Arc::new(FileCheckpointStore::open(&path).unwrap()))
    .run_tier_at(now(), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(*first.calls.lock(), members[0..4].to_vec());
    assert_eq!(*second.calls.lock(), members[4..8].to_vec());
}

struct BrokenCheckpoint;

impl CheckpointStore for BrokenCheckpoint {
    fn load(&self) -> Result<Option<RotationCursor>, CheckpointError> {
        Ok(None)
    }

    fn save(&self, _cursor: &RotationCursor) -> Result<(), String> {
        Err("disk full".to_string())
    }
}

#[tokio::test]
async fn test_checkpoint_failure_does_not_stop_the_cycle() {
    let metrics = Arc::new(RecordingMetrics::default());
    let store = MemoryStore::new();
    let collector = TieredCollector::new(
        cold_config(3),
        board_with_cold(population(6)),
        metrics.clone(),
        Arc::new(store.clone()),
        Arc::new(Pacer::unlimited()),
    )
    .with_checkpoint(Arc::new(BrokenCheckpoint));

    let stats = collector
        .run_tier_at(now(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.succeeded, 3);
    assert_eq!(store.count(collections::SAMPLES), 3);
}

/// File checkpoint whose next load can be made to fail once.
struct FlakyCheckpoint {
    inner: FileCheckpointStore,
    fail_next_load: AtomicBool,
}

impl CheckpointStore for FlakyCheckpoint {
    fn load(&self) -> Result<Option<RotationCursor>, CheckpointError> {
        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(CheckpointError::Unreadable("database is locked".to_string()));
        }
        self.inner.load()
    }

    fn save(&self, cursor: &RotationCursor) -> Result<(), String> {
        self.inner.save(cursor)
    }
}

#[tokio::test]
async fn test_unreadable_checkpoint_skips_cycle_and_keeps_progress() {
    let members = population(20);
    let metrics = Arc::new(RecordingMetrics::default());
    let temp_dir = tempfile::tempdir().unwrap();
    let checkpoint = Arc::new(FlakyCheckpoint {
        inner: FileCheckpointStore::open(temp_dir.path().join("cold.json")).unwrap(),
        fail_next_load: AtomicBool::new(false),
    });
    let collector = TieredCollector::new(
        cold_config(4),
        board_with_cold(members.clone()),
        metrics.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(Pacer::unlimited()),
    )
    .with_checkpoint(checkpoint.clone());

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        collector.run_tier_at(now(), &cancel).await.unwrap();
    }
    assert_eq!(checkpoint.load().unwrap().unwrap().cursor_index, 12);

    checkpoint.fail_next_load.store(true, Ordering::SeqCst);
    let result = collector.run_tier_at(now(), &cancel).await;
    assert!(matches!(result, Err(TaskError::Failed(_))));
    assert_eq!(metrics.calls.lock().len(), 12, "no requests without a cursor");
    assert_eq!(checkpoint.load().unwrap().unwrap().cursor_index, 12);

    collector.run_tier_at(now(), &cancel).await.unwrap();
    assert_eq!(checkpoint.load().unwrap().unwrap().cursor_index, 16);

    let counts = metrics.call_counts();
    assert_eq!(counts[&members[0]], 1);
    assert_eq!(counts[&members[12]], 1);
    assert_eq!(metrics.calls.lock()[12..].to_vec(), members[12..16].to_vec());
}

#[tokio::test]
async fn test_cancelled_rotation_does_not_advance() {
    let store = MemoryStore::new();
    let collector = TieredCollector::new(
        cold_config(3),
        board_with_cold(population(6)),
        Arc::new(RecordingMetrics::default()),
        Arc::new(store.clone()),
        Arc::new(Pacer::unlimited()),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = collector.run_tier_at(now(), &cancel).await.unwrap();
    assert_eq!(stats.skipped, 3);
    assert_eq!(store.count(collections::CONTROL), 0, "no checkpoint written");
}

#[tokio::test]
async fn test_only_non_empty_buckets_are_stored() {
    let members = population(4);
    let board = Arc::new(TierBoard::new());
    board.replace(TierSnapshot {
        hot: members.clone(),
        ..Default::default()
    });
    let store = MemoryStore::new();

    let stats = TieredCollector::new(
        CollectorConfig::hot(),
        board,
        Arc::new(RecordingMetrics::default()),
        Arc::new(store.clone()),
        Arc::new(Pacer::unlimited()),
    )
    .run_tier_at(now(), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(stats.samples_written, 4);
    for doc in store.documents(collections::SAMPLES) {
        let sample: MetricSample = doc.decode().unwrap();
        assert!(!sample.values.is_empty());
        assert_eq!(doc.id, sample.doc_id());
    }
}
