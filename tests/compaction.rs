//! Compaction against dense sample grids.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tracker::records::{DailyAggregate, MetricSample, MetricValues};
use tracker::store::{collections, put_record, Document};
use tracker::{
    CompactionPolicy, Compactor, EntityId, MemoryStore, PeriodicTask, Store, Threshold,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 3, 0, 0, 0).unwrap()
}

fn entity() -> EntityId {
    EntityId::parse("1234-5678-9012").unwrap()
}

fn sample(timestamp: DateTime<Utc>, values: MetricValues) -> MetricSample {
    MetricSample {
        entity_id: entity(),
        timestamp,
        values,
    }
}

/// One sample per minute for `minutes` minutes before `now()`.
fn seed_dense(store: &MemoryStore, minutes: i64) {
    let docs: Vec<Document> = (1..=minutes)
        .map(|k| {
            let s = sample(
                now() - Duration::minutes(k),
                MetricValues {
                    peak_ccu: Some(k as f64),
                    ..Default::default()
                },
            );
            Document::from_record(s.doc_id(), &s).unwrap()
        })
        .collect();
    store.bulk_upsert(collections::SAMPLES, &docs).unwrap();
}

fn remaining(store: &MemoryStore) -> Vec<MetricSample> {
    store
        .documents(collections::SAMPLES)
        .iter()
        .map(|d| d.decode().unwrap())
        .collect()
}

fn band_only_policy() -> CompactionPolicy {
    CompactionPolicy {
        thresholds: vec![],
        daily_rollup_after: None,
    }
}

#[test]
fn test_thirty_minute_grid_over_48_hours() {
    let store = MemoryStore::new();
    seed_dense(&store, 48 * 60);
    let compactor = Compactor::new(Arc::new(store.clone()), band_only_policy()).unwrap();

    let thresholds = [
        Threshold::new(std::time::Duration::from_secs(24 * 3600), 1),
        Threshold::new(std::time::Duration::from_secs(48 * 3600), 30),
    ];
    let report = compactor
        .compact_at(&thresholds, now(), &CancellationToken::new())
        .unwrap();

    let older = &report.bands[1];
    assert_eq!(older.scanned, 24 * 60);
    assert_eq!(older.kept, 2 * 24, "two samples per hour in the band");
    assert_eq!(older.deleted, 24 * 60 - 48);

    let samples = remaining(&store);
    assert_eq!(samples.len(), 24 * 60 + 48, "the recent band is untouched");

    let cutoff = now() - Duration::hours(24);
    for s in samples.iter().filter(|s| s.timestamp < cutoff) {
        assert!(s.timestamp.minute() == 0 || s.timestamp.minute() == 30);
    }
}

#[test]
fn test_twelve_hour_grid_keeps_midnight_and_noon() {
    let store = MemoryStore::new();
    seed_dense(&store, 48 * 60);
    let compactor = Compactor::new(Arc::new(store.clone()), band_only_policy()).unwrap();

    let thresholds = [Threshold::new(std::time::Duration::from_secs(48 * 3600), 720)];
    compactor
        .compact_at(&thresholds, now(), &CancellationToken::new())
        .unwrap();

    let mut kept: Vec<(u32, u32)> = remaining(&store)
        .iter()
        .map(|s| (s.timestamp.hour(), s.timestamp.minute()))
        .collect();
    kept.sort();
    kept.dedup();
    assert_eq!(kept, vec![(0, 0), (12, 0)]);
    assert_eq!(remaining(&store).len(), 4);
}

#[test]
fn test_compaction_is_idempotent() {
    let store = MemoryStore::new();
    seed_dense(&store, 6 * 60);
    let compactor = Compactor::new(Arc::new(store.clone()), band_only_policy()).unwrap();
    let thresholds = [Threshold::new(std::time::Duration::from_secs(6 * 3600), 60)];

    compactor
        .compact_at(&thresholds, now(), &CancellationToken::new())
        .unwrap();
    let second = compactor
        .compact_at(&thresholds, now(), &CancellationToken::new())
        .unwrap();
    assert_eq!(second.bands[0].deleted, 0);
    assert_eq!(remaining(&store).len(), 6);
}

#[test]
fn test_invalid_thresholds_are_rejected() {
    let store = MemoryStore::new();
    let compactor = Compactor::new(Arc::new(store), band_only_policy()).unwrap();
    let thresholds = [Threshold::days(7, 60), Threshold::days(1, 30)];
    assert!(compactor.compact(&thresholds).is_err());

    let bad_policy = CompactionPolicy {
        thresholds: vec![Threshold::days(1, 7)],
        daily_rollup_after: None,
    };
    assert!(Compactor::new(Arc::new(MemoryStore::new()), bad_policy).is_err());
}

#[test]
fn test_daily_rollup_folds_and_merges_with_reducers() {
    let store = MemoryStore::new();
    let day = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
    let peaks = [5.0, 9.0, 3.0];
    for hour in 0..24 {
        let s = sample(
            day + Duration::hours(hour),
            MetricValues {
                plays: Some(1.0),
                peak_ccu: Some(peaks[hour as usize % 3]),
                minutes_played: Some(30.0),
                unique_players: Some(3.0),
                ..Default::default()
            },
        );
        put_record(&store, collections::SAMPLES, &s.doc_id(), &s).unwrap();
    }
    // Recent sample stays raw.
    let recent = sample(
        now() - Duration::hours(2),
        MetricValues {
            plays: Some(4.0),
            ..Default::default()
        },
    );
    put_record(&store, collections::SAMPLES, &recent.doc_id(), &recent).unwrap();

    let compactor = Compactor::new(Arc::new(store.clone()), CompactionPolicy::default()).unwrap();
    let report = compactor
        .run_policy_at(now(), &CancellationToken::new())
        .unwrap();

    assert_eq!(report.rolled_up, 24);
    assert_eq!(report.daily_documents, 1);
    assert_eq!(report.merged, 1);
    assert_eq!(remaining(&store).len(), 1);

    let daily: DailyAggregate = store.documents(collections::DAILY)[0].decode().unwrap();
    assert!(daily.readings.is_empty());
    assert_eq!(daily.merged_count, 24);
    assert_eq!(daily.merged_field_counts.get("plays"), Some(&24));
    assert_eq!(daily.merged_field_counts.get("retention_d1"), None);
    let merged = daily.merged.unwrap();
    assert_eq!(merged.plays, Some(24.0), "sums add up");
    assert_eq!(merged.peak_ccu, Some(9.0), "peaks take the max");
    assert_eq!(merged.minutes_played, Some(720.0));
    assert_eq!(merged.unique_players, Some(72.0));
    assert_eq!(merged.avg_minutes_per_player, Some(10.0), "ratio from merged totals");
}

#[test]
fn test_unreachable_store_is_fatal() {
    let store = MemoryStore::new();
    store.set_unavailable(true);
    let compactor = Compactor::new(Arc::new(store), CompactionPolicy::default()).unwrap();
    let result = compactor.run_policy_at(now(), &CancellationToken::new());
    assert!(matches!(result, Err(tracker::TaskError::Fatal(_))));
}

#[tokio::test(flavor = "current_thread")]
async fn test_scheduled_run_sweeps_off_the_runtime_thread() {
    let store = MemoryStore::new();
    let noon = (Utc::now() - Duration::days(3))
        .date_naive()
        .and_hms_opt(12, 0, 0)
        .unwrap()
        .and_utc();
    for minute in 0..60 {
        let s = sample(noon + Duration::minutes(minute), MetricValues::default());
        put_record(&store, collections::SAMPLES, &s.doc_id(), &s).unwrap();
    }

    let compactor = Compactor::new(Arc::new(store.clone()), CompactionPolicy::default()).unwrap();
    let stats = compactor.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(stats.processed, 60);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(remaining(&store).len(), 2, ":00 and :30 survive the 30-minute band");
}
