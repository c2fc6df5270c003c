//! Per-entity summary read model.
//!
//! A summary is recomputed from ground truth (samples and listing events)
//! with a handful of small queries. Each query fills one or two fields; a
//! query that fails leaves its fields at their previously stored values so a
//! single bad query never blanks out a summary.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, TaskError};
use crate::records::{EntitySummary, EventType, ListingPresence, MetricField};
use crate::scheduler::{run_blocking, PeriodicTask, RunStats};
use crate::store::{collections, get_record, put_record, Aggregation, Filter, Store};
use crate::types::{format_ts, EntityId};

/// Counts for one recompute pass over the catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryStats {
    pub entities: usize,
    pub written: usize,
    /// Summaries written with at least one field left at its previous value
    pub partial: usize,
    pub failed: usize,
}

impl From<SummaryStats> for RunStats {
    fn from(stats: SummaryStats) -> Self {
        RunStats {
            processed: stats.entities,
            succeeded: stats.written,
            no_data: 0,
            failed: stats.failed,
            note: Some(format!("partial={}", stats.partial)),
        }
    }
}

/// Recomputes [`EntitySummary`] documents.
#[derive(Clone)]
pub struct SummaryCalculator {
    store: Arc<dyn Store>,
}

impl SummaryCalculator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn recompute(&self, entity_id: &EntityId) -> Result<EntitySummary, StoreError> {
        self.recompute_at(entity_id, Utc::now()).map(|(summary, _)| summary)
    }

    /// Recomputes and stores one summary as of `now`.
    ///
    /// Returns the summary and the number of sub-queries that failed.
    pub fn recompute_at(
        &self,
        entity_id: &EntityId,
        now: DateTime<Utc>,
    ) -> Result<(EntitySummary, usize), StoreError> {
        let store = self.store.as_ref();
        let id = entity_id.as_str();

        let mut summary = match get_record::<EntitySummary>(store, collections::SUMMARIES, id) {
            Ok(previous) => previous.unwrap_or_default(),
            Err(e) => {
                warn!("Previous summary of {} unreadable, starting fresh: {}", id, e);
                EntitySummary::default()
            }
        };
        let mut failures = 0;
        let mut keep_previous = |field: &str, e: StoreError| {
            warn!("Summary query '{}' for {} failed, keeping previous value: {}", field, id, e);
            failures += 1;
        };

        let activity = MetricField::PeakCcu.field_name();
        let samples = Filter::all().eq("entity_id", id);
        let since = |window: Duration| {
            samples
                .clone()
                .range("timestamp", Some(format_ts(&(now - window))), None::<String>)
        };

        match store.aggregate(
            collections::SAMPLES,
            &samples,
            &Aggregation::latest("timestamp", activity),
        ) {
            Ok(v) => summary.current_value = v.as_number(),
            Err(e) => keep_previous("current", e),
        }
        match store.aggregate(
            collections::SAMPLES,
            &since(Duration::hours(24)),
            &Aggregation::max(activity),
        ) {
            Ok(v) => summary.peak_24h = v.as_number(),
            Err(e) => keep_previous("peak_24h", e),
        }
        for (window, slot) in [
            (Duration::hours(24), &mut summary.avg_24h),
            (Duration::days(7), &mut summary.avg_7d),
            (Duration::days(30), &mut summary.avg_30d),
        ] {
            match store.aggregate(collections::SAMPLES, &since(window), &Aggregation::avg(activity)) {
                Ok(v) => *slot = v.as_number(),
                Err(e) => keep_previous("average", e),
            }
        }

        match get_record::<ListingPresence>(store, collections::LISTING_PRESENCE, id) {
            Ok(presence) => summary.in_listing = presence.map_or(false, |p| p.in_listing),
            Err(e) => keep_previous("in_listing", e),
        }

        let events = Filter::all().eq("entity_id", id);
        let added_7d = events
            .clone()
            .eq("type", EventType::Added.as_str())
            .range("timestamp", Some(format_ts(&(now - Duration::days(7)))), None::<String>);
        match store.aggregate(collections::LISTING_EVENTS, &added_7d, &Aggregation::Count) {
            Ok(v) => summary.listing_appearances_7d = Some(v.as_count()),
            Err(e) => keep_previous("listing_appearances_7d", e),
        }
        match store.aggregate(
            collections::LISTING_EVENTS,
            &events,
            &Aggregation::min("position"),
        ) {
            Ok(v) => summary.best_position = v.as_number().map(|p| p as u32),
            Err(e) => keep_previous("best_position", e),
        }
        match store.aggregate(
            collections::LISTING_EVENTS,
            &events,
            &Aggregation::earliest("timestamp", "timestamp"),
        ) {
            Ok(v) => summary.first_seen = v.into_hit().as_ref().and_then(parse_ts),
            Err(e) => keep_previous("first_seen", e),
        }
        match store.aggregate(
            collections::LISTING_EVENTS,
            &events,
            &Aggregation::latest("timestamp", "timestamp"),
        ) {
            Ok(v) => summary.last_seen = v.into_hit().as_ref().and_then(parse_ts),
            Err(e) => keep_previous("last_seen", e),
        }

        summary.last_calculated = Some(now);
        put_record(store, collections::SUMMARIES, id, &summary)?;
        Ok((summary, failures))
    }

    /// Recomputes every catalog entity as of `now`.
    pub fn recompute_all_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SummaryStats, TaskError> {
        let mut stats = SummaryStats::default();

        for doc in self.store.scroll_all(collections::ENTITIES, &Filter::all())? {
            if cancel.is_cancelled() {
                break;
            }
            let doc = doc?;
            let Ok(entity_id) = EntityId::parse(&doc.id) else {
                debug!("Skipping catalog entry '{}'", doc.id);
                continue;
            };
            stats.entities += 1;

            match self.recompute_at(&entity_id, now) {
                Ok((_, 0)) => stats.written += 1,
                Ok(_) => {
                    stats.written += 1;
                    stats.partial += 1;
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("Summary of {} not written: {}", entity_id, e);
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }
}

fn parse_ts(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[async_trait]
impl PeriodicTask for SummaryCalculator {
    fn name(&self) -> &str {
        "summary-calculator"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<RunStats, TaskError> {
        let calculator = self.clone();
        let cancel = cancel.clone();
        run_blocking(move || calculator.recompute_all_at(Utc::now(), &cancel))
            .await
            .map(RunStats::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ListingEvent, MetricSample, MetricValues};
    use crate::store::{Document, MemoryStore};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 20, 12, 0, 0).unwrap()
    }

    fn seed(store: &MemoryStore, entity: &EntityId) {
        for (hours_ago, peak) in [(1, 40.0), (5, 90.0), (48, 200.0)] {
            let sample = MetricSample {
                entity_id: entity.clone(),
                timestamp: now() - Duration::hours(hours_ago),
                values: MetricValues {
                    peak_ccu: Some(peak),
                    ..Default::default()
                },
            };
            put_record(store, collections::SAMPLES, &sample.doc_id(), &sample).unwrap();
        }
        for (i, (event_type, days_ago, position)) in [
            (EventType::Added, 10, Some(4)),
            (EventType::Removed, 9, None),
            (EventType::Added, 2, Some(2)),
        ]
        .into_iter()
        .enumerate()
        {
            let event = ListingEvent {
                event_type,
                surface: "browse".into(),
                panel: "featured".into(),
                entity_id: entity.clone(),
                region: "EU".into(),
                position,
                previous_position: None,
                timestamp: now() - Duration::days(days_ago),
            };
            let doc = Document::from_record(format!("ev{}", i), &event).unwrap();
            store.bulk_upsert(collections::LISTING_EVENTS, &[doc]).unwrap();
        }
    }

    #[test]
    fn test_full_recompute() {
        let store = MemoryStore::new();
        let entity = EntityId::parse("1234-5678-9012").unwrap();
        seed(&store, &entity);

        let calculator = SummaryCalculator::new(Arc::new(store.clone()));
        let (summary, failures) = calculator.recompute_at(&entity, now()).unwrap();

        assert_eq!(failures, 0);
        assert_eq!(summary.current_value, Some(40.0));
        assert_eq!(summary.peak_24h, Some(90.0));
        assert_eq!(summary.avg_24h, Some(65.0));
        assert_eq!(summary.avg_7d, Some(110.0));
        assert!(!summary.in_listing);
        assert_eq!(summary.listing_appearances_7d, Some(1));
        assert_eq!(summary.best_position, Some(2));
        assert_eq!(summary.first_seen, Some(now() - Duration::days(10)));
        assert_eq!(summary.last_seen, Some(now() - Duration::days(2)));
        assert_eq!(summary.last_calculated, Some(now()));
        assert_eq!(store.count(collections::SUMMARIES), 1);
    }

    #[test]
    fn test_failed_peak_query_keeps_previous_peak() {
        let store = MemoryStore::new();
        let entity = EntityId::parse("1234-5678-9012").unwrap();
        seed(&store, &entity);

        let previous = EntitySummary {
            current_value: Some(1.0),
            peak_24h: Some(777.0),
            ..Default::default()
        };
        put_record(&store, collections::SUMMARIES, entity.as_str(), &previous).unwrap();
        store.fail_aggregation(Aggregation::max(MetricField::PeakCcu.field_name()));

        let calculator = SummaryCalculator::new(Arc::new(store.clone()));
        let (summary, failures) = calculator.recompute_at(&entity, now()).unwrap();

        assert_eq!(failures, 1);
        assert_eq!(summary.current_value, Some(40.0), "current still updated");
        assert_eq!(summary.peak_24h, Some(777.0), "peak left at its prior value");
    }

    #[test]
    fn test_recompute_all_walks_the_catalog() {
        let store = MemoryStore::new();
        for code in ["1111-1111-1111", "2222-2222-2222"] {
            store
                .upsert(collections::ENTITIES, code, &serde_json::json!({}))
                .unwrap();
        }

        let calculator = SummaryCalculator::new(Arc::new(store.clone()));
        let stats = calculator
            .recompute_all_at(now(), &CancellationToken::new())
            .unwrap();
        assert_eq!(stats.entities, 2);
        assert_eq!(stats.written, 2);
        assert_eq!(store.count(collections::SUMMARIES), 2);
    }

    #[test]
    fn test_unreachable_store_is_fatal() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let calculator = SummaryCalculator::new(Arc::new(store));
        let result = calculator.recompute_all_at(now(), &CancellationToken::new());
        assert!(matches!(result, Err(TaskError::Fatal(_))));
    }
}
