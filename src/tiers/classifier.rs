//! Activity-ranked tier classification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{TierBoard, TierSnapshot};
use crate::config::ClassifierConfig;
use crate::error::{StoreError, TaskError};
use crate::records::MetricField;
use crate::scheduler::{run_blocking, PeriodicTask, RunStats};
use crate::store::{collections, Aggregation, Filter, Store};
use crate::types::{format_ts, EntityId};

/// Partitions the catalog into Hot, Warm and Cold by trailing peak activity.
#[derive(Clone)]
pub struct TierClassifier {
    store: Arc<dyn Store>,
    board: Arc<TierBoard>,
    config: ClassifierConfig,
}

impl TierClassifier {
    pub fn new(store: Arc<dyn Store>, board: Arc<TierBoard>, config: ClassifierConfig) -> Self {
        Self {
            store,
            board,
            config,
        }
    }

    pub fn board(&self) -> &Arc<TierBoard> {
        &self.board
    }

    /// Classifies the catalog as of now and publishes the result.
    pub fn classify(&self) -> Result<TierSnapshot, TaskError> {
        self.classify_at(Utc::now())
    }

    /// Classifies the catalog as of `now` and publishes the result.
    ///
    /// A failing activity query degrades to an all-Cold partition. A catalog
    /// that cannot be read leaves the previous snapshot in place.
    pub fn classify_at(&self, now: DateTime<Utc>) -> Result<TierSnapshot, TaskError> {
        let catalog = self.load_catalog()?;

        let ranked = match self.rank_activity(now) {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(
                    "Activity query failed, classifying all {} entities as cold: {}",
                    catalog.len(),
                    e
                );
                Vec::new()
            }
        };

        let snapshot = partition(
            ranked,
            catalog,
            self.config.hot_size,
            self.config.warm_size,
            now,
        );

        info!(
            "Classified {} entities: {} hot, {} warm, {} cold",
            snapshot.len(),
            snapshot.hot.len(),
            snapshot.warm.len(),
            snapshot.cold.len()
        );

        self.board.publish(self.store.as_ref(), snapshot.clone())?;
        Ok(snapshot)
    }

    fn load_catalog(&self) -> Result<BTreeSet<EntityId>, StoreError> {
        let mut catalog = BTreeSet::new();
        for doc in self.store.scroll_all(collections::ENTITIES, &Filter::all())? {
            let doc = doc?;
            match EntityId::parse(&doc.id) {
                Ok(id) => {
                    catalog.insert(id);
                }
                Err(e) => warn!("Skipping catalog entry: {}", e),
            }
        }
        Ok(catalog)
    }

    /// Peak activity per entity over the trailing window.
    fn rank_activity(&self, now: DateTime<Utc>) -> Result<Vec<(EntityId, f64)>, StoreError> {
        let since = now - chrono::Duration::from_std(self.config.activity_window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let filter =
            Filter::all().range("timestamp", Some(format_ts(&since)), Some(format_ts(&now)));
        let aggregation =
            Aggregation::terms("entity_id", MetricField::PeakCcu.field_name());

        let buckets = self
            .store
            .aggregate(collections::SAMPLES, &filter, &aggregation)?
            .into_buckets();

        Ok(buckets
            .into_iter()
            .filter_map(|bucket| {
                let peak = bucket.max?;
                EntityId::parse(&bucket.key).ok().map(|id| (id, peak))
            })
            .collect())
    }
}

#[async_trait]
impl PeriodicTask for TierClassifier {
    fn name(&self) -> &str {
        "tier-classifier"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<RunStats, TaskError> {
        let classifier = self.clone();
        let snapshot = run_blocking(move || classifier.classify()).await?;
        Ok(RunStats {
            processed: snapshot.len(),
            succeeded: snapshot.len(),
            note: Some(format!(
                "hot={} warm={} cold={}",
                snapshot.hot.len(),
                snapshot.warm.len(),
                snapshot.cold.len()
            )),
            ..Default::default()
        })
    }
}

/// Splits `catalog` into tiers from an activity ranking.
///
/// Ranking is by peak descending, ties broken by entity id ascending. The top
/// `hot_size` ranked entities are Hot, the next `warm_size` are Warm, and every
/// other catalog entity (ranked or not) is Cold. Ranked entities outside the
/// catalog are ignored, so the three tiers always partition the catalog.
pub fn partition(
    mut ranked: Vec<(EntityId, f64)>,
    catalog: BTreeSet<EntityId>,
    hot_size: usize,
    warm_size: usize,
    classified_at: DateTime<Utc>,
) -> TierSnapshot {
    ranked.retain(|(id, peak)| {
        let known = catalog.contains(id);
        if !known {
            debug!("Ignoring activity for unknown entity {}", id);
        }
        known && peak.is_finite()
    });
    ranked.sort_by(|(a_id, a_peak), (b_id, b_peak)| {
        b_peak.total_cmp(a_peak).then_with(|| a_id.cmp(b_id))
    });

    let mut ranked = ranked.into_iter().map(|(id, _)| id);
    let hot: Vec<EntityId> = ranked.by_ref().take(hot_size).collect();
    let warm: Vec<EntityId> = ranked.by_ref().take(warm_size).collect();

    let promoted: BTreeSet<&EntityId> = hot.iter().chain(warm.iter()).collect();
    let cold: Vec<EntityId> = catalog
        .iter()
        .filter(|id| !promoted.contains(id))
        .cloned()
        .collect();

    TierSnapshot {
        hot,
        warm,
        cold,
        classified_at: Some(classified_at),
    }
}
