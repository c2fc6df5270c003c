//! Upstream providers and the mapping from their payloads to stored records.
//!
//! Providers return raw, loosely-shaped payloads. Everything that enters the
//! store passes through [`samples_from_series`] or [`PlacementResult::entity`],
//! which is the single place where sparsity and identifier validity are
//! enforced.

pub mod http;

pub use http::{HttpListingProvider, HttpMetricsProvider, HttpProviderConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::ProviderError;
use crate::records::{MetricField, MetricSample, MetricValues};
use crate::types::{EntityId, Granularity};

/// One `(timestamp, value)` point of a metric series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    /// Upstream sends `null` for buckets without data
    pub value: Option<f64>,
}

/// Metric name to points, as returned by the metrics endpoint.
pub type MetricSeries = HashMap<String, Vec<MetricPoint>>;

/// Source of activity metrics.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Returns the buckets for `entity_id` in `[from, to)`.
    ///
    /// `Ok(None)` and an empty map both mean "no data".
    async fn get_metrics(
        &self,
        entity_id: &EntityId,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<MetricSeries>, ProviderError>;
}

/// A panel of a surface, with the variant used to page it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelRef {
    pub panel_name: String,
    #[serde(default)]
    pub variant: Option<String>,
}

/// One entry of a placements page. Only the natural key is interpreted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementResult {
    #[serde(alias = "linkCode", alias = "code")]
    pub entity_id: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PlacementResult {
    /// Validated natural key of this result, if it is well-formed.
    pub fn entity(&self) -> Option<EntityId> {
        EntityId::parse(&self.entity_id).ok()
    }
}

/// One page of placements for a (surface, panel, region).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementPage {
    #[serde(default)]
    pub results: Vec<PlacementResult>,
    #[serde(default)]
    pub has_more: bool,
}

/// Source of ranked listings.
#[async_trait]
pub trait ListingProvider: Send + Sync {
    async fn list_panels(&self, surface: &str) -> Result<Vec<PanelRef>, ProviderError>;

    async fn list_placements(
        &self,
        surface: &str,
        panel: &str,
        variant: Option<&str>,
        region: &str,
        page_index: u32,
    ) -> Result<PlacementPage, ProviderError>;
}

/// Maps a provider series onto sparse per-timestamp samples.
///
/// Metrics sharing a timestamp collapse into one record. Unknown metric names
/// are ignored and buckets whose metrics are all null or zero are dropped.
/// The result is ordered by timestamp.
pub fn samples_from_series(entity_id: &EntityId, series: &MetricSeries) -> Vec<MetricSample> {
    let mut buckets: BTreeMap<DateTime<Utc>, MetricValues> = BTreeMap::new();

    for (name, points) in series {
        let Some(field) = MetricField::from_provider_name(name) else {
            debug!("Ignoring unknown metric '{}' for {}", name, entity_id);
            continue;
        };
        for point in points {
            let values = buckets.entry(point.timestamp).or_default();
            values.set(field, point.value.filter(|v| v.is_finite()));
        }
    }

    buckets
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(timestamp, values)| MetricSample {
            entity_id: entity_id.clone(),
            timestamp,
            values,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, min, 0).unwrap()
    }

    fn point(min: u32, value: Option<f64>) -> MetricPoint {
        MetricPoint {
            timestamp: at(min),
            value,
        }
    }

    #[test]
    fn test_metrics_collapse_per_timestamp_and_drop_empty_buckets() {
        let id = EntityId::parse("1234-5678-9012").unwrap();
        let mut series = MetricSeries::new();
        series.insert(
            "peakCCU".to_string(),
            vec![point(0, Some(10.0)), point(1, Some(0.0)), point(2, None)],
        );
        series.insert(
            "plays".to_string(),
            vec![point(0, Some(3.0)), point(1, None), point(2, Some(0.0))],
        );
        series.insert("somethingNew".to_string(), vec![point(3, Some(99.0))]);

        let samples = samples_from_series(&id, &series);

        assert_eq!(samples.len(), 1, "minutes 1-3 carry nothing storable");
        assert_eq!(samples[0].timestamp, at(0));
        assert_eq!(samples[0].values.peak_ccu, Some(10.0));
        assert_eq!(samples[0].values.plays, Some(3.0));
    }

    #[test]
    fn test_empty_series_yields_nothing() {
        let id = EntityId::parse("1234-5678-9012").unwrap();
        assert!(samples_from_series(&id, &MetricSeries::new()).is_empty());
    }

    #[test]
    fn test_placement_page_decoding() {
        let page: PlacementPage = serde_json::from_str(
            r#"{"results":[{"linkCode":"1111-2222-3333","title":"x"},{"code":"bad code"}],"hasMore":true}"#,
        )
        .unwrap();
        assert!(page.has_more);
        assert_eq!(page.results[0].entity().unwrap().as_str(), "1111-2222-3333");
        assert!(page.results[1].entity().is_none());
    }
}
