//! Typed records persisted by the tracker.
//!
//! Metric samples and listing events are ground truth (write-once / append-only).
//! Tier assignments, summaries and daily aggregates are derived and can be
//! rebuilt from them at any time.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{format_ts, ts_secs, EntityId, Tier};

// ================================================================================================
// METRICS
// ================================================================================================

/// How a metric combines when several readings fold into one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// Counts and totals: readings add up
    Sum,
    /// Peak-type values: the largest reading wins
    Max,
    /// Derived ratio, recomputed from two summed metrics
    Ratio {
        numerator: MetricField,
        denominator: MetricField,
    },
    /// Averages with no underlying totals: mean of the readings
    Average,
}

/// Every metric a sample can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    PeakCcu,
    Plays,
    UniquePlayers,
    MinutesPlayed,
    Favorites,
    Recommendations,
    AvgMinutesPerPlayer,
    RetentionD1,
    RetentionD7,
}

impl MetricField {
    pub fn all() -> [MetricField; 9] {
        [
            MetricField::PeakCcu,
            MetricField::Plays,
            MetricField::UniquePlayers,
            MetricField::MinutesPlayed,
            MetricField::Favorites,
            MetricField::Recommendations,
            MetricField::AvgMinutesPerPlayer,
            MetricField::RetentionD1,
            MetricField::RetentionD7,
        ]
    }

    /// Reducer for this metric, fixed by what the number means.
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricField::PeakCcu => MetricKind::Max,
            MetricField::Plays
            | MetricField::UniquePlayers
            | MetricField::MinutesPlayed
            | MetricField::Favorites
            | MetricField::Recommendations => MetricKind::Sum,
            MetricField::AvgMinutesPerPlayer => MetricKind::Ratio {
                numerator: MetricField::MinutesPlayed,
                denominator: MetricField::UniquePlayers,
            },
            MetricField::RetentionD1 | MetricField::RetentionD7 => MetricKind::Average,
        }
    }

    /// Document field name.
    pub fn field_name(&self) -> &'static str {
        match self {
            MetricField::PeakCcu => "peak_ccu",
            MetricField::Plays => "plays",
            MetricField::UniquePlayers => "unique_players",
            MetricField::MinutesPlayed => "minutes_played",
            MetricField::Favorites => "favorites",
            MetricField::Recommendations => "recommendations",
            MetricField::AvgMinutesPerPlayer => "avg_minutes_per_player",
            MetricField::RetentionD1 => "retention_d1",
            MetricField::RetentionD7 => "retention_d7",
        }
    }

    /// Maps an upstream metric name onto a field. Unknown names yield `None`.
    pub fn from_provider_name(name: &str) -> Option<Self> {
        match name {
            "peakCCU" | "peak_ccu" => Some(MetricField::PeakCcu),
            "plays" => Some(MetricField::Plays),
            "uniquePlayers" | "unique_players" => Some(MetricField::UniquePlayers),
            "minutesPlayed" | "minutes_played" => Some(MetricField::MinutesPlayed),
            "favorites" => Some(MetricField::Favorites),
            "recommendations" => Some(MetricField::Recommendations),
            "averageMinutesPerPlayer" | "avg_minutes_per_player" => {
                Some(MetricField::AvgMinutesPerPlayer)
            }
            "retentionD1" | "retention_d1" => Some(MetricField::RetentionD1),
            "retentionD7" | "retention_d7" => Some(MetricField::RetentionD7),
            _ => None,
        }
    }
}

/// Named optional metrics for one bucket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_ccu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plays: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_players: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_played: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorites: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_minutes_per_player: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_d1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_d7: Option<f64>,
}

impl MetricValues {
    pub fn get(&self, field: MetricField) -> Option<f64> {
        match field {
            MetricField::PeakCcu => self.peak_ccu,
            MetricField::Plays => self.plays,
            MetricField::UniquePlayers => self.unique_players,
            MetricField::MinutesPlayed => self.minutes_played,
            MetricField::Favorites => self.favorites,
            MetricField::Recommendations => self.recommendations,
            MetricField::AvgMinutesPerPlayer => self.avg_minutes_per_player,
            MetricField::RetentionD1 => self.retention_d1,
            MetricField::RetentionD7 => self.retention_d7,
        }
    }

    pub fn set(&mut self, field: MetricField, value: Option<f64>) {
        let slot = match field {
            MetricField::PeakCcu => &mut self.peak_ccu,
            MetricField::Plays => &mut self.plays,
            MetricField::UniquePlayers => &mut self.unique_players,
            MetricField::MinutesPlayed => &mut self.minutes_played,
            MetricField::Favorites => &mut self.favorites,
            MetricField::Recommendations => &mut self.recommendations,
            MetricField::AvgMinutesPerPlayer => &mut self.avg_minutes_per_player,
            MetricField::RetentionD1 => &mut self.retention_d1,
            MetricField::RetentionD7 => &mut self.retention_d7,
        };
        *slot = value;
    }

    /// True when every metric is null or zero. Such buckets are never stored.
    pub fn is_empty(&self) -> bool {
        MetricField::all()
            .iter()
            .all(|f| self.get(*f).map_or(true, |v| v == 0.0 || !v.is_finite()))
    }
}

/// One stored bucket of metrics for an entity, keyed by `(entity, timestamp)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub entity_id: EntityId,
    #[serde(with = "ts_secs")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: MetricValues,
}

impl MetricSample {
    /// Upsert identity. Re-collecting the same bucket overwrites it.
    pub fn doc_id(&self) -> String {
        sample_id(&self.entity_id, &self.timestamp)
    }
}

pub fn sample_id(entity_id: &EntityId, timestamp: &DateTime<Utc>) -> String {
    format!("{}@{}", entity_id, format_ts(timestamp))
}

/// One sub-reading folded into a daily aggregate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyReading {
    #[serde(with = "ts_secs")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: MetricValues,
}

/// Compound per-day document: many readings of one entity on one UTC day.
///
/// Compaction reduces `readings` into `merged` and clears them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub entity_id: EntityId,
    pub day: NaiveDate,
    #[serde(default)]
    pub readings: Vec<DailyReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<MetricValues>,
    /// How many readings have been reduced into `merged`
    #[serde(default)]
    pub merged_count: u32,
    /// Readings behind each merged metric, by field name. Metrics are often
    /// absent from a reading, so this is at most `merged_count`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub merged_field_counts: BTreeMap<String, u32>,
}

impl DailyAggregate {
    pub fn new(entity_id: EntityId, day: NaiveDate) -> Self {
        Self {
            entity_id,
            day,
            readings: Vec::new(),
            merged: None,
            merged_count: 0,
            merged_field_counts: BTreeMap::new(),
        }
    }

    pub fn doc_id(&self) -> String {
        daily_id(&self.entity_id, self.day)
    }
}

pub fn daily_id(entity_id: &EntityId, day: NaiveDate) -> String {
    format!("{}@{}", entity_id, day.format("%Y-%m-%d"))
}

// ================================================================================================
// LISTINGS
// ================================================================================================

/// Identity of a placement: an entity in one region of one panel of one surface.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlacementKey {
    pub surface: String,
    pub panel: String,
    pub entity_id: EntityId,
    pub region: String,
}

impl PlacementKey {
    pub fn doc_id(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.surface, self.panel, self.entity_id, self.region
        )
    }
}

/// Position of an entity within a ranked (surface, panel, region) listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPlacement {
    pub surface: String,
    pub panel: String,
    pub entity_id: EntityId,
    pub region: String,
    /// 0-based rank within the region's list
    pub position: u32,
}

impl ListingPlacement {
    pub fn key(&self) -> PlacementKey {
        PlacementKey {
            surface: self.surface.clone(),
            panel: self.panel.clone(),
            entity_id: self.entity_id.clone(),
            region: self.region.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Removed,
    Moved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Removed => "REMOVED",
            EventType::Moved => "MOVED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one placement change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub surface: String,
    pub panel: String,
    pub entity_id: EntityId,
    pub region: String,
    /// Current position; absent for REMOVED
    pub position: Option<u32>,
    /// Position in the previous snapshot; absent for ADDED
    pub previous_position: Option<u32>,
    #[serde(with = "ts_secs")]
    pub timestamp: DateTime<Utc>,
}

impl ListingEvent {
    pub fn key(&self) -> PlacementKey {
        PlacementKey {
            surface: self.surface.clone(),
            panel: self.panel.clone(),
            entity_id: self.entity_id.clone(),
            region: self.region.clone(),
        }
    }

    /// Stable id: placement key, event type and poll time. Re-appending the
    /// same event overwrites it.
    pub fn doc_id(&self) -> String {
        format!(
            "{}|{}|{}",
            self.key().doc_id(),
            self.event_type,
            format_ts(&self.timestamp)
        )
    }

    /// Position the placement is left at, `None` once removed.
    pub fn resulting_position(&self) -> Option<u32> {
        match self.event_type {
            EventType::Added | EventType::Moved => self.position,
            EventType::Removed => None,
        }
    }
}

/// Per-entity "present anywhere" rollup derived from the current snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPresence {
    pub entity_id: EntityId,
    pub in_listing: bool,
    pub placements: u32,
    pub best_position: Option<u32>,
    pub surfaces: Vec<String>,
    #[serde(with = "ts_secs")]
    pub updated_at: DateTime<Utc>,
}

// ================================================================================================
// CATALOG
// ================================================================================================

/// Entry of the known-entity catalog. Written once, when an entity is first seen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub entity_id: EntityId,
    #[serde(with = "ts_secs")]
    pub registered_at: DateTime<Utc>,
}

// ================================================================================================
// DERIVED STATE
// ================================================================================================

/// Tier of one entity in one classification run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAssignment {
    pub entity_id: EntityId,
    pub tier: Tier,
    #[serde(with = "ts_secs")]
    pub classified_at: DateTime<Utc>,
}

/// Denormalized per-entity read model. Always reconstructible.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub current_value: Option<f64>,
    pub peak_24h: Option<f64>,
    pub avg_24h: Option<f64>,
    pub avg_7d: Option<f64>,
    pub avg_30d: Option<f64>,
    #[serde(default)]
    pub in_listing: bool,
    pub listing_appearances_7d: Option<u64>,
    pub best_position: Option<u32>,
    #[serde(default, with = "ts_secs::option")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_secs::option")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_secs::option")]
    pub last_calculated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_values_detection() {
        let mut values = MetricValues::default();
        assert!(values.is_empty());

        values.plays = Some(0.0);
        values.peak_ccu = Some(0.0);
        assert!(values.is_empty(), "zeros are as good as nulls");

        values.favorites = Some(2.0);
        assert!(!values.is_empty());
    }

    #[test]
    fn test_sample_document_shape() {
        let sample = MetricSample {
            entity_id: EntityId::parse("1234-5678-9012").unwrap(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap(),
            values: MetricValues {
                peak_ccu: Some(42.0),
                ..Default::default()
            },
        };

        let doc = serde_json::to_value(&sample).unwrap();
        assert_eq!(doc["entity_id"], "1234-5678-9012");
        assert_eq!(doc["timestamp"], "2026-03-01T10:30:00Z");
        assert_eq!(doc["peak_ccu"], 42.0);
        assert!(doc.get("plays").is_none());
        assert_eq!(sample.doc_id(), "1234-5678-9012@2026-03-01T10:30:00Z");

        let back: MetricSample = serde_json::from_value(doc).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_metric_kinds_are_semantic() {
        assert_eq!(MetricField::PeakCcu.kind(), MetricKind::Max);
        assert_eq!(MetricField::Plays.kind(), MetricKind::Sum);
        assert_eq!(MetricField::RetentionD7.kind(), MetricKind::Average);
        assert!(matches!(
            MetricField::AvgMinutesPerPlayer.kind(),
            MetricKind::Ratio { .. }
        ));
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(serde_json::to_value(EventType::Moved).unwrap(), "MOVED");
        assert_eq!(EventType::Removed.to_string(), "REMOVED");
    }
}
