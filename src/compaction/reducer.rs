//! Per-metric reducers for folding many readings into one.
//!
//! The reducer of each metric is fixed by [`MetricField::kind`]:
//! sums add, peaks take the maximum, ratios are recomputed from the merged
//! totals, and plain averages take a weighted mean.

use std::collections::BTreeMap;

use crate::records::{MetricField, MetricKind, MetricValues};

/// Previously merged values and how many readings they stand for.
#[derive(Debug, Clone, Copy)]
pub struct Merged<'a> {
    pub values: &'a MetricValues,
    /// Readings behind the merge as a whole
    pub count: u32,
    /// Readings behind each metric, by field name
    pub field_counts: &'a BTreeMap<String, u32>,
}

impl Merged<'_> {
    /// Readings that carried `field`. Falls back to the whole count for a
    /// merge written without per-field counts.
    pub fn weight(&self, field: MetricField) -> u32 {
        self.field_counts
            .get(field.field_name())
            .copied()
            .unwrap_or(self.count)
    }
}

/// Reduces `readings` (plus any earlier merge) into one set of values.
pub fn merge(previous: Option<Merged<'_>>, readings: &[MetricValues]) -> MetricValues {
    let mut merged = MetricValues::default();

    // Ratios read the merged totals, so every other metric goes first.
    let (ratios, direct): (Vec<MetricField>, Vec<MetricField>) = MetricField::all()
        .into_iter()
        .partition(|f| matches!(f.kind(), MetricKind::Ratio { .. }));

    for field in direct.into_iter().chain(ratios) {
        let value = match field.kind() {
            MetricKind::Sum => fold(previous, readings, field, |a, b| a + b),
            MetricKind::Max => fold(previous, readings, field, f64::max),
            MetricKind::Average => weighted_mean(previous, readings, field),
            MetricKind::Ratio {
                numerator,
                denominator,
            } => match (merged.get(numerator), merged.get(denominator)) {
                (Some(n), Some(d)) if d > 0.0 => Some(n / d),
                _ => weighted_mean(previous, readings, field),
            },
        };
        merged.set(field, value);
    }
    merged
}

fn fold(
    previous: Option<Merged<'_>>,
    readings: &[MetricValues],
    field: MetricField,
    combine: impl Fn(f64, f64) -> f64,
) -> Option<f64> {
    previous
        .and_then(|p| p.values.get(field))
        .into_iter()
        .chain(readings.iter().filter_map(|r| r.get(field)))
        .filter(|v| v.is_finite())
        .reduce(combine)
}

/// Readings behind each metric after merging `readings` into `previous`.
pub fn field_counts(
    previous: Option<Merged<'_>>,
    readings: &[MetricValues],
) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for field in MetricField::all() {
        let earlier = previous
            .filter(|p| p.values.get(field).map_or(false, f64::is_finite))
            .map_or(0, |p| p.weight(field));
        let fresh = readings
            .iter()
            .filter_map(|r| r.get(field))
            .filter(|v| v.is_finite())
            .count() as u32;
        if earlier + fresh > 0 {
            counts.insert(field.field_name().to_string(), earlier + fresh);
        }
    }
    counts
}

/// Mean of the readings, with an earlier merge weighted by how many readings
/// carried the metric.
fn weighted_mean(
    previous: Option<Merged<'_>>,
    readings: &[MetricValues],
    field: MetricField,
) -> Option<f64> {
    let mut total = 0.0;
    let mut weight = 0.0;

    if let Some(p) = previous {
        if let Some(v) = p.values.get(field).filter(|v| v.is_finite()) {
            let w = f64::from(p.weight(field).max(1));
            total += v * w;
            weight += w;
        }
    }
    for v in readings.iter().filter_map(|r| r.get(field)).filter(|v| v.is_finite()) {
        total += v;
        weight += 1.0;
    }

    (weight > 0.0).then(|| total / weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(f: impl FnOnce(&mut MetricValues)) -> MetricValues {
        let mut values = MetricValues::default();
        f(&mut values);
        values
    }

    #[test]
    fn test_sum_of_24_hourly_ones() {
        let readings: Vec<MetricValues> = (0..24).map(|_| reading(|v| v.plays = Some(1.0))).collect();
        assert_eq!(merge(None, &readings).plays, Some(24.0));
    }

    #[test]
    fn test_peak_takes_the_maximum() {
        let peaks = [5.0, 9.0, 3.0, 7.0, 1.0, 8.0];
        let readings: Vec<MetricValues> = (0..24)
            .map(|i| reading(|v| v.peak_ccu = Some(peaks[i % peaks.len()])))
            .collect();
        assert_eq!(merge(None, &readings).peak_ccu, Some(9.0));
    }

    #[test]
    fn test_ratio_recomputed_from_totals() {
        let readings = vec![
            reading(|v| {
                v.minutes_played = Some(100.0);
                v.unique_players = Some(10.0);
                v.avg_minutes_per_player = Some(10.0);
            }),
            reading(|v| {
                v.minutes_played = Some(300.0);
                v.unique_players = Some(10.0);
                v.avg_minutes_per_player = Some(30.0);
            }),
        ];
        let merged = merge(None, &readings);
        assert_eq!(merged.minutes_played, Some(400.0));
        assert_eq!(merged.unique_players, Some(20.0));
        assert_eq!(merged.avg_minutes_per_player, Some(20.0));
    }

    #[test]
    fn test_ratio_falls_back_to_average_without_totals() {
        let readings = vec![
            reading(|v| v.avg_minutes_per_player = Some(10.0)),
            reading(|v| v.avg_minutes_per_player = Some(40.0)),
        ];
        assert_eq!(merge(None, &readings).avg_minutes_per_player, Some(25.0));
    }

    #[test]
    fn test_averages_weight_the_earlier_merge() {
        let earlier = reading(|v| {
            v.retention_d1 = Some(0.5);
            v.plays = Some(10.0);
        });
        let readings = vec![reading(|v| {
            v.retention_d1 = Some(0.1);
            v.plays = Some(2.0);
        })];

        let no_field_counts = BTreeMap::new();
        let merged = merge(
            Some(Merged {
                values: &earlier,
                count: 3,
                field_counts: &no_field_counts,
            }),
            &readings,
        );
        assert_eq!(merged.plays, Some(12.0));
        let retention = merged.retention_d1.unwrap();
        assert!((retention - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_average_weight_counts_only_readings_with_the_metric() {
        // 24 readings merged, but only one of them reported retention.
        let earlier = reading(|v| {
            v.retention_d1 = Some(0.5);
            v.plays = Some(24.0);
        });
        let counts: BTreeMap<String, u32> =
            [("retention_d1".to_string(), 1), ("plays".to_string(), 24)].into();
        let previous = Merged {
            values: &earlier,
            count: 24,
            field_counts: &counts,
        };
        let readings = vec![reading(|v| v.retention_d1 = Some(0.1))];

        let retention = merge(Some(previous), &readings).retention_d1.unwrap();
        assert!((retention - 0.3).abs() < 1e-9);

        let next = field_counts(Some(previous), &readings);
        assert_eq!(next.get("retention_d1"), Some(&2));
        assert_eq!(next.get("plays"), Some(&24));
        assert_eq!(next.get("favorites"), None);
    }

    #[test]
    fn test_absent_metrics_stay_absent() {
        let readings = vec![reading(|v| v.plays = Some(3.0))];
        let merged = merge(None, &readings);
        assert_eq!(merged.favorites, None);
        assert_eq!(merged.avg_minutes_per_player, None);
    }
}
