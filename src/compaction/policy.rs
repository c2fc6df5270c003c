//! Age-based retention policy.
//!
//! Thresholds partition sample age into bands. Band `i` covers timestamps in
//! `[now - age_i, now - age_{i-1})` (with `age_{-1} = 0`), and a sample in it
//! survives only when its minute of the UTC day is a multiple of the band's
//! target interval:
//!
//! | target | kept                      |
//! |--------|---------------------------|
//! | 1      | every minute              |
//! | 30     | `:00` and `:30`           |
//! | 60     | `:00`                     |
//! | 720    | `00:00` and `12:00`       |
//!
//! Targets must divide 1440 so the grid is the same on every day.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::types::minute_of_day;

const MINUTES_PER_DAY: u32 = 24 * 60;
const DAY_SECS: u64 = 24 * 60 * 60;

/// One retention band boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    /// Upper age bound of the band this threshold closes
    pub age: Duration,
    /// Grid spacing, in minutes, of the samples kept in the band
    pub target_interval_minutes: u32,
}

impl Threshold {
    pub fn new(age: Duration, target_interval_minutes: u32) -> Self {
        Self {
            age,
            target_interval_minutes,
        }
    }

    pub fn days(days: u64, target_interval_minutes: u32) -> Self {
        Self::new(Duration::from_secs(days * DAY_SECS), target_interval_minutes)
    }
}

/// Whether a sample at `timestamp` is on the keep grid of `target_interval_minutes`.
pub fn keeps(timestamp: &DateTime<Utc>, target_interval_minutes: u32) -> bool {
    target_interval_minutes <= 1 || minute_of_day(timestamp) % target_interval_minutes == 0
}

/// Ordered thresholds plus the age after which samples fold into daily documents.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPolicy {
    pub thresholds: Vec<Threshold>,
    /// Samples older than this are folded into per-day aggregates
    pub daily_rollup_after: Option<Duration>,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            thresholds: vec![
                Threshold::days(1, 1),
                Threshold::days(7, 30),
                Threshold::days(30, 60),
                Threshold::days(90, 720),
            ],
            daily_rollup_after: Some(Duration::from_secs(90 * DAY_SECS)),
        }
    }
}

impl CompactionPolicy {
    pub fn validate(&self) -> Result<(), String> {
        validate_thresholds(&self.thresholds)?;
        if let (Some(rollup), Some(last)) = (self.daily_rollup_after, self.thresholds.last()) {
            if rollup < last.age {
                return Err(format!(
                    "Daily rollup after {:?} overlaps the last retention band ending at {:?}",
                    rollup, last.age
                ));
            }
        }
        Ok(())
    }
}

/// Checks that ages and targets both increase strictly and every target divides a day.
pub fn validate_thresholds(thresholds: &[Threshold]) -> Result<(), String> {
    let mut previous: Option<&Threshold> = None;
    for threshold in thresholds {
        let target = threshold.target_interval_minutes;
        if target == 0 || MINUTES_PER_DAY % target != 0 {
            return Err(format!(
                "Target interval {} does not divide a day into whole slots",
                target
            ));
        }
        if threshold.age.is_zero() {
            return Err("Threshold age must be non-zero".to_string());
        }
        if let Some(prev) = previous {
            if threshold.age <= prev.age {
                return Err(format!(
                    "Threshold ages must increase: {:?} after {:?}",
                    threshold.age, prev.age
                ));
            }
            if target <= prev.target_interval_minutes {
                return Err(format!(
                    "Target intervals must increase: {} after {}",
                    target, prev.target_interval_minutes
                ));
            }
        }
        previous = Some(threshold);
    }
    Ok(())
}

/// Age range `[from, to)` of each band, paired with its threshold.
pub fn bands(thresholds: &[Threshold]) -> Vec<(Duration, Threshold)> {
    let mut lower = Duration::ZERO;
    thresholds
        .iter()
        .map(|threshold| {
            let band = (lower, *threshold);
            lower = threshold.age;
            band
        })
        .collect()
}
