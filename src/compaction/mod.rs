//! # Compactor
//!
//! Progressive down-sampling of the `samples` collection as it ages.
//!
//! One run has three stages:
//! 1. **Band sweep**: every retention band deletes the samples that are off
//!    its keep grid (see [`policy`]).
//! 2. **Daily rollup**: samples older than `daily_rollup_after` are folded
//!    into one `daily` document per (entity, UTC day) and then deleted.
//! 3. **Merge**: every daily document's pending readings are reduced into its
//!    `merged` values with the per-metric reducers (see [`reducer`]).
//!
//! Compaction is lossy and irreversible. Deletes happen only after the
//! replacement data (if any) has been written.

pub mod policy;
pub mod reducer;

pub use policy::{keeps, CompactionPolicy, Threshold};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, TaskError};
use crate::records::{DailyAggregate, DailyReading, MetricSample};
use crate::scheduler::{run_blocking, PeriodicTask, RunStats};
use crate::store::{collections, get_record, Document, Filter, Store};
use crate::types::{format_ts, EntityId};
use reducer::Merged;

/// Deletes issued per bulk call.
const DELETE_BATCH: usize = 1000;

/// Outcome of one retention band.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandReport {
    pub from_age: Duration,
    pub to_age: Duration,
    pub target_interval_minutes: u32,
    pub scanned: usize,
    pub kept: usize,
    pub deleted: usize,
    pub delete_failed: usize,
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    pub bands: Vec<BandReport>,
    /// Samples folded into daily documents
    pub rolled_up: usize,
    /// Daily documents written by the rollup
    pub daily_documents: usize,
    /// Daily documents whose readings were reduced
    pub merged: usize,
    /// Stopped early by cancellation
    pub interrupted: bool,
}

impl CompactionReport {
    pub fn deleted(&self) -> usize {
        self.bands.iter().map(|b| b.deleted).sum::<usize>() + self.rolled_up
    }
}

impl From<CompactionReport> for RunStats {
    fn from(report: CompactionReport) -> Self {
        let scanned: usize = report.bands.iter().map(|b| b.scanned).sum();
        let kept: usize = report.bands.iter().map(|b| b.kept).sum();
        let failed: usize = report.bands.iter().map(|b| b.delete_failed).sum();
        RunStats {
            processed: scanned + report.rolled_up,
            succeeded: kept + report.rolled_up,
            no_data: 0,
            failed,
            note: Some(format!(
                "deleted={} rolled_up={} daily_documents={} merged={}{}",
                report.deleted(),
                report.rolled_up,
                report.daily_documents,
                report.merged,
                if report.interrupted { " interrupted" } else { "" }
            )),
        }
    }
}

/// Applies a [`CompactionPolicy`] to the sample store.
#[derive(Clone)]
pub struct Compactor {
    store: Arc<dyn Store>,
    policy: CompactionPolicy,
}

impl Compactor {
    pub fn new(store: Arc<dyn Store>, policy: CompactionPolicy) -> Result<Self, String> {
        policy.validate()?;
        Ok(Self { store, policy })
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Sweeps the bands of `thresholds` as of now.
    pub fn compact(&self, thresholds: &[Threshold]) -> Result<CompactionReport, TaskError> {
        self.compact_at(thresholds, Utc::now(), &CancellationToken::new())
    }

    /// Sweeps the bands of `thresholds` as of `now`.
    pub fn compact_at(
        &self,
        thresholds: &[Threshold],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CompactionReport, TaskError> {
        policy::validate_thresholds(thresholds).map_err(TaskError::Failed)?;

        let mut report = CompactionReport::default();
        for (from_age, threshold) in policy::bands(thresholds) {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let band = self.sweep_band(from_age, threshold, now, cancel)?;
            debug!(
                "Band {:?}..{:?} @{}m: scanned={} kept={} deleted={}",
                band.from_age,
                band.to_age,
                band.target_interval_minutes,
                band.scanned,
                band.kept,
                band.deleted
            );
            report.bands.push(band);
        }
        Ok(report)
    }

    /// Runs every stage of the configured policy as of `now`.
    pub fn run_policy_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CompactionReport, TaskError> {
        let mut report = self.compact_at(&self.policy.thresholds, now, cancel)?;

        if let Some(after) = self.policy.daily_rollup_after {
            if !cancel.is_cancelled() {
                let (rolled_up, documents) = self.roll_up_daily(after, now, cancel)?;
                report.rolled_up = rolled_up;
                report.daily_documents = documents;
            }
        }
        if !cancel.is_cancelled() {
            report.merged = self.merge_daily(cancel)?;
        }
        report.interrupted |= cancel.is_cancelled();

        info!(
            "Compaction finished: {} samples deleted, {} rolled up into {} daily documents, {} merged",
            report.deleted(),
            report.rolled_up,
            report.daily_documents,
            report.merged
        );
        Ok(report)
    }

    fn sweep_band(
        &self,
        from_age: Duration,
        threshold: Threshold,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BandReport, TaskError> {
        let mut band = BandReport {
            from_age,
            to_age: threshold.age,
            target_interval_minutes: threshold.target_interval_minutes,
            ..Default::default()
        };
        if threshold.target_interval_minutes <= 1 {
            return Ok(band);
        }

        let filter = Filter::all().range(
            "timestamp",
            Some(format_ts(&(now - to_chrono(threshold.age)?))),
            Some(format_ts(&(now - to_chrono(from_age)?))),
        );

        let mut doomed = Vec::new();
        for doc in self.store.scroll_all(collections::SAMPLES, &filter)? {
            if cancel.is_cancelled() {
                break;
            }
            let doc = doc?;
            band.scanned += 1;
            let sample: MetricSample = match doc.decode() {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Skipping undecodable sample '{}': {}", doc.id, e);
                    band.kept += 1;
                    continue;
                }
            };
            if keeps(&sample.timestamp, threshold.target_interval_minutes) {
                band.kept += 1;
            } else {
                doomed.push(doc.id);
                if doomed.len() >= DELETE_BATCH {
                    self.delete_batch(&mut doomed, &mut band)?;
                }
            }
        }
        self.delete_batch(&mut doomed, &mut band)?;
        Ok(band)
    }

    fn delete_batch(&self, ids: &mut Vec<String>, band: &mut BandReport) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let outcome = self.store.bulk_delete(collections::SAMPLES, ids)?;
        for (id, reason) in &outcome.failed {
            warn!("Delete of sample '{}' failed: {}", id, reason);
        }
        band.deleted += outcome.succeeded;
        band.delete_failed += outcome.failed.len();
        ids.clear();
        Ok(())
    }

    /// Folds samples older than `after` into daily documents, then deletes them.
    /// Returns (samples folded, daily documents written).
    fn roll_up_daily(
        &self,
        after: Duration,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), TaskError> {
        let cutoff = now - to_chrono(after)?;
        let filter = Filter::all().range("timestamp", None::<String>, Some(format_ts(&cutoff)));

        let mut pending: BTreeMap<(EntityId, NaiveDate), Vec<(String, DailyReading)>> =
            BTreeMap::new();
        let mut pending_count = 0;
        let mut totals = (0, 0);

        for doc in self.store.scroll_all(collections::SAMPLES, &filter)? {
            if cancel.is_cancelled() {
                break;
            }
            let doc = doc?;
            let sample: MetricSample = match doc.decode() {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Skipping undecodable sample '{}': {}", doc.id, e);
                    continue;
                }
            };
            pending
                .entry((sample.entity_id, sample.timestamp.date_naive()))
                .or_default()
                .push((
                    doc.id,
                    DailyReading {
                        timestamp: sample.timestamp,
                        values: sample.values,
                    },
                ));
            pending_count += 1;

            if pending_count >= DELETE_BATCH {
                let (folded, written) = self.fold_groups(std::mem::take(&mut pending))?;
                totals = (totals.0 + folded, totals.1 + written);
                pending_count = 0;
            }
        }
        let (folded, written) = self.fold_groups(pending)?;
        Ok((totals.0 + folded, totals.1 + written))
    }

    /// Appends readings to their daily documents and deletes the source samples
    /// of every document that was written.
    fn fold_groups(
        &self,
        groups: BTreeMap<(EntityId, NaiveDate), Vec<(String, DailyReading)>>,
    ) -> Result<(usize, usize), StoreError> {
        if groups.is_empty() {
            return Ok((0, 0));
        }

        let mut docs = Vec::with_capacity(groups.len());
        let mut sources: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for ((entity_id, day), readings) in groups {
            let id = crate::records::daily_id(&entity_id, day);
            let mut daily = get_record::<DailyAggregate>(self.store.as_ref(), collections::DAILY, &id)?
                .unwrap_or_else(|| DailyAggregate::new(entity_id, day));

            let mut source_ids = Vec::with_capacity(readings.len());
            for (sample_id, reading) in readings {
                daily.readings.retain(|r| r.timestamp != reading.timestamp);
                daily.readings.push(reading);
                source_ids.push(sample_id);
            }
            daily.readings.sort_by_key(|r| r.timestamp);

            docs.push(Document::from_record(id.clone(), &daily)?);
            sources.insert(id, source_ids);
        }

        let outcome = self.store.bulk_upsert(collections::DAILY, &docs)?;
        for (id, reason) in &outcome.failed {
            warn!("Daily document '{}' not written, keeping its samples: {}", id, reason);
            sources.remove(id);
        }

        let doomed: Vec<String> = sources.into_values().flatten().collect();
        let mut folded = 0;
        for chunk in doomed.chunks(DELETE_BATCH) {
            let deleted = self.store.bulk_delete(collections::SAMPLES, chunk)?;
            for (id, reason) in &deleted.failed {
                warn!("Delete of rolled-up sample '{}' failed: {}", id, reason);
            }
            folded += deleted.succeeded;
        }
        Ok((folded, outcome.succeeded))
    }

    /// Reduces pending readings of every daily document. Returns documents merged.
    fn merge_daily(&self, cancel: &CancellationToken) -> Result<usize, TaskError> {
        let mut batch = Vec::new();
        let mut merged = 0;

        for doc in self.store.scroll_all(collections::DAILY, &Filter::all())? {
            if cancel.is_cancelled() {
                break;
            }
            let doc = doc?;
            let mut daily: DailyAggregate = match doc.decode() {
                Ok(daily) => daily,
                Err(e) => {
                    warn!("Skipping undecodable daily document '{}': {}", doc.id, e);
                    continue;
                }
            };
            if daily.readings.is_empty() {
                continue;
            }

            let readings: Vec<_> = daily.readings.drain(..).map(|r| r.values).collect();
            let previous = daily.merged.as_ref().map(|values| Merged {
                values,
                count: daily.merged_count,
                field_counts: &daily.merged_field_counts,
            });
            let values = reducer::merge(previous, &readings);
            let field_counts = reducer::field_counts(previous, &readings);
            daily.merged_count += readings.len() as u32;
            daily.merged_field_counts = field_counts;
            daily.merged = Some(values);

            batch.push(Document::from_record(doc.id, &daily)?);
            if batch.len() >= DELETE_BATCH {
                merged += self.write_merged(std::mem::take(&mut batch))?;
            }
        }
        merged += self.write_merged(batch)?;
        Ok(merged)
    }

    fn write_merged(&self, docs: Vec<Document>) -> Result<usize, StoreError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let outcome = self.store.bulk_upsert(collections::DAILY, &docs)?;
        for (id, reason) in &outcome.failed {
            warn!("Merged daily document '{}' not written: {}", id, reason);
        }
        Ok(outcome.succeeded)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, TaskError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| TaskError::Failed(format!("Age out of range: {}", e)))
}

#[async_trait]
impl PeriodicTask for Compactor {
    fn name(&self) -> &str {
        "compactor"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<RunStats, TaskError> {
        let compactor = self.clone();
        let cancel = cancel.clone();
        run_blocking(move || compactor.run_policy_at(Utc::now(), &cancel))
            .await
            .map(RunStats::from)
    }
}
