//! Worker configuration.
//!
//! Every struct carries the reference values in its `Default` impl;
//! [`WorkerConfig::from_env`] overrides them from `TRACKER_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::compaction::CompactionPolicy;
use crate::provider::HttpProviderConfig;
use crate::types::{Granularity, Tier};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Share of the theoretical request capacity a Cold slice is sized to use.
const COLD_BUDGET_UTILIZATION: f64 = 0.8;

// ================================================================================================
// COLLECTORS
// ================================================================================================

/// Where a collector's entity list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulationSource {
    /// Every entity currently assigned to the tier
    WholeTier,
    /// A rotating slice of the tier, resumed from a durable checkpoint.
    /// `None` derives the slice size from the request budget.
    Rotation { slice_size: Option<usize> },
}

/// Parameters of one tiered collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub tier: Tier,
    /// How often a cycle fires
    pub cadence: Duration,
    /// Window requested per entity; must cover the cadence
    pub lookback: Duration,
    pub granularity: Granularity,
    /// Requests-per-second budget towards the metrics provider
    pub requests_per_second: u32,
    /// Bulk writer batch size
    pub batch_size: usize,
    /// Bound on each provider call
    pub call_timeout: Duration,
    pub population: PopulationSource,
}

impl CollectorConfig {
    pub fn hot() -> Self {
        Self {
            tier: Tier::Hot,
            cadence: Duration::from_secs(10 * MINUTE),
            lookback: Duration::from_secs(15 * MINUTE),
            granularity: Granularity::Minute,
            requests_per_second: 10,
            batch_size: 500,
            call_timeout: Duration::from_secs(15),
            population: PopulationSource::WholeTier,
        }
    }

    pub fn warm() -> Self {
        Self {
            tier: Tier::Warm,
            cadence: Duration::from_secs(30 * MINUTE),
            lookback: Duration::from_secs(35 * MINUTE),
            granularity: Granularity::Minute,
            requests_per_second: 10,
            batch_size: 500,
            call_timeout: Duration::from_secs(15),
            population: PopulationSource::WholeTier,
        }
    }

    pub fn cold() -> Self {
        Self {
            tier: Tier::Cold,
            cadence: Duration::from_secs(HOUR),
            lookback: Duration::from_secs(DAY),
            granularity: Granularity::Hour,
            requests_per_second: 5,
            batch_size: 1000,
            call_timeout: Duration::from_secs(20),
            population: PopulationSource::Rotation { slice_size: None },
        }
    }

    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Hot => Self::hot(),
            Tier::Warm => Self::warm(),
            Tier::Cold => Self::cold(),
        }
    }

    /// Rotation slice size: explicit, or what the budget can serve in one cadence.
    pub fn slice_size(&self) -> Option<usize> {
        match self.population {
            PopulationSource::WholeTier => None,
            PopulationSource::Rotation {
                slice_size: Some(size),
            } => Some(size.max(1)),
            PopulationSource::Rotation { slice_size: None } => {
                let capacity = self.requests_per_second as f64 * self.cadence.as_secs_f64();
                Some(((capacity * COLD_BUDGET_UTILIZATION) as usize).max(1))
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cadence.is_zero() {
            return Err(format!("{} collector: cadence must be non-zero", self.tier));
        }
        if self.lookback < self.cadence {
            return Err(format!(
                "{} collector: lookback {:?} shorter than cadence {:?} leaves gaps",
                self.tier, self.lookback, self.cadence
            ));
        }
        if self.batch_size == 0 {
            return Err(format!("{} collector: batch_size must be > 0", self.tier));
        }
        if self.call_timeout.is_zero() {
            return Err(format!("{} collector: call_timeout must be non-zero", self.tier));
        }
        Ok(())
    }
}

// ================================================================================================
// CLASSIFIER, LISTINGS, SCHEDULES
// ================================================================================================

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// N1: size of the Hot tier
    pub hot_size: usize,
    /// N2: size of the Warm tier
    pub warm_size: usize,
    /// Trailing window for the peak-activity ranking
    pub activity_window: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hot_size: 250,
            warm_size: 1500,
            activity_window: Duration::from_secs(DAY),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListingConfig {
    pub surfaces: Vec<String>,
    pub regions: Vec<String>,
    /// Upper bound on pages fetched per (surface, panel, region)
    pub max_pages: u32,
    pub call_timeout: Duration,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            surfaces: vec!["browse".to_string()],
            regions: ["NAE", "NAW", "EU", "ASIA", "BR", "ME", "OCE"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            max_pages: 20,
            call_timeout: Duration::from_secs(15),
        }
    }
}

/// Cadences of the non-collector tasks.
#[derive(Debug, Clone)]
pub struct Cadences {
    pub listing: Duration,
    pub summary: Duration,
    pub compaction: Duration,
    pub classification: Duration,
}

impl Default for Cadences {
    fn default() -> Self {
        Self {
            listing: Duration::from_secs(10 * MINUTE),
            summary: Duration::from_secs(30 * MINUTE),
            compaction: Duration::from_secs(30 * DAY),
            classification: Duration::from_secs(30 * MINUTE),
        }
    }
}

// ================================================================================================
// WORKER
// ================================================================================================

/// Complete configuration of the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub provider: HttpProviderConfig,
    pub hot: CollectorConfig,
    pub warm: CollectorConfig,
    pub cold: CollectorConfig,
    pub classifier: ClassifierConfig,
    pub listing: ListingConfig,
    pub compaction: CompactionPolicy,
    pub cadences: Cadences,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./var/data/tracker.db"),
            checkpoint_path: PathBuf::from("./var/data/cold_rotation.json"),
            provider: HttpProviderConfig::default(),
            hot: CollectorConfig::hot(),
            warm: CollectorConfig::warm(),
            cold: CollectorConfig::cold(),
            classifier: ClassifierConfig::default(),
            listing: ListingConfig::default(),
            compaction: CompactionPolicy::default(),
            cadences: Cadences::default(),
        }
    }
}

impl WorkerConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("TRACKER_STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("TRACKER_CHECKPOINT_PATH") {
            config.checkpoint_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("TRACKER_PROVIDER_URL") {
            config.provider.base_url = url;
        }
        config.provider.bearer_token = lookup("TRACKER_PROVIDER_TOKEN").filter(|t| !t.is_empty());

        if let Some(total) = parse::<u32>(&lookup, "TRACKER_REQUESTS_PER_SECOND")? {
            config.set_upstream_budget(total)?;
        }
        if let Some(secs) = parse::<u64>(&lookup, "TRACKER_CALL_TIMEOUT_SECS")? {
            let timeout = Duration::from_secs(secs);
            config.provider.timeout = timeout;
            config.listing.call_timeout = timeout;
            for collector in [&mut config.hot, &mut config.warm, &mut config.cold] {
                collector.call_timeout = timeout;
            }
        }
        if let Some(size) = parse::<usize>(&lookup, "TRACKER_BATCH_SIZE")? {
            for collector in [&mut config.hot, &mut config.warm, &mut config.cold] {
                collector.batch_size = size;
            }
        }
        if let Some(size) = parse::<usize>(&lookup, "TRACKER_COLD_SLICE_SIZE")? {
            config.cold.population = PopulationSource::Rotation {
                slice_size: Some(size),
            };
        }
        if let Some(n) = parse::<usize>(&lookup, "TRACKER_HOT_SIZE")? {
            config.classifier.hot_size = n;
        }
        if let Some(n) = parse::<usize>(&lookup, "TRACKER_WARM_SIZE")? {
            config.classifier.warm_size = n;
        }
        if let Some(surfaces) = lookup("TRACKER_SURFACES") {
            config.listing.surfaces = split_list(&surfaces);
        }
        if let Some(regions) = lookup("TRACKER_REGIONS") {
            config.listing.regions = split_list(&regions);
        }

        config.validate()?;
        Ok(config)
    }

    /// Requests per second the three collectors send upstream together.
    pub fn upstream_requests_per_second(&self) -> u32 {
        self.collectors()
            .iter()
            .map(|c| c.requests_per_second)
            .sum()
    }

    /// Splits a total upstream budget across the collectors in proportion to
    /// their current rates. Every tier keeps at least one request per second.
    pub fn set_upstream_budget(&mut self, total: u32) -> Result<(), String> {
        if total < 3 {
            return Err(format!(
                "Upstream budget of {} requests/s cannot serve three tiers",
                total
            ));
        }
        let weights = self.collectors().map(|c| u64::from(c.requests_per_second.max(1)));
        let weight_sum: u64 = weights.iter().sum();

        let mut shares = weights.map(|w| ((u64::from(total) * w / weight_sum) as u32).max(1));
        let mut assigned: u32 = shares.iter().sum();
        let mut i = 0;
        while assigned < total {
            shares[i % shares.len()] += 1;
            assigned += 1;
            i += 1;
        }
        while assigned > total {
            let largest = (0..shares.len())
                .max_by_key(|&j| shares[j])
                .unwrap_or(0);
            shares[largest] -= 1;
            assigned -= 1;
        }

        self.hot.requests_per_second = shares[0];
        self.warm.requests_per_second = shares[1];
        self.cold.requests_per_second = shares[2];
        Ok(())
    }

    fn collectors(&self) -> [&CollectorConfig; 3] {
        [&self.hot, &self.warm, &self.cold]
    }

    pub fn validate(&self) -> Result<(), String> {
        self.hot.validate()?;
        self.warm.validate()?;
        self.cold.validate()?;
        self.compaction.validate()?;
        if self.listing.regions.is_empty() {
            return Err("At least one listing region is required".to_string());
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("Invalid value for {}: '{}' ({})", key, raw, e))
        })
        .transpose()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
