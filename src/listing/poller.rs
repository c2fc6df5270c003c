//! Listing poll cycle: fetch, diff, persist.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::differ::diff;
use crate::config::ListingConfig;
use crate::error::{ProviderError, StoreError, TaskError};
use crate::provider::{ListingProvider, PanelRef};
use crate::records::{
    CatalogEntry, EventType, ListingEvent, ListingPlacement, ListingPresence, PlacementKey,
};
use crate::scheduler::{PeriodicTask, RunStats};
use crate::store::{collections, Document, Filter, Store};
use crate::types::EntityId;

/// One ranked list: a region of a panel of a surface.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Scope {
    surface: String,
    panel: String,
    region: String,
}

impl Scope {
    fn of(placement: &ListingPlacement) -> Self {
        Self {
            surface: placement.surface.clone(),
            panel: placement.panel.clone(),
            region: placement.region.clone(),
        }
    }
}

/// Counts for one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollStats {
    pub scopes: usize,
    pub scopes_failed: usize,
    pub scopes_empty: usize,
    /// Placements in the new snapshot
    pub placements: usize,
    pub added: usize,
    pub removed: usize,
    pub moved: usize,
    pub new_entities: usize,
    /// Results dropped for an invalid or duplicate entity code
    pub dropped: usize,
}

impl From<PollStats> for RunStats {
    fn from(stats: PollStats) -> Self {
        RunStats {
            processed: stats.scopes,
            succeeded: stats.scopes - stats.scopes_failed - stats.scopes_empty,
            no_data: stats.scopes_empty,
            failed: stats.scopes_failed,
            note: Some(format!(
                "placements={} added={} removed={} moved={} new_entities={}",
                stats.placements, stats.added, stats.removed, stats.moved, stats.new_entities
            )),
        }
    }
}

/// Polls ranked listings and records how placements change between polls.
pub struct ListingPoller {
    listings: Arc<dyn ListingProvider>,
    store: Arc<dyn Store>,
    config: ListingConfig,
}

impl ListingPoller {
    pub fn new(
        listings: Arc<dyn ListingProvider>,
        store: Arc<dyn Store>,
        config: ListingConfig,
    ) -> Self {
        Self {
            listings,
            store,
            config,
        }
    }

    pub async fn poll(&self, cancel: &CancellationToken) -> Result<PollStats, TaskError> {
        self.poll_at(Utc::now(), cancel).await
    }

    /// Runs one poll cycle as of `now`.
    ///
    /// 1. Fetch every scope; a scope that cannot be fetched keeps its
    ///    previous placements.
    /// 2. Diff against the stored `listing_current` projection.
    /// 3. Append events, replace the projection, rebuild the presence rollup
    ///    and register newly seen entities.
    pub async fn poll_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PollStats, TaskError> {
        let previous = self.load_previous()?;
        let mut previous_by_scope: BTreeMap<Scope, Vec<ListingPlacement>> = BTreeMap::new();
        for placement in &previous {
            previous_by_scope
                .entry(Scope::of(placement))
                .or_default()
                .push(placement.clone());
        }

        let mut stats = PollStats::default();
        let mut current = Vec::new();

        for surface in &self.config.surfaces {
            if cancel.is_cancelled() {
                return Err(TaskError::Failed("listing poll cancelled".to_string()));
            }

            let panels = match self.with_timeout(self.listings.list_panels(surface)).await {
                Ok(panels) => panels,
                Err(e) if e.is_systemic() => {
                    return Err(TaskError::Fatal(format!(
                        "Listing provider rejected credentials: {}",
                        e
                    )))
                }
                Err(e) => {
                    warn!("Listing panels for '{}' unavailable, keeping previous: {}", surface, e);
                    for (scope, placements) in &previous_by_scope {
                        if &scope.surface == surface {
                            stats.scopes += 1;
                            stats.scopes_failed += 1;
                            current.extend(placements.iter().cloned());
                        }
                    }
                    continue;
                }
            };

            for panel in &panels {
                for region in &self.config.regions {
                    if cancel.is_cancelled() {
                        return Err(TaskError::Failed("listing poll cancelled".to_string()));
                    }
                    let scope = Scope {
                        surface: surface.clone(),
                        panel: panel.panel_name.clone(),
                        region: region.clone(),
                    };
                    stats.scopes += 1;

                    match self.fetch_scope(&scope, panel, &mut stats).await {
                        Ok(placements) => {
                            if placements.is_empty() {
                                stats.scopes_empty += 1;
                            }
                            current.extend(placements);
                        }
                        Err(e) if e.is_systemic() => {
                            return Err(TaskError::Fatal(format!(
                                "Listing provider rejected credentials: {}",
                                e
                            )))
                        }
                        Err(e) => {
                            warn!(
                                "Listing {}/{}/{} unavailable, keeping previous: {}",
                                scope.surface, scope.panel, scope.region, e
                            );
                            stats.scopes_failed += 1;
                            if let Some(kept) = previous_by_scope.get(&scope) {
                                current.extend(kept.iter().cloned());
                            }
                        }
                    }
                }
            }
        }

        stats.placements = current.len();
        let events = self.unrecorded(diff(&previous, &current, now))?;
        for event in &events {
            match event.event_type {
                EventType::Added => stats.added += 1,
                EventType::Removed => stats.removed += 1,
                EventType::Moved => stats.moved += 1,
            }
        }

        let event_docs = events
            .iter()
            .map(|event| Document::from_record(event.doc_id(), event))
            .collect::<Result<Vec<_>, _>>()?;
        self.write_all(collections::LISTING_EVENTS, &event_docs)?;

        self.replace_current(&previous, &current)?;
        self.rebuild_presence(&current, now)?;
        stats.new_entities = self.register_entities(&current, now)?;

        debug!(
            "Listing poll: {} scopes, {} placements, {} events",
            stats.scopes,
            stats.placements,
            events.len()
        );
        Ok(stats)
    }

    /// Pages one scope until `has_more` is false or `max_pages` is reached.
    ///
    /// Positions are 0-based ranks in upstream order. An entity listed more
    /// than once in a scope keeps its first position.
    async fn fetch_scope(
        &self,
        scope: &Scope,
        panel: &PanelRef,
        stats: &mut PollStats,
    ) -> Result<Vec<ListingPlacement>, ProviderError> {
        let mut placements = Vec::new();
        let mut seen: HashSet<EntityId> = HashSet::new();
        let mut rank: u32 = 0;

        for page_index in 0..self.config.max_pages.max(1) {
            let page = self
                .with_timeout(self.listings.list_placements(
                    &scope.surface,
                    &scope.panel,
                    panel.variant.as_deref(),
                    &scope.region,
                    page_index,
                ))
                .await?;

            for result in &page.results {
                let position = rank;
                rank += 1;
                let Some(entity_id) = result.entity() else {
                    debug!("Dropping listing result with invalid code '{}'", result.entity_id);
                    stats.dropped += 1;
                    continue;
                };
                if !seen.insert(entity_id.clone()) {
                    stats.dropped += 1;
                    continue;
                }
                placements.push(ListingPlacement {
                    surface: scope.surface.clone(),
                    panel: scope.panel.clone(),
                    entity_id,
                    region: scope.region.clone(),
                    position,
                });
            }

            if !page.has_more {
                return Ok(placements);
            }
        }

        warn!(
            "Listing {}/{}/{} still had more after {} pages",
            scope.surface, scope.panel, scope.region, self.config.max_pages
        );
        Ok(placements)
    }

    async fn with_timeout<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.call_timeout)),
        }
    }

    fn load_previous(&self) -> Result<Vec<ListingPlacement>, StoreError> {
        self.store
            .scroll_all(collections::LISTING_CURRENT, &Filter::all())?
            .map(|doc| doc?.decode::<ListingPlacement>())
            .collect()
    }

    /// Drops events the log already holds.
    ///
    /// When a projection write failed, the next diff runs against a stale
    /// `listing_current` and replays changes that were already appended. An
    /// event is a replay when the last logged event of its placement key
    /// leaves the placement in the same state.
    fn unrecorded(&self, events: Vec<ListingEvent>) -> Result<Vec<ListingEvent>, StoreError> {
        if events.is_empty() {
            return Ok(events);
        }

        let entities: BTreeSet<&EntityId> = events.iter().map(|e| &e.entity_id).collect();
        let mut last_logged: HashMap<PlacementKey, ListingEvent> = HashMap::new();
        for entity_id in entities {
            let filter = Filter::all().eq("entity_id", entity_id.as_str());
            for doc in self.store.scroll_all(collections::LISTING_EVENTS, &filter)? {
                let logged: ListingEvent = doc?.decode()?;
                match last_logged.entry(logged.key()) {
                    Entry::Occupied(mut slot) => {
                        if logged.timestamp > slot.get().timestamp {
                            slot.insert(logged);
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(logged);
                    }
                }
            }
        }

        let total = events.len();
        let fresh: Vec<ListingEvent> = events
            .into_iter()
            .filter(|event| {
                last_logged.get(&event.key()).map_or(true, |last| {
                    last.timestamp == event.timestamp
                        || last.resulting_position() != event.resulting_position()
                })
            })
            .collect();
        if fresh.len() < total {
            info!(
                "Skipping {} listing events already in the log",
                total - fresh.len()
            );
        }
        Ok(fresh)
    }

    /// Replaces the projection: upserts every current key, deletes vanished ones.
    fn replace_current(
        &self,
        previous: &[ListingPlacement],
        current: &[ListingPlacement],
    ) -> Result<(), StoreError> {
        let docs = current
            .iter()
            .map(|p| Document::from_record(p.key().doc_id(), p))
            .collect::<Result<Vec<_>, _>>()?;
        self.write_all(collections::LISTING_CURRENT, &docs)?;

        let kept: HashSet<String> = docs.iter().map(|d| d.id.clone()).collect();
        let vanished: Vec<String> = previous
            .iter()
            .map(|p| p.key().doc_id())
            .filter(|id| !kept.contains(id))
            .collect();
        if !vanished.is_empty() {
            let outcome = self
                .store
                .bulk_delete(collections::LISTING_CURRENT, &vanished)?;
            for (id, reason) in &outcome.failed {
                warn!("Delete of '{}' from listing_current failed: {}", id, reason);
            }
        }
        Ok(())
    }

    /// Recomputes per-entity presence from the new snapshot.
    fn rebuild_presence(
        &self,
        current: &[ListingPlacement],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rollup: BTreeMap<EntityId, ListingPresence> = BTreeMap::new();
        for placement in current {
            let presence = rollup
                .entry(placement.entity_id.clone())
                .or_insert_with(|| ListingPresence {
                    entity_id: placement.entity_id.clone(),
                    in_listing: true,
                    placements: 0,
                    best_position: None,
                    surfaces: Vec::new(),
                    updated_at: now,
                });
            presence.placements += 1;
            presence.best_position = Some(
                presence
                    .best_position
                    .map_or(placement.position, |best| best.min(placement.position)),
            );
            if !presence.surfaces.contains(&placement.surface) {
                presence.surfaces.push(placement.surface.clone());
            }
        }

        let listed = Filter::all().eq("in_listing", true);
        for doc in self.store.scroll_all(collections::LISTING_PRESENCE, &listed)? {
            let presence: ListingPresence = doc?.decode()?;
            if !rollup.contains_key(&presence.entity_id) {
                rollup.insert(
                    presence.entity_id.clone(),
                    ListingPresence {
                        in_listing: false,
                        placements: 0,
                        best_position: None,
                        surfaces: Vec::new(),
                        updated_at: now,
                        ..presence
                    },
                );
            }
        }

        let docs = rollup
            .values()
            .map(|presence| Document::from_record(presence.entity_id.as_str(), presence))
            .collect::<Result<Vec<_>, _>>()?;
        self.write_all(collections::LISTING_PRESENCE, &docs)
    }

    /// Adds entities seen for the first time to the catalog. Returns how many.
    fn register_entities(
        &self,
        current: &[ListingPlacement],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let listed: BTreeSet<&EntityId> = current.iter().map(|p| &p.entity_id).collect();
        let mut docs = Vec::new();
        for entity_id in listed {
            if self.store.get(collections::ENTITIES, entity_id.as_str())?.is_none() {
                let entry = CatalogEntry {
                    entity_id: entity_id.clone(),
                    registered_at: now,
                };
                docs.push(Document::from_record(entity_id.as_str(), &entry)?);
            }
        }
        if !docs.is_empty() {
            info!("Registering {} new entities", docs.len());
        }
        self.write_all(collections::ENTITIES, &docs)?;
        Ok(docs.len())
    }

    fn write_all(&self, collection: &str, docs: &[Document]) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }
        let outcome = self.store.bulk_upsert(collection, docs)?;
        for (id, reason) in &outcome.failed {
            warn!("Write of '{}' to '{}' failed: {}", id, collection, reason);
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for ListingPoller {
    fn name(&self) -> &str {
        "listing-poller"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<RunStats, TaskError> {
        self.poll(cancel).await.map(RunStats::from)
    }
}
