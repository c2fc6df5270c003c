//! Tier assignments and the board collectors read them from.
//!
//! A classification run produces one complete [`TierSnapshot`]. The board
//! swaps snapshots wholesale, so readers see either the old or the new
//! assignment and never a mix of both.

pub mod classifier;

pub use classifier::TierClassifier;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::StoreError;
use crate::records::TierAssignment;
use crate::store::{collections, get_record, put_record, Store};
use crate::types::{ts_secs, EntityId, Tier};

/// Document id of the persisted snapshot in the `tiers` collection.
pub const CURRENT_SNAPSHOT_ID: &str = "current";

/// Complete partition of the known catalog.
///
/// Hot and Warm keep rank order; Cold is sorted by entity id, which is the
/// stable order the rotation relies on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub hot: Vec<EntityId>,
    pub warm: Vec<EntityId>,
    pub cold: Vec<EntityId>,
    #[serde(default, with = "ts_secs::option")]
    pub classified_at: Option<DateTime<Utc>>,
}

impl TierSnapshot {
    pub fn members(&self, tier: Tier) -> &[EntityId] {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    pub fn tier_of(&self, entity_id: &EntityId) -> Option<Tier> {
        Tier::all()
            .into_iter()
            .find(|tier| self.members(*tier).contains(entity_id))
    }

    /// Total number of classified entities.
    pub fn len(&self) -> usize {
        self.hot.len() + self.warm.len() + self.cold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One assignment per entity.
    pub fn assignments(&self) -> Vec<TierAssignment> {
        let classified_at = self.classified_at.unwrap_or_else(Utc::now);
        Tier::all()
            .into_iter()
            .flat_map(|tier| {
                self.members(tier).iter().map(move |id| TierAssignment {
                    entity_id: id.clone(),
                    tier,
                    classified_at,
                })
            })
            .collect()
    }
}

/// Latest tier snapshot, shared between the classifier and the collectors.
#[derive(Debug, Default)]
pub struct TierBoard {
    current: RwLock<Arc<TierSnapshot>>,
}

impl TierBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores the last persisted snapshot. A missing or unreadable document
    /// leaves the board empty until the first classification.
    pub fn load(store: &dyn Store) -> Self {
        let board = Self::new();
        match get_record::<TierSnapshot>(store, collections::TIERS, CURRENT_SNAPSHOT_ID) {
            Ok(Some(snapshot)) => {
                info!(
                    "Restored tier snapshot: {} hot, {} warm, {} cold",
                    snapshot.hot.len(),
                    snapshot.warm.len(),
                    snapshot.cold.len()
                );
                board.replace(snapshot);
            }
            Ok(None) => info!("No persisted tier snapshot, starting empty"),
            Err(e) => warn!("Failed to restore tier snapshot: {}", e),
        }
        board
    }

    pub fn snapshot(&self) -> Arc<TierSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Members of one tier, in board order.
    pub fn members(&self, tier: Tier) -> Vec<EntityId> {
        self.snapshot().members(tier).to_vec()
    }

    pub fn replace(&self, snapshot: TierSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Persists the snapshot and then publishes it.
    pub fn publish(&self, store: &dyn Store, snapshot: TierSnapshot) -> Result<(), StoreError> {
        put_record(store, collections::TIERS, CURRENT_SNAPSHOT_ID, &snapshot)?;
        self.replace(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ids(raw: &[&str]) -> Vec<EntityId> {
        raw.iter().map(|r| EntityId::parse(r).unwrap()).collect()
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = TierSnapshot {
            hot: ids(&["a"]),
            warm: ids(&["b"]),
            cold: ids(&["c", "d"]),
            classified_at: None,
        };
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.tier_of(&EntityId::parse("d").unwrap()), Some(Tier::Cold));
        assert_eq!(snapshot.tier_of(&EntityId::parse("z").unwrap()), None);
        assert_eq!(snapshot.assignments().len(), 4);
    }

    #[test]
    fn test_publish_persists_and_reloads() {
        let store = MemoryStore::new();
        let board = TierBoard::new();
        assert!(board.snapshot().is_empty());

        let snapshot = TierSnapshot {
            hot: ids(&["a"]),
            warm: vec![],
            cold: ids(&["b"]),
            classified_at: Some(Utc::now()),
        };
        board.publish(&store, snapshot.clone()).unwrap();
        assert_eq!(board.members(Tier::Hot), ids(&["a"]));

        let restored = TierBoard::load(&store);
        assert_eq!(restored.members(Tier::Cold), ids(&["b"]));
    }

    #[test]
    fn test_failed_publish_keeps_previous_snapshot() {
        let store = MemoryStore::new();
        let board = TierBoard::new();
        board.replace(TierSnapshot {
            hot: ids(&["a"]),
            ..Default::default()
        });

        store.set_unavailable(true);
        let result = board.publish(&store, TierSnapshot::default());
        assert!(result.is_err());
        assert_eq!(board.members(Tier::Hot), ids(&["a"]));
    }
}
