//! Snapshot diffing for ranked listings.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::records::{EventType, ListingEvent, ListingPlacement, PlacementKey};

/// Indexes a snapshot by placement key. The first placement of a key wins.
pub fn index(snapshot: &[ListingPlacement]) -> BTreeMap<PlacementKey, &ListingPlacement> {
    let mut by_key = BTreeMap::new();
    for placement in snapshot {
        by_key.entry(placement.key()).or_insert(placement);
    }
    by_key
}

/// Compares two full snapshots and returns one event per changed placement.
///
/// Placements are keyed by `(surface, panel, entity, region)`:
/// - key only in `previous`: REMOVED, with `previous_position`
/// - key only in `current`: ADDED, with `position`
/// - key in both at different positions: MOVED, with both
///
/// Events come out in key order, so the result is a pure function of the
/// two snapshots.
pub fn diff(
    previous: &[ListingPlacement],
    current: &[ListingPlacement],
    at: DateTime<Utc>,
) -> Vec<ListingEvent> {
    let before = index(previous);
    let after = index(current);
    let mut events = Vec::new();

    let event = |event_type, key: &PlacementKey, position, previous_position| ListingEvent {
        event_type,
        surface: key.surface.clone(),
        panel: key.panel.clone(),
        entity_id: key.entity_id.clone(),
        region: key.region.clone(),
        position,
        previous_position,
        timestamp: at,
    };

    for (key, old) in &before {
        match after.get(key) {
            None => events.push(event(EventType::Removed, key, None, Some(old.position))),
            Some(new) if new.position != old.position => events.push(event(
                EventType::Moved,
                key,
                Some(new.position),
                Some(old.position),
            )),
            Some(_) => {}
        }
    }
    for (key, new) in &after {
        if !before.contains_key(key) {
            events.push(event(EventType::Added, key, Some(new.position), None));
        }
    }

    events.sort_by(|a, b| {
        (&a.surface, &a.panel, &a.entity_id, &a.region)
            .cmp(&(&b.surface, &b.panel, &b.entity_id, &b.region))
    });
    events
}
