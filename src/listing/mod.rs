//! Ranked-listing change detection.
//!
//! [`ListingPoller`] fetches the full snapshot of every (surface, panel,
//! region) list, and [`diff`] turns consecutive snapshots into ADDED, REMOVED
//! and MOVED events. The poller keeps three derived collections current:
//!
//! - `listing_current`: one document per placement key, replaced every poll
//! - `listing_events`: append-only event log
//! - `listing_presence`: per-entity "listed anywhere" rollup

pub mod differ;
pub mod poller;

pub use differ::diff;
pub use poller::{ListingPoller, PollStats};
