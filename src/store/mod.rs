//! Document store used for samples, listings, summaries and control state.
//!
//! The store is a collection/id keyed JSON document store:
//! - **Upsert by id**: every write is idempotent
//! - **Scroll**: lazy, page-by-page iteration over a filtered collection
//! - **Aggregate**: max/min/avg/count/top-hit/terms over a filtered collection
//!
//! Two implementations are provided: [`SqliteStore`] for durable deployments
//! and [`MemoryStore`] for tests and ephemeral runs.

pub mod aggregate;
pub mod bulk;
pub mod filter;
pub mod memory;
pub mod sqlite;

pub use aggregate::{AggregateValue, Aggregation, TermsBucket};
pub use bulk::{BulkWriter, WriteStats};
pub use filter::{Clause, Filter};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

/// Collection names.
pub mod collections {
    pub const SAMPLES: &str = "samples";
    pub const DAILY: &str = "daily";
    pub const ENTITIES: &str = "entities";
    pub const TIERS: &str = "tiers";
    pub const LISTING_CURRENT: &str = "listing_current";
    pub const LISTING_EVENTS: &str = "listing_events";
    pub const LISTING_PRESENCE: &str = "listing_presence";
    pub const SUMMARIES: &str = "summaries";
    pub const CONTROL: &str = "control";
}

/// A stored document with its id.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Serializes a record into a document.
    pub fn from_record<T: Serialize>(id: impl Into<String>, record: &T) -> Result<Self, StoreError> {
        Ok(Self::new(id, serde_json::to_value(record)?))
    }

    /// Deserializes the body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Result of a bulk upsert or delete. Successful ids are never rolled back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub succeeded: usize,
    /// (id, reason) for every document that was not written
    pub failed: Vec<(String, String)>,
}

/// Lazy sequence of documents produced by [`Store::scroll_all`].
pub type ScrollIter<'a> = Box<dyn Iterator<Item = Result<Document, StoreError>> + Send + 'a>;

/// Storage collaborator.
///
/// Implementations must be safe to share between tasks; every method takes
/// `&self`.
pub trait Store: Send + Sync {
    /// Fetches one document by id.
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Inserts or replaces one document.
    fn upsert(&self, collection: &str, id: &str, body: &Value) -> Result<(), StoreError>;

    /// Inserts or replaces many documents. Per-document failures are reported,
    /// not raised; an `Err` means the whole batch could not be attempted.
    fn bulk_upsert(&self, collection: &str, docs: &[Document]) -> Result<BulkOutcome, StoreError>;

    /// Iterates every document matching `filter`, ordered by id.
    fn scroll_all<'a>(&'a self, collection: &str, filter: &Filter)
        -> Result<ScrollIter<'a>, StoreError>;

    fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    fn bulk_delete(&self, collection: &str, ids: &[String]) -> Result<BulkOutcome, StoreError>;

    /// Aggregates over the documents matching `filter`.
    fn aggregate(
        &self,
        collection: &str,
        filter: &Filter,
        aggregation: &Aggregation,
    ) -> Result<AggregateValue, StoreError> {
        aggregate::evaluate(self.scroll_all(collection, filter)?, aggregation)
    }
}

/// Loads and decodes a typed record.
pub fn get_record<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    store
        .get(collection, id)?
        .map(|doc| doc.decode())
        .transpose()
}

/// Serializes and upserts a typed record.
pub fn put_record<T: Serialize>(
    store: &dyn Store,
    collection: &str,
    id: &str,
    record: &T,
) -> Result<(), StoreError> {
    store.upsert(collection, id, &serde_json::to_value(record)?)
}
