//! In-memory document store with operation tracing and failure injection.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::aggregate::{self, AggregateValue, Aggregation};
use super::{BulkOutcome, Document, Filter, ScrollIter, Store};
use crate::error::StoreError;

/// Record of a store operation, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Upsert { collection: String, id: String },
    BulkUpsert { collection: String, count: usize },
    Delete { collection: String, id: String },
    BulkDelete { collection: String, count: usize },
    Scroll { collection: String },
    Aggregate { collection: String },
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    collections: HashSet<String>,
    ids: HashSet<String>,
    aggregate_fields: HashSet<String>,
    aggregations: Vec<Aggregation>,
}

/// Thread-safe in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, BTreeMap<String, Value>>>>,
    operations: Arc<RwLock<Vec<StoreOp>>>,
    faults: Arc<RwLock<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().unavailable = unavailable;
    }

    /// Makes every call touching `collection` fail.
    pub fn fail_collection(&self, collection: &str) {
        self.faults.write().collections.insert(collection.to_string());
    }

    /// Makes writes of document `id` fail in any collection.
    pub fn fail_id(&self, id: &str) {
        self.faults.write().ids.insert(id.to_string());
    }

    /// Makes aggregations over `field` fail (numeric and top-hit value fields).
    pub fn fail_aggregate_field(&self, field: &str) {
        self.faults.write().aggregate_fields.insert(field.to_string());
    }

    /// Makes exactly this aggregation fail, whatever the collection or filter.
    pub fn fail_aggregation(&self, aggregation: Aggregation) {
        self.faults.write().aggregations.push(aggregation);
    }

    pub fn clear_faults(&self) {
        *self.faults.write() = Faults::default();
    }

    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.read().clone()
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.data.read().get(collection).map_or(0, |c| c.len())
    }

    /// All documents of a collection, ordered by id.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.data
            .read()
            .get(collection)
            .map(|c| {
                c.iter()
                    .map(|(id, body)| Document::new(id.clone(), body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check(&self, collection: &str) -> Result<(), StoreError> {
        let faults = self.faults.read();
        if faults.unavailable {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        if faults.collections.contains(collection) {
            return Err(StoreError::Query(format!("injected failure on '{}'", collection)));
        }
        Ok(())
    }

    fn id_fails(&self, id: &str) -> bool {
        self.faults.read().ids.contains(id)
    }

    fn record(&self, op: StoreOp) {
        self.operations.write().push(op);
    }
}

impl Store for MemoryStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check(collection)?;
        Ok(self
            .data
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|body| Document::new(id, body.clone())))
    }

    fn upsert(&self, collection: &str, id: &str, body: &Value) -> Result<(), StoreError> {
        self.check(collection)?;
        self.record(StoreOp::Upsert {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        if self.id_fails(id) {
            return Err(StoreError::Query(format!("injected failure on id '{}'", id)));
        }
        self.data
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), body.clone());
        Ok(())
    }

    fn bulk_upsert(&self, collection: &str, docs: &[Document]) -> Result<BulkOutcome, StoreError> {
        self.check(collection)?;
        self.record(StoreOp::BulkUpsert {
            collection: collection.to_string(),
            count: docs.len(),
        });

        let mut outcome = BulkOutcome::default();
        let mut data = self.data.write();
        let target = data.entry(collection.to_string()).or_default();
        for doc in docs {
            if self.id_fails(&doc.id) {
                outcome
                    .failed
                    .push((doc.id.clone(), "injected failure".to_string()));
                continue;
            }
            target.insert(doc.id.clone(), doc.body.clone());
            outcome.succeeded += 1;
        }
        Ok(outcome)
    }

    fn scroll_all<'a>(
        &'a self,
        collection: &str,
        filter: &Filter,
    ) -> Result<ScrollIter<'a>, StoreError> {
        self.check(collection)?;
        self.record(StoreOp::Scroll {
            collection: collection.to_string(),
        });
        let matching: Vec<Document> = self
            .data
            .read()
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, body)| filter.matches(body))
                    .map(|(id, body)| Document::new(id.clone(), body.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(matching.into_iter().map(Ok)))
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.check(collection)?;
        self.record(StoreOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(self
            .data
            .write()
            .get_mut(collection)
            .map_or(false, |c| c.remove(id).is_some()))
    }

    fn bulk_delete(&self, collection: &str, ids: &[String]) -> Result<BulkOutcome, StoreError> {
        self.check(collection)?;
        self.record(StoreOp::BulkDelete {
            collection: collection.to_string(),
            count: ids.len(),
        });

        let mut outcome = BulkOutcome::default();
        let mut data = self.data.write();
        let target = data.entry(collection.to_string()).or_default();
        for id in ids {
            if self.id_fails(id) {
                outcome.failed.push((id.clone(), "injected failure".to_string()));
                continue;
            }
            target.remove(id);
            outcome.succeeded += 1;
        }
        Ok(outcome)
    }

    fn aggregate(
        &self,
        collection: &str,
        filter: &Filter,
        aggregation: &Aggregation,
    ) -> Result<AggregateValue, StoreError> {
        self.check(collection)?;
        if self.faults.read().aggregations.contains(aggregation) {
            return Err(StoreError::Query(format!(
                "injected failure on {:?}",
                aggregation
            )));
        }
        let field = match aggregation {
            Aggregation::Max { field } | Aggregation::Min { field } | Aggregation::Avg { field } => {
                Some(field)
            }
            Aggregation::TopHit { value_field, .. } => Some(value_field),
            Aggregation::Terms { max_of, .. } => Some(max_of),
            Aggregation::Count => None,
        };
        if let Some(field) = field {
            if self.faults.read().aggregate_fields.contains(field) {
                return Err(StoreError::Query(format!(
                    "injected aggregation failure on '{}'",
                    field
                )));
            }
        }
        self.record(StoreOp::Aggregate {
            collection: collection.to_string(),
        });
        aggregate::evaluate(self.scroll_all(collection, filter)?, aggregation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_overwrites_by_id() {
        let store = MemoryStore::new();
        store.upsert("c", "a", &json!({"v": 1})).unwrap();
        store.upsert("c", "a", &json!({"v": 2})).unwrap();

        assert_eq!(store.count("c"), 1);
        assert_eq!(store.get("c", "a").unwrap().unwrap().body, json!({"v": 2}));
    }

    #[test]
    fn test_bulk_upsert_reports_partial_failures() {
        let store = MemoryStore::new();
        store.fail_id("b");

        let docs = vec![
            Document::new("a", json!({})),
            Document::new("b", json!({})),
            Document::new("c", json!({})),
        ];
        let outcome = store.bulk_upsert("c", &docs).unwrap();

        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "b");
        assert_eq!(store.count("c"), 2, "successful writes are kept");
    }

    #[test]
    fn test_scroll_filters_and_orders_by_id() {
        let store = MemoryStore::new();
        store.upsert("c", "2", &json!({"k": "x"})).unwrap();
        store.upsert("c", "1", &json!({"k": "x"})).unwrap();
        store.upsert("c", "3", &json!({"k": "y"})).unwrap();

        let ids: Vec<String> = store
            .scroll_all("c", &Filter::all().eq("k", "x"))
            .unwrap()
            .map(|d| d.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_unavailable_is_fatal() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.get("c", "a").unwrap_err();
        assert!(err.is_fatal());
    }
}
