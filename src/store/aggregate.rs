//! Aggregations evaluated over a scrolled collection.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::filter::compare;
use super::{Document, StoreError};

/// Aggregation request.
#[derive(Clone, Debug, PartialEq)]
pub enum Aggregation {
    /// Largest numeric value of `field`
    Max { field: String },
    /// Smallest numeric value of `field`
    Min { field: String },
    /// Mean of the numeric values of `field`
    Avg { field: String },
    /// Number of matching documents
    Count,
    /// `value_field` of the document with the greatest (or least) `sort_field`
    TopHit {
        sort_field: String,
        value_field: String,
        descending: bool,
    },
    /// Group by `field`, with the per-group maximum of `max_of`
    Terms { field: String, max_of: String },
}

impl Aggregation {
    pub fn max(field: &str) -> Self {
        Aggregation::Max {
            field: field.to_string(),
        }
    }

    pub fn min(field: &str) -> Self {
        Aggregation::Min {
            field: field.to_string(),
        }
    }

    pub fn avg(field: &str) -> Self {
        Aggregation::Avg {
            field: field.to_string(),
        }
    }

    pub fn latest(sort_field: &str, value_field: &str) -> Self {
        Aggregation::TopHit {
            sort_field: sort_field.to_string(),
            value_field: value_field.to_string(),
            descending: true,
        }
    }

    pub fn earliest(sort_field: &str, value_field: &str) -> Self {
        Aggregation::TopHit {
            sort_field: sort_field.to_string(),
            value_field: value_field.to_string(),
            descending: false,
        }
    }

    pub fn terms(field: &str, max_of: &str) -> Self {
        Aggregation::Terms {
            field: field.to_string(),
            max_of: max_of.to_string(),
        }
    }
}

/// One group of a terms aggregation.
#[derive(Clone, Debug, PartialEq)]
pub struct TermsBucket {
    pub key: String,
    pub doc_count: u64,
    pub max: Option<f64>,
}

/// Aggregation result.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregateValue {
    /// Numeric result; `None` when nothing matched
    Number(Option<f64>),
    Count(u64),
    /// Raw field value of the top hit; `None` when nothing matched
    Hit(Option<Value>),
    Buckets(Vec<TermsBucket>),
}

impl AggregateValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AggregateValue::Number(n) => *n,
            AggregateValue::Count(c) => Some(*c as f64),
            AggregateValue::Hit(v) => v.as_ref().and_then(Value::as_f64),
            AggregateValue::Buckets(_) => None,
        }
    }

    pub fn as_count(&self) -> u64 {
        match self {
            AggregateValue::Count(c) => *c,
            _ => 0,
        }
    }

    pub fn into_hit(self) -> Option<Value> {
        match self {
            AggregateValue::Hit(v) => v,
            _ => None,
        }
    }

    pub fn into_buckets(self) -> Vec<TermsBucket> {
        match self {
            AggregateValue::Buckets(b) => b,
            _ => Vec::new(),
        }
    }
}

/// Evaluates `aggregation` over `docs`. The first scroll error aborts.
pub fn evaluate<I>(docs: I, aggregation: &Aggregation) -> Result<AggregateValue, StoreError>
where
    I: Iterator<Item = Result<Document, StoreError>>,
{
    match aggregation {
        Aggregation::Max { field } => {
            let mut best: Option<f64> = None;
            for doc in docs {
                if let Some(v) = number(&doc?.body, field) {
                    best = Some(best.map_or(v, |b| b.max(v)));
                }
            }
            Ok(AggregateValue::Number(best))
        }
        Aggregation::Min { field } => {
            let mut best: Option<f64> = None;
            for doc in docs {
                if let Some(v) = number(&doc?.body, field) {
                    best = Some(best.map_or(v, |b| b.min(v)));
                }
            }
            Ok(AggregateValue::Number(best))
        }
        Aggregation::Avg { field } => {
            let (mut sum, mut count) = (0.0, 0u64);
            for doc in docs {
                if let Some(v) = number(&doc?.body, field) {
                    sum += v;
                    count += 1;
                }
            }
            Ok(AggregateValue::Number(if count == 0 {
                None
            } else {
                Some(sum / count as f64)
            }))
        }
        Aggregation::Count => {
            let mut count = 0u64;
            for doc in docs {
                doc?;
                count += 1;
            }
            Ok(AggregateValue::Count(count))
        }
        Aggregation::TopHit {
            sort_field,
            value_field,
            descending,
        } => {
            let mut top: Option<(Value, Value)> = None;
            for doc in docs {
                let doc = doc?;
                let (Some(sort), Some(value)) =
                    (doc.body.get(sort_field), doc.body.get(value_field))
                else {
                    continue;
                };
                let wins = match &top {
                    None => true,
                    Some((current, _)) => {
                        let ord = compare(sort, current);
                        if *descending {
                            ord == Some(Ordering::Greater)
                        } else {
                            ord == Some(Ordering::Less)
                        }
                    }
                };
                if wins {
                    top = Some((sort.clone(), value.clone()));
                }
            }
            Ok(AggregateValue::Hit(top.map(|(_, v)| v)))
        }
        Aggregation::Terms { field, max_of } => {
            let mut groups: BTreeMap<String, (u64, Option<f64>)> = BTreeMap::new();
            for doc in docs {
                let doc = doc?;
                let Some(key) = doc.body.get(field).and_then(Value::as_str) else {
                    continue;
                };
                let entry = groups.entry(key.to_string()).or_insert((0, None));
                entry.0 += 1;
                if let Some(v) = number(&doc.body, max_of) {
                    entry.1 = Some(entry.1.map_or(v, |b: f64| b.max(v)));
                }
            }
            Ok(AggregateValue::Buckets(
                groups
                    .into_iter()
                    .map(|(key, (doc_count, max))| TermsBucket {
                        key,
                        doc_count,
                        max,
                    })
                    .collect(),
            ))
        }
    }
}

fn number(body: &Value, field: &str) -> Option<f64> {
    body.get(field).and_then(Value::as_f64).filter(|v| v.is_finite())
}
