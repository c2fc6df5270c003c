//! Document filters.

use serde_json::Value;
use std::cmp::Ordering;

/// One condition on a top-level document field.
#[derive(Clone, Debug, PartialEq)]
pub enum Clause {
    /// Field equals value
    Eq(String, Value),
    /// `gte <= field < lt`, either bound optional
    Range {
        field: String,
        gte: Option<Value>,
        lt: Option<Value>,
    },
    /// Field is present and not null
    Exists(String),
}

/// Conjunction of clauses. The empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.to_string(), value.into()));
        self
    }

    pub fn range(
        mut self,
        field: &str,
        gte: Option<impl Into<Value>>,
        lt: Option<impl Into<Value>>,
    ) -> Self {
        self.clauses.push(Clause::Range {
            field: field.to_string(),
            gte: gte.map(Into::into),
            lt: lt.map(Into::into),
        });
        self
    }

    pub fn exists(mut self, field: &str) -> Self {
        self.clauses.push(Clause::Exists(field.to_string()));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(field, expected) => doc
                .get(field)
                .map_or(false, |v| compare(v, expected) == Some(Ordering::Equal)),
            Clause::Range { field, gte, lt } => {
                let Some(v) = doc.get(field) else {
                    return false;
                };
                let lower_ok = gte
                    .as_ref()
                    .map_or(true, |b| matches!(compare(v, b), Some(Ordering::Greater | Ordering::Equal)));
                let upper_ok = lt
                    .as_ref()
                    .map_or(true, |b| compare(v, b) == Some(Ordering::Less));
                lower_ok && upper_ok
            }
            Clause::Exists(field) => doc.get(field).map_or(false, |v| !v.is_null()),
        })
    }
}

/// Orders two JSON scalars of the same kind. Mixed kinds are incomparable.
///
/// Timestamps are stored as second-precision RFC 3339 UTC strings, so string
/// order is chronological order.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
