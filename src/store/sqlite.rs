//! SQLite-backed document store.
//!
//! All collections share one table:
//! ```text
//! documents(collection TEXT, id TEXT, body TEXT, PRIMARY KEY (collection, id))
//! ```
//! Scrolling is keyset-paginated by id, so a scan never holds the connection
//! lock between pages and writers can interleave with long sweeps.
//!
//! Filter clauses on plain field names are evaluated by SQLite through
//! `json_extract`, backed by expression indexes on `entity_id` and
//! `timestamp`. Rows SQLite returns are still checked with
//! [`Filter::matches`], which stays the authority on matching.

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use super::filter::Clause;
use super::{BulkOutcome, Document, Filter, ScrollIter, Store};
use crate::error::StoreError;

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Fields every time-series query filters on.
const INDEXES: [(&str, &str); 2] = [
    (
        "idx_documents_entity_time",
        "collection, json_extract(body, '$.entity_id'), json_extract(body, '$.timestamp')",
    ),
    (
        "idx_documents_time",
        "collection, json_extract(body, '$.timestamp')",
    ),
];

/// Durable document store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    page_size: usize,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl SqliteStore {
    /// Opens (or creates) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create store directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("Failed to open sqlite db: {}", e)))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::Unavailable(format!("Failed to enable WAL: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("Failed to open sqlite db: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )",
            [],
        )
        .map_err(|e| StoreError::Unavailable(format!("Failed to create documents table: {}", e)))?;

        for (name, columns) in INDEXES {
            conn.execute(
                &format!("CREATE INDEX IF NOT EXISTS {} ON documents ({})", name, columns),
                [],
            )
            .map_err(|e| StoreError::Unavailable(format!("Failed to create index {}: {}", name, e)))?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Overrides the number of rows fetched per scroll page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fetch_page(
        &self,
        collection: &str,
        filter: &Filter,
        after: Option<&str>,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let (conditions, mut values) = sql_conditions(filter);
        let sql = format!(
            "SELECT id, body FROM documents
             WHERE collection = ? AND id > ?{}
             ORDER BY id
             LIMIT ?",
            conditions
        );
        values.insert(0, SqlValue::Text(collection.to_string()));
        values.insert(1, SqlValue::Text(after.unwrap_or("").to_string()));
        values.push(SqlValue::Integer(self.page_size as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Value>(1)?))
        })?;
        let mut page = Vec::with_capacity(self.page_size);
        for row in rows {
            page.push(row?);
        }
        Ok(page)
    }
}

impl Store for SqliteStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock();
        let body = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get::<_, Value>(0),
            )
            .optional()?;
        Ok(body.map(|body| Document::new(id, body)))
    }

    fn upsert(&self, collection: &str, id: &str, body: &Value) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
            params![collection, id, body],
        )?;
        Ok(())
    }

    fn bulk_upsert(&self, collection: &str, docs: &[Document]) -> Result<BulkOutcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = BulkOutcome::default();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
            )?;
            for doc in docs {
                match stmt.execute(params![collection, doc.id, doc.body]) {
                    Ok(_) => outcome.succeeded += 1,
                    Err(e) => outcome.failed.push((doc.id.clone(), e.to_string())),
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    fn scroll_all<'a>(
        &'a self,
        collection: &str,
        filter: &Filter,
    ) -> Result<ScrollIter<'a>, StoreError> {
        Ok(Box::new(Scroll {
            store: self,
            collection: collection.to_string(),
            filter: filter.clone(),
            after: None,
            page: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(removed > 0)
    }

    fn bulk_delete(&self, collection: &str, ids: &[String]) -> Result<BulkOutcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = BulkOutcome::default();
        {
            let mut stmt =
                tx.prepare_cached("DELETE FROM documents WHERE collection = ?1 AND id = ?2")?;
            for id in ids {
                match stmt.execute(params![collection, id]) {
                    Ok(_) => outcome.succeeded += 1,
                    Err(e) => outcome.failed.push((id.clone(), e.to_string())),
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }
}

/// Translates the clauses SQLite can evaluate into `AND ...` conditions and
/// their bound values. Clauses it cannot express are left to `Filter::matches`.
fn sql_conditions(filter: &Filter) -> (String, Vec<SqlValue>) {
    let mut sql = String::new();
    let mut values = Vec::new();

    for clause in &filter.clauses {
        match clause {
            Clause::Eq(field, expected) => {
                if let (Some(path), Some(value)) = (json_path(field), sql_value(expected)) {
                    sql.push_str(&format!(" AND {} = ?", path));
                    values.push(value);
                }
            }
            Clause::Range { field, gte, lt } => {
                let Some(path) = json_path(field) else {
                    continue;
                };
                if let Some(value) = gte.as_ref().and_then(sql_value) {
                    sql.push_str(&format!(" AND {} >= ?", path));
                    values.push(value);
                }
                if let Some(value) = lt.as_ref().and_then(sql_value) {
                    sql.push_str(&format!(" AND {} < ?", path));
                    values.push(value);
                }
            }
            Clause::Exists(field) => {
                if let Some(path) = json_path(field) {
                    sql.push_str(&format!(" AND {} IS NOT NULL", path));
                }
            }
        }
    }
    (sql, values)
}

/// `json_extract` of a top-level field, written literally so it matches the
/// index expressions. Only plain identifiers are inlined.
fn json_path(field: &str) -> Option<String> {
    let plain = !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    plain.then(|| format!("json_extract(body, '$.{}')", field))
}

/// SQLite value that compares like the JSON scalar does in `filter::compare`.
fn sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        // json_extract yields 1 and 0 for JSON booleans
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Keyset-paginated scan over one collection.
struct Scroll<'a> {
    store: &'a SqliteStore,
    collection: String,
    filter: Filter,
    after: Option<String>,
    page: VecDeque<Document>,
    exhausted: bool,
}

impl Iterator for Scroll<'_> {
    type Item = Result<Document, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(doc) = self.page.pop_front() {
                return Some(Ok(doc));
            }
            if self.exhausted {
                return None;
            }

            let rows = match self.store.fetch_page(
                &self.collection,
                &self.filter,
                self.after.as_deref(),
            ) {
                Ok(rows) => rows,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            };
            if rows.len() < self.store.page_size {
                self.exhausted = true;
            }
            if let Some((last_id, _)) = rows.last() {
                self.after = Some(last_id.clone());
            }
            self.page.extend(
                rows.into_iter()
                    .filter(|(_, body)| self.filter.matches(body))
                    .map(|(id, body)| Document::new(id, body)),
            );
        }
    }
}
