/// In-memory backing store.
///
/// `MemoryStore` keeps named tables of rows and a catalog of views that say
/// what each registered SQL text returns. It executes plain view queries and
/// delta statements produced by [`DeltaQuery`](crate::delta::DeltaQuery),
/// emulating the delta template: every current row is reported with its
/// content hash, and rows whose hash the caller already holds come back as
/// key + hash markers only.
///
/// Every mutation is published to the attached [`TableObserver`], which makes
/// the store a complete backend for the registry in tests, benches and the
/// command line tool.
///
/// # Example
///
/// ```ignore
/// let observer = TableObserver::new();
/// let store = MemoryStore::with_observer(observer.clone());
/// store.create_table("t", "id");
/// store.define_view("SELECT * FROM t WHERE id < $1", View::scan("t").filter(Filter::lt("id", "$1")));
/// store.insert("t", row)?;
/// ```
use crate::delta::DeltaQuery;
use crate::error::{LiveError, LiveResult};
use crate::executor::QueryExecutor;
use crate::extract::{SqlTableExtractor, TableExtractor};
use crate::notifier::{TableChange, TableObserver};
use crate::types::{HASH_FIELD, Params, Row};
use crate::view::View;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

#[derive(Debug, Clone)]
struct Table {
    key_field: String,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: DashMap<String, Table>,
    views: DashMap<String, View>,
    executions: AtomicU64,
    delta_executions: AtomicU64,
    failures: Mutex<Vec<String>>,
}

/// In-memory tables plus view catalog.
///
/// Cloning is cheap; clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
    observer: Option<TableObserver>,
}

impl MemoryStore {
    /// Create a store that publishes changes nowhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that publishes every mutation to `observer`.
    pub fn with_observer(observer: TableObserver) -> Self {
        Self {
            inner: Arc::new(StoreInner::default()),
            observer: Some(observer),
        }
    }

    /// The attached observer, if any.
    pub fn observer(&self) -> Option<&TableObserver> {
        self.observer.as_ref()
    }

    /// Create an empty table keyed by `key_field`. Existing tables are kept.
    pub fn create_table(&self, name: impl Into<String>, key_field: impl Into<String>) {
        self.inner.tables.entry(name.into()).or_insert_with(|| Table {
            key_field: key_field.into(),
            rows: Vec::new(),
        });
    }

    /// Declare what `sql` returns.
    pub fn define_view(&self, sql: &str, view: View) {
        self.inner.views.insert(normalize(sql).to_string(), view);
    }

    /// Insert a row. The key must not already exist.
    pub fn insert(&self, table: &str, row: Row) -> LiveResult<()> {
        {
            let mut entry = self.table_mut(table)?;
            let key = row.key(&entry.key_field);
            if entry.rows.iter().any(|r| r.key(&entry.key_field) == key) {
                return Err(LiveError::StoreError(format!(
                    "duplicate key {} in table '{}'",
                    key, table
                )));
            }
            entry.rows.push(row.clone());
        }
        self.publish(TableChange::insert(table, row));
        Ok(())
    }

    /// Replace the row with the same key. Returns the previous row.
    pub fn update(&self, table: &str, row: Row) -> LiveResult<Row> {
        let old = {
            let mut entry = self.table_mut(table)?;
            let key = row.key(&entry.key_field);
            let key_field = entry.key_field.clone();
            let slot = entry
                .rows
                .iter_mut()
                .find(|r| r.key(&key_field) == key)
                .ok_or_else(|| {
                    LiveError::NotFound(format!("row {} in table '{}'", key, table))
                })?;
            std::mem::replace(slot, row.clone())
        };
        self.publish(TableChange::update(table, old.clone(), row));
        Ok(old)
    }

    /// Delete the row with the given key value. Returns the deleted row.
    pub fn delete(&self, table: &str, key: &JsonValue) -> LiveResult<Row> {
        let old = {
            let mut entry = self.table_mut(table)?;
            let key_field = entry.key_field.clone();
            let position = entry
                .rows
                .iter()
                .position(|r| r.get(&key_field) == Some(key))
                .ok_or_else(|| {
                    LiveError::NotFound(format!("row {} in table '{}'", key, table))
                })?;
            entry.rows.remove(position)
        };
        self.publish(TableChange::delete(table, old.clone()));
        Ok(old)
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of statements executed so far.
    pub fn execution_count(&self) -> u64 {
        self.inner.executions.load(Ordering::SeqCst)
    }

    /// Number of delta statements executed so far.
    pub fn delta_execution_count(&self) -> u64 {
        self.inner.delta_executions.load(Ordering::SeqCst)
    }

    /// Make the next execution fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        if let Ok(mut failures) = self.inner.failures.lock() {
            failures.push(message.into());
        }
    }

    fn table_mut(
        &self,
        table: &str,
    ) -> LiveResult<dashmap::mapref::one::RefMut<'_, String, Table>> {
        self.inner
            .tables
            .get_mut(table)
            .ok_or_else(|| LiveError::StoreError(format!("table '{}' does not exist", table)))
    }

    fn publish(&self, change: TableChange) {
        if let Some(observer) = &self.observer {
            observer.publish(&change);
        }
    }

    fn take_failure(&self) -> Option<String> {
        let mut failures = self.inner.failures.lock().ok()?;
        if failures.is_empty() {
            None
        } else {
            Some(failures.remove(0))
        }
    }

    fn view(&self, sql: &str) -> LiveResult<View> {
        self.inner
            .views
            .get(normalize(sql))
            .map(|v| v.value().clone())
            .ok_or_else(|| LiveError::StoreError(format!("no view defined for query: {}", sql.trim())))
    }

    fn evaluate(&self, view: &View, params: &Params) -> LiveResult<Vec<Row>> {
        let table = self
            .inner
            .tables
            .get(&view.table)
            .ok_or_else(|| LiveError::StoreError(format!("table '{}' does not exist", view.table)))?;
        Ok(view.evaluate(&table.rows, params))
    }
}

#[async_trait]
impl QueryExecutor for MemoryStore {
    async fn execute(&self, sql: &str, params: &Params) -> LiveResult<Vec<Row>> {
        if let Some(message) = self.take_failure() {
            return Err(LiveError::StoreError(message));
        }
        self.inner.executions.fetch_add(1, Ordering::SeqCst);

        let Some(delta) = DeltaQuery::parse(sql) else {
            let view = self.view(sql)?;
            return self.evaluate(&view, params);
        };

        self.inner.delta_executions.fetch_add(1, Ordering::SeqCst);
        let view = self.view(delta.source())?;
        let (params, known) = delta.unbind(params);
        let key_field = delta.key_field();

        let rows = self
            .evaluate(&view, &params)?
            .into_iter()
            .map(|row| {
                let hash = row.content_hash();
                if known.contains(hash.as_str()) {
                    let key = row.get(key_field).cloned().unwrap_or(JsonValue::Null);
                    Row::new()
                        .with(key_field, key)
                        .with(HASH_FIELD, hash.as_str())
                } else {
                    row.with(HASH_FIELD, hash.as_str())
                }
            })
            .collect::<Vec<_>>();

        trace!(rows = rows.len(), "delta statement executed");
        Ok(rows)
    }
}

#[async_trait]
impl TableExtractor for MemoryStore {
    async fn tables(&self, query: &str, params: &Params) -> LiveResult<BTreeSet<String>> {
        match self.inner.views.get(normalize(query)) {
            Some(view) => Ok(BTreeSet::from([view.table.clone()])),
            None => SqlTableExtractor::new().tables(query, params).await,
        }
    }
}

fn normalize(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}
