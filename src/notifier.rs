/// Change notification for live queries.
///
/// A change notifier watches a set of tables. Every change to one of them is
/// offered to the watch's trigger predicate; when the predicate accepts, the
/// notifier schedules a debounced invocation of the watch's fire callback.
///
/// [`TableObserver`] is the in-process implementation: whoever mutates the
/// tables publishes each change to it.
///
/// # Example
///
/// ```ignore
/// use live_delta::notifier::{TableChange, TableObserver};
///
/// let observer = TableObserver::new();
/// observer.publish(&TableChange::insert("users", row));
/// ```
use crate::error::{LiveError, LiveResult};
use crate::types::Row;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Predicate deciding whether a change matters to a watch.
pub type TriggerFn = Arc<dyn Fn(&TableChange) -> bool + Send + Sync>;

/// Debounced callback run after an accepted change.
pub type FireFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Type of change that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// A change to one row of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    /// Type of change.
    pub op: ChangeOp,
    /// The table affected.
    pub table: String,
    /// The row after the change (None for deletes).
    pub new_row: Option<Row>,
    /// The row before the change (None for inserts).
    pub old_row: Option<Row>,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

impl TableChange {
    /// Create an insert event.
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            op: ChangeOp::Insert,
            table: table.into(),
            new_row: Some(row),
            old_row: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an update event.
    pub fn update(table: impl Into<String>, old_row: Row, new_row: Row) -> Self {
        Self {
            op: ChangeOp::Update,
            table: table.into(),
            new_row: Some(new_row),
            old_row: Some(old_row),
            timestamp: Utc::now(),
        }
    }

    /// Create a delete event.
    pub fn delete(table: impl Into<String>, old_row: Row) -> Self {
        Self {
            op: ChangeOp::Delete,
            table: table.into(),
            new_row: None,
            old_row: Some(old_row),
            timestamp: Utc::now(),
        }
    }

    /// The most relevant row image: the new row, or the old one for deletes.
    pub fn row(&self) -> Option<&Row> {
        self.new_row.as_ref().or(self.old_row.as_ref())
    }
}

/// Options for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Debounce window between an accepted change and the fire callback.
    pub delay: Duration,
}

/// Handle to an installed watch.
#[async_trait]
pub trait WatchHandle: Send + Sync {
    /// Stop watching. Stopping twice is a no-op.
    async fn stop(&mut self) -> LiveResult<()>;
}

/// Source of debounced table change notifications.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Watch `tables`, calling `trigger` for each change and `on_fire` after
    /// the debounce window once a change was accepted.
    async fn watch(
        &self,
        tables: &BTreeSet<String>,
        trigger: TriggerFn,
        on_fire: FireFn,
        options: WatchOptions,
    ) -> LiveResult<Box<dyn WatchHandle>>;

    /// Release notifier-wide resources.
    async fn shutdown(&self) -> LiveResult<()> {
        Ok(())
    }
}

/// Unique identifier for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

struct Watch {
    id: WatchId,
    tables: BTreeSet<String>,
    trigger: TriggerFn,
    on_fire: FireFn,
    delay: Duration,
    armed: AtomicBool,
    active: AtomicBool,
}

struct ObserverInner {
    watches: DashMap<WatchId, Arc<Watch>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// In-process change notifier with per-watch debouncing.
///
/// Cloning is cheap; clones share the same watches.
#[derive(Clone)]
pub struct TableObserver {
    inner: Arc<ObserverInner>,
}

impl fmt::Debug for TableObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableObserver")
            .field("watches", &self.inner.watches.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TableObserver {
    /// Create an observer with no watches.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                watches: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Offer a change to every watch on its table.
    ///
    /// Triggers run synchronously, outside any observer lock. Returns the
    /// number of watches that accepted the change.
    pub fn publish(&self, change: &TableChange) -> usize {
        let candidates: Vec<Arc<Watch>> = self
            .inner
            .watches
            .iter()
            .filter(|entry| entry.value().tables.contains(&change.table))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut accepted = 0;
        for watch in candidates {
            if !watch.active.load(Ordering::SeqCst) {
                continue;
            }
            let hit = (watch.trigger)(change);
            trace!(watch = %watch.id, table = %change.table, op = ?change.op, hit, "trigger evaluated");
            if hit {
                accepted += 1;
                Self::arm(&watch);
            }
        }
        accepted
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.len()
    }

    /// Whether [`ChangeNotifier::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn arm(watch: &Arc<Watch>) {
        // At most one timer per watch; later changes ride on it.
        if watch.armed.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let watch = Arc::clone(watch);
                runtime.spawn(async move {
                    tokio::time::sleep(watch.delay).await;
                    watch.armed.store(false, Ordering::SeqCst);
                    if watch.active.load(Ordering::SeqCst) {
                        (watch.on_fire)().await;
                    }
                });
            }
            Err(_) => {
                watch.armed.store(false, Ordering::SeqCst);
                warn!(watch = %watch.id, "change published outside a tokio runtime, dropping");
            }
        }
    }
}

impl Default for TableObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeNotifier for TableObserver {
    async fn watch(
        &self,
        tables: &BTreeSet<String>,
        trigger: TriggerFn,
        on_fire: FireFn,
        options: WatchOptions,
    ) -> LiveResult<Box<dyn WatchHandle>> {
        if self.is_closed() {
            return Err(LiveError::NotifierError(
                "observer has been shut down".to_string(),
            ));
        }
        if tables.is_empty() {
            return Err(LiveError::NotifierError(
                "cannot watch an empty table set".to_string(),
            ));
        }

        let id = WatchId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let watch = Arc::new(Watch {
            id,
            tables: tables.clone(),
            trigger,
            on_fire,
            delay: options.delay,
            armed: AtomicBool::new(false),
            active: AtomicBool::new(true),
        });
        self.inner.watches.insert(id, Arc::clone(&watch));

        Ok(Box::new(ObserverWatchHandle {
            inner: Arc::clone(&self.inner),
            watch,
        }))
    }

    async fn shutdown(&self) -> LiveResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        for entry in self.inner.watches.iter() {
            entry.value().active.store(false, Ordering::SeqCst);
        }
        self.inner.watches.clear();
        Ok(())
    }
}

struct ObserverWatchHandle {
    inner: Arc<ObserverInner>,
    watch: Arc<Watch>,
}

#[async_trait]
impl WatchHandle for ObserverWatchHandle {
    async fn stop(&mut self) -> LiveResult<()> {
        if self.watch.active.swap(false, Ordering::SeqCst) {
            self.inner.watches.remove(&self.watch.id);
        }
        Ok(())
    }
}
