/// Per-query live state.
///
/// A `QueryInfo` exists once per distinct (query, parameters, key field)
/// registration. It owns the canonical rows, the subscribers sharing them,
/// and the notifier watch that tells it when to refresh.
///
/// State transitions:
///
/// ```text
/// Initializing -> Idle <-> RefreshPending -> Refreshing -> Idle ...
///                                   any state -> Stopped
/// ```
///
/// All flag and row mutations happen under one `std::sync::Mutex`, never
/// held across an await. A second, async mutex serializes refresh passes:
/// at most one fetch is in flight and callbacks for one pass are delivered
/// before the next pass starts. A pass clears the pending flag before it
/// fetches, so triggers that arrive during the fetch schedule exactly one
/// more pass instead of being lost.
///
/// Changes that arrive while no subscriber can claim them (before the first
/// one attaches, or while a joiner runs its own fetch) are kept and replayed
/// against the predicate of the subscriber that attaches next.
use crate::config::ObserverConfig;
use crate::delta::{DeltaQuery, KnownHashes};
use crate::diff::{RowsDiff, snapshot_diff};
use crate::error::{LiveError, LiveResult};
use crate::executor::QueryExecutor;
use crate::extract::TableExtractor;
use crate::notifier::{ChangeNotifier, FireFn, TableChange, TriggerFn, WatchHandle, WatchOptions};
use crate::subscriber::{DiffCallback, Snapshot, Subscriber, SubscriptionId};
use crate::types::{CachedRow, Params, QueryKey, Row};
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OnceCell, mpsc};

/// Lifecycle phase of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    /// Installing the watch and running the first fetch.
    Initializing,
    /// Canonical rows are current.
    Idle,
    /// A change matched and a refresh is owed.
    RefreshPending,
    /// A delta fetch is in flight.
    Refreshing,
    /// Terminal.
    Stopped,
}

/// Shared map of live queries, owned by the registry.
pub(crate) type QueryMap = DashMap<QueryKey, Arc<QueryInfo>>;

struct QueryState {
    phase: QueryPhase,
    pending: bool,
    rows: Snapshot,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    unclaimed: Vec<TableChange>,
    joining: usize,
}

impl QueryState {
    fn mark_pending(&mut self) {
        self.pending = true;
        if self.phase == QueryPhase::Idle {
            self.phase = QueryPhase::RefreshPending;
        }
    }

    fn recording(&self) -> bool {
        self.subscribers.is_empty() || self.joining > 0
    }

    /// Replay unclaimed changes against an attaching subscriber.
    ///
    /// Returns whether one of them matched, which leaves the subscriber
    /// dirty with a refresh owed.
    fn claim(&mut self, subscriber: &mut Subscriber) -> bool {
        let missed = self.unclaimed.iter().any(|change| (subscriber.trigger)(change));
        if self.joining == 0 {
            self.unclaimed.clear();
        }
        if missed {
            subscriber.triggered = true;
            self.mark_pending();
        }
        missed
    }

    fn settle(&mut self) {
        if self.phase != QueryPhase::Stopped {
            self.phase = if self.pending {
                QueryPhase::RefreshPending
            } else {
                QueryPhase::Idle
            };
        }
    }
}

/// Collaborators a query talks to.
#[derive(Clone)]
pub(crate) struct Backend {
    pub executor: Arc<dyn QueryExecutor>,
    pub extractor: Arc<dyn TableExtractor>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

struct Delivery {
    id: SubscriptionId,
    callback: DiffCallback,
    errors: mpsc::UnboundedSender<LiveError>,
    diff: RowsDiff,
}

pub(crate) struct QueryInfo {
    key: QueryKey,
    query: String,
    params: Params,
    key_field: String,
    delta: DeltaQuery,
    debounce: Duration,
    initial_cached: bool,
    backend: Backend,
    registry: Weak<QueryMap>,
    state: Mutex<QueryState>,
    refresh_lock: tokio::sync::Mutex<()>,
    watch: tokio::sync::Mutex<Option<Box<dyn WatchHandle>>>,
    init: OnceCell<()>,
}

impl fmt::Debug for QueryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("QueryInfo")
            .field("key", &self.key)
            .field("query", &self.query)
            .field("phase", &state.phase)
            .field("rows", &state.rows.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl QueryInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: QueryKey,
        query: String,
        params: Params,
        key_field: String,
        delta: DeltaQuery,
        config: &ObserverConfig,
        backend: Backend,
        registry: Weak<QueryMap>,
    ) -> Self {
        Self {
            key,
            query,
            params,
            key_field,
            delta,
            debounce: config.debounce,
            initial_cached: config.initial_cached,
            backend,
            registry,
            state: Mutex::new(QueryState {
                phase: QueryPhase::Initializing,
                pending: false,
                rows: Arc::new(Vec::new()),
                subscribers: BTreeMap::new(),
                unclaimed: Vec::new(),
                joining: 0,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            watch: tokio::sync::Mutex::new(None),
            init: OnceCell::new(),
        }
    }

    pub fn key(&self) -> QueryKey {
        self.key
    }

    pub fn phase(&self) -> QueryPhase {
        self.state().phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase() == QueryPhase::Stopped
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    pub fn has_subscriber(&self, id: SubscriptionId) -> bool {
        self.state().subscribers.contains_key(&id)
    }

    /// Public rows last delivered to a subscriber.
    pub fn subscriber_rows(&self, id: SubscriptionId) -> Vec<Arc<Row>> {
        self.state()
            .subscribers
            .get(&id)
            .map(|sub| sub.snapshot.iter().map(|c| Arc::clone(&c.row)).collect())
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, QueryState> {
        // A panicking predicate must not wedge the query.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the watch and run the first fetch, once.
    ///
    /// On failure the query is stopped; callers waiting on the same
    /// initialization then see `NotFound` and start over.
    pub async fn ensure_initialized(self: &Arc<Self>) -> LiveResult<()> {
        self.init
            .get_or_try_init(|| self.initialize())
            .await
            .map(|_| ())
    }

    async fn initialize(self: &Arc<Self>) -> LiveResult<()> {
        if self.is_stopped() {
            return Err(LiveError::NotFound(format!("live query {}", self.key)));
        }

        let tables = match self
            .backend
            .extractor
            .tables(&self.query, &self.params)
            .await
        {
            Ok(tables) => tables,
            Err(err) => {
                self.stop().await?;
                return Err(err);
            }
        };

        let weak = Arc::downgrade(self);
        let trigger: TriggerFn = Arc::new(move |change: &TableChange| {
            weak.upgrade()
                .map(|query| query.combined_trigger(change))
                .unwrap_or(false)
        });

        let weak = Arc::downgrade(self);
        let on_fire: FireFn = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(query) = weak.upgrade() {
                    // Failures were already reported to dirty subscribers.
                    let _ = query.refresh_pass(None).await;
                }
            }
            .boxed()
        });

        let options = WatchOptions {
            delay: self.debounce,
        };
        match self
            .backend
            .notifier
            .watch(&tables, trigger, on_fire, options)
            .await
        {
            Ok(handle) => *self.watch.lock().await = Some(handle),
            Err(err) => {
                self.stop().await?;
                return Err(err);
            }
        }

        let fetched = {
            let _guard = self.refresh_lock.lock().await;
            self.fetch().await
        };

        match fetched {
            Ok(rows) => {
                let mut state = self.state();
                if state.phase == QueryPhase::Stopped {
                    return Err(LiveError::NotFound(format!("live query {}", self.key)));
                }
                state.rows = Arc::new(rows);
                state.settle();
                tracing::debug!(
                    "Live query {} initialized over {:?} with {} rows",
                    self.key,
                    tables,
                    state.rows.len()
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Initial fetch of live query {} failed: {}", self.key, err);
                self.stop().await?;
                Err(err)
            }
        }
    }

    /// Offer a change to every subscriber that is not already dirty.
    ///
    /// Returns whether a refresh is owed.
    pub fn combined_trigger(&self, change: &TableChange) -> bool {
        let mut state = self.state();
        if state.phase == QueryPhase::Stopped {
            return false;
        }
        if state.recording() {
            state.unclaimed.push(change.clone());
        }

        let mut interested = false;
        for sub in state.subscribers.values_mut() {
            if sub.triggered {
                continue;
            }
            if (sub.trigger)(change) {
                tracing::trace!("{} interested in {:?} on {}", sub.id, change.op, change.table);
                sub.triggered = true;
                interested = true;
            }
        }

        if interested {
            state.mark_pending();
        }
        state.pending
    }

    /// Run one refresh pass if one is owed.
    ///
    /// A failure is returned to the caller and sent to the error channel of
    /// every other dirty subscriber; those stay dirty so the next change
    /// retries.
    pub async fn refresh_pass(self: &Arc<Self>, origin: Option<SubscriptionId>) -> LiveResult<()> {
        let _guard = self.refresh_lock.lock().await;

        // Flags are cleared up front so a change landing during the fetch
        // marks its subscriber again and is picked up by the next pass.
        let dirty: Vec<SubscriptionId> = {
            let mut state = self.state();
            if state.phase == QueryPhase::Stopped || !state.pending {
                return Ok(());
            }
            state.pending = false;
            state.phase = QueryPhase::Refreshing;
            state
                .subscribers
                .values_mut()
                .filter(|sub| sub.triggered)
                .map(|sub| {
                    sub.triggered = false;
                    sub.id
                })
                .collect()
        };

        let rows = match self.fetch().await {
            Ok(rows) => rows,
            Err(err) => {
                let mut state = self.state();
                for id in &dirty {
                    if let Some(sub) = state.subscribers.get_mut(id) {
                        sub.triggered = true;
                    }
                }
                if state.subscribers.values().any(|sub| sub.triggered) {
                    state.pending = true;
                }
                state.settle();
                for id in dirty.iter().filter(|id| Some(**id) != origin) {
                    if let Some(sub) = state.subscribers.get(id) {
                        sub.report(err.clone());
                    }
                }
                tracing::warn!("Refresh of live query {} failed: {}", self.key, err);
                return Err(err);
            }
        };

        let deliveries = {
            let mut state = self.state();
            if state.phase == QueryPhase::Stopped {
                return Ok(());
            }
            let deliveries = self.reconcile(&mut state, rows, &dirty);
            state.settle();
            tracing::debug!(
                "Refreshed live query {}: {} rows, {} diffs",
                self.key,
                state.rows.len(),
                deliveries.len()
            );
            deliveries
        };

        dispatch(deliveries);
        Ok(())
    }

    /// Mark a subscriber dirty and run a pass right away.
    pub async fn refresh_subscriber(self: &Arc<Self>, id: SubscriptionId) -> LiveResult<()> {
        {
            let mut state = self.state();
            if state.phase == QueryPhase::Stopped {
                return Err(LiveError::NotFound(format!("live query {}", self.key)));
            }
            let sub = state
                .subscribers
                .get_mut(&id)
                .ok_or_else(|| LiveError::NotFound(format!("subscription {}", id)))?;
            sub.triggered = true;
            state.mark_pending();
        }
        self.refresh_pass(Some(id)).await
    }

    /// Attach a subscriber.
    ///
    /// Fails with `NotFound` when the query stopped in the meantime so the
    /// registry can start over with a fresh query.
    pub async fn attach(self: &Arc<Self>, mut subscriber: Subscriber) -> LiveResult<()> {
        {
            let mut state = self.state();
            if state.phase == QueryPhase::Stopped {
                return Err(LiveError::NotFound(format!("live query {}", self.key)));
            }
            // The first subscriber takes the rows of the initial fetch as is.
            if state.subscribers.is_empty() || self.initial_cached {
                subscriber.snapshot = Arc::clone(&state.rows);
                if !state.subscribers.is_empty() {
                    // Rows may be stale: refresh on the next change to be sure.
                    subscriber.triggered = true;
                    state.mark_pending();
                }
                let missed = state.claim(&mut subscriber);
                tracing::debug!("{} joined live query {} from cache", subscriber.id, self.key);
                state.subscribers.insert(subscriber.id, subscriber);
                drop(state);
                if missed {
                    self.schedule_refresh();
                }
                return Ok(());
            }
            state.joining += 1;
        }

        let guard = self.refresh_lock.lock().await;
        let fetched = self.fetch().await;

        let (deliveries, missed) = {
            let mut state = self.state();
            state.joining -= 1;
            if state.phase == QueryPhase::Stopped {
                return Err(LiveError::NotFound(format!("live query {}", self.key)));
            }
            let rows = match fetched {
                Ok(rows) => rows,
                Err(err) => {
                    if state.joining == 0 {
                        state.unclaimed.clear();
                    }
                    return Err(err);
                }
            };
            let existing: Vec<SubscriptionId> = state.subscribers.keys().copied().collect();
            let deliveries = self.reconcile(&mut state, rows, &existing);
            subscriber.snapshot = Arc::clone(&state.rows);
            let missed = state.claim(&mut subscriber);
            tracing::debug!("{} joined live query {} after a fetch", subscriber.id, self.key);
            state.subscribers.insert(subscriber.id, subscriber);
            state.settle();
            (deliveries, missed)
        };

        dispatch(deliveries);
        drop(guard);
        if missed {
            self.schedule_refresh();
        }
        Ok(())
    }

    /// Run a pass in the background for a change a joiner missed.
    fn schedule_refresh(self: &Arc<Self>) {
        let query = Arc::clone(self);
        tokio::spawn(async move {
            // Failures were already reported to dirty subscribers.
            let _ = query.refresh_pass(None).await;
        });
    }

    /// Detach a subscriber, stopping the query when it was the last one.
    ///
    /// Once this returns the subscriber's callback is not invoked again.
    pub async fn remove_subscriber(self: &Arc<Self>, id: SubscriptionId) -> LiveResult<()> {
        let last = {
            let mut state = self.state();
            if state.phase == QueryPhase::Stopped || state.subscribers.remove(&id).is_none() {
                return Ok(());
            }
            tracing::debug!("{} left live query {}", id, self.key);
            if state.subscribers.is_empty() {
                state.phase = QueryPhase::Stopped;
                true
            } else {
                false
            }
        };

        if last {
            self.teardown().await
        } else {
            // Wait out a pass that may still be delivering to it.
            let _fence = self.refresh_lock.lock().await;
            Ok(())
        }
    }

    /// Stop the query. Stopping twice is a no-op.
    pub async fn stop(self: &Arc<Self>) -> LiveResult<()> {
        {
            let mut state = self.state();
            if state.phase == QueryPhase::Stopped {
                return Ok(());
            }
            state.phase = QueryPhase::Stopped;
        }
        self.teardown().await
    }

    async fn teardown(self: &Arc<Self>) -> LiveResult<()> {
        if let Some(queries) = self.registry.upgrade() {
            queries.remove_if(&self.key, |_, query| Arc::ptr_eq(query, self));
        }

        // No callback runs after this.
        let _fence = self.refresh_lock.lock().await;

        let mut result = Ok(());
        let handle = self.watch.lock().await.take();
        if let Some(mut handle) = handle {
            if let Err(err) = handle.stop().await {
                tracing::warn!("Failed to stop watch of live query {}: {}", self.key, err);
                result = Err(err);
            }
        }

        let detached = {
            let mut state = self.state();
            state.unclaimed.clear();
            std::mem::take(&mut state.subscribers)
        };
        tracing::debug!(
            "Live query {} stopped, {} subscribers detached",
            self.key,
            detached.len()
        );
        result
    }

    /// Run the delta statement and reconcile against the canonical rows.
    ///
    /// Rows whose hash is already cached come back as the cached value.
    async fn fetch(&self) -> LiveResult<Vec<Arc<CachedRow>>> {
        let prior = Arc::clone(&self.state().rows);
        let known = KnownHashes::from_hashes(prior.iter().map(|c| c.hash.clone()).collect());
        let params = self.delta.bind(&self.params, &known);

        let returned = self
            .backend
            .executor
            .execute(self.delta.sql(), &params)
            .await?;

        let cached: HashMap<&str, &Arc<CachedRow>> =
            prior.iter().map(|c| (c.hash.as_str(), c)).collect();

        let rows = returned
            .into_iter()
            .map(|row| {
                let (row, hash) = row.take_hash();
                let hash = hash.unwrap_or_else(|| row.content_hash());
                match cached.get(hash.as_str()) {
                    Some(existing) => Arc::clone(existing),
                    None => Arc::new(CachedRow {
                        key: row.key(&self.key_field),
                        hash,
                        row: Arc::new(row),
                    }),
                }
            })
            .collect();

        Ok(rows)
    }

    /// Replace the canonical rows and diff the given subscribers.
    fn reconcile(
        &self,
        state: &mut QueryState,
        rows: Vec<Arc<CachedRow>>,
        targets: &[SubscriptionId],
    ) -> Vec<Delivery> {
        let rows: Snapshot = Arc::new(rows);
        state.rows = Arc::clone(&rows);

        let mut deliveries = Vec::new();
        for id in targets {
            let Some(sub) = state.subscribers.get_mut(id) else {
                continue;
            };
            let diff = snapshot_diff(&sub.snapshot, &rows, &self.key_field);
            sub.snapshot = Arc::clone(&rows);
            if let Some(diff) = diff {
                deliveries.push(Delivery {
                    id: sub.id,
                    callback: Arc::clone(&sub.callback),
                    errors: sub.error_sender(),
                    diff,
                });
            }
        }
        deliveries
    }
}

fn dispatch(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        if let Err(err) = (delivery.callback)(&delivery.diff) {
            tracing::warn!("Diff callback of {} failed: {}", delivery.id, err);
            let _ = delivery.errors.send(LiveError::CallbackError {
                subscription: delivery.id.0,
                reason: err.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::notifier::TableObserver;
    use crate::view::{Filter, View};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUERY: &str = "SELECT * FROM t WHERE id < $1";

    fn row(value: serde_json::Value) -> Row {
        Row::try_from(value).unwrap()
    }

    fn setup() -> (MemoryStore, Arc<QueryInfo>, Arc<QueryMap>) {
        setup_with(|store| Arc::new(store))
    }

    fn setup_with(
        executor: impl FnOnce(MemoryStore) -> Arc<dyn QueryExecutor>,
    ) -> (MemoryStore, Arc<QueryInfo>, Arc<QueryMap>) {
        let observer = TableObserver::new();
        let store = MemoryStore::with_observer(observer.clone());
        store.create_table("t", "id");
        store.define_view(
            QUERY,
            View::scan("t").filter(Filter::lt("id", "$1")).order_by("id"),
        );
        store.insert("t", row(json!({"id": 1, "v": "a"}))).unwrap();
        store.insert("t", row(json!({"id": 2, "v": "b"}))).unwrap();

        let params = Params::from(json!([3]));
        let delta = DeltaQuery::build(QUERY, &params, "id").unwrap();
        let config = ObserverConfig::new()
            .key_field("id")
            .debounce(Duration::from_secs(3600));
        let backend = Backend {
            executor: executor(store.clone()),
            extractor: Arc::new(store.clone()),
            notifier: Arc::new(observer),
        };
        let map = Arc::new(QueryMap::new());
        let key = QueryKey::derive(QUERY, &params, "id");
        let info = Arc::new(QueryInfo::new(
            key,
            QUERY.to_string(),
            params,
            "id".to_string(),
            delta,
            &config,
            backend,
            Arc::downgrade(&map),
        ));
        map.insert(key, Arc::clone(&info));
        (store, info, map)
    }

    fn subscriber(
        id: u64,
        trigger: impl Fn(&TableChange) -> bool + Send + Sync + 'static,
        seen: Arc<StdMutex<Vec<RowsDiff>>>,
    ) -> (Subscriber, mpsc::UnboundedReceiver<LiveError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: DiffCallback = Arc::new(move |diff: &RowsDiff| {
            seen.lock().unwrap().push(diff.clone());
            Ok(())
        });
        (
            Subscriber::new(SubscriptionId(id), Arc::new(trigger), callback, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_initialize_fetches_once() {
        let (store, info, _map) = setup();
        assert_eq!(info.phase(), QueryPhase::Initializing);

        info.ensure_initialized().await.unwrap();
        info.ensure_initialized().await.unwrap();

        assert_eq!(info.phase(), QueryPhase::Idle);
        assert_eq!(store.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_marks_only_matching_subscribers() {
        let (_store, info, _map) = setup();
        info.ensure_initialized().await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, _ra) = subscriber(1, |c: &TableChange| c.op == crate::notifier::ChangeOp::Insert, seen.clone());
        let (b, _rb) = subscriber(2, |_: &TableChange| false, seen.clone());
        info.attach(a).await.unwrap();
        info.attach(b).await.unwrap();

        // Second subscriber joined from cache and is dirty
        assert_eq!(info.phase(), QueryPhase::RefreshPending);
        assert!(info.combined_trigger(&TableChange::delete("t", row(json!({"id": 1})))));
        assert_eq!(info.phase(), QueryPhase::RefreshPending);

        assert!(info.combined_trigger(&TableChange::insert("t", row(json!({"id": 0})))));
        assert_eq!(info.phase(), QueryPhase::RefreshPending);
        let state = info.state();
        assert!(state.subscribers[&SubscriptionId(1)].triggered);
        assert!(state.pending);
    }

    #[tokio::test]
    async fn test_refresh_pass_reuses_unchanged_rows() {
        let (store, info, _map) = setup();
        info.ensure_initialized().await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (sub, _rx) = subscriber(1, |_: &TableChange| true, seen.clone());
        info.attach(sub).await.unwrap();
        let before = info.subscriber_rows(SubscriptionId(1));

        store.update("t", row(json!({"id": 2, "v": "c"}))).unwrap();
        assert!(info.combined_trigger(&TableChange::insert("t", row(json!({"id": 9})))));
        info.refresh_pass(None).await.unwrap();

        let after = info.subscriber_rows(SubscriptionId(1));
        assert!(Arc::ptr_eq(&before[0], &after[0]));
        assert!(!Arc::ptr_eq(&before[1], &after[1]));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].changed.len(), 1);
        assert_eq!(info.phase(), QueryPhase::Idle);
    }

    #[tokio::test]
    async fn test_refresh_pass_without_pending_is_noop() {
        let (store, info, _map) = setup();
        info.ensure_initialized().await.unwrap();
        info.refresh_pass(None).await.unwrap();
        assert_eq!(store.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_stays_pending() {
        let (store, info, _map) = setup();
        info.ensure_initialized().await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (sub, mut rx) = subscriber(1, |_: &TableChange| true, seen.clone());
        info.attach(sub).await.unwrap();

        info.combined_trigger(&TableChange::insert("t", row(json!({"id": 0}))));
        store.fail_next("disk on fire");
        assert!(info.refresh_pass(None).await.is_err());

        assert_eq!(info.phase(), QueryPhase::RefreshPending);
        assert!(matches!(rx.try_recv(), Ok(LiveError::StoreError(_))));

        // Retry succeeds
        info.refresh_pass(None).await.unwrap();
        assert_eq!(info.phase(), QueryPhase::Idle);
    }

    /// Executor that blocks on a gate the test holds.
    struct GatedExecutor {
        store: MemoryStore,
        gate: Arc<tokio::sync::Mutex<()>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueryExecutor for GatedExecutor {
        async fn execute(&self, sql: &str, params: &Params) -> LiveResult<Vec<Row>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _open = self.gate.lock().await;
            self.store.execute(sql, params).await
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_reports_only_to_its_dirty_set() {
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let calls = Arc::new(AtomicUsize::new(0));
        let (store, info, _map) = {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            setup_with(move |store| {
                Arc::new(GatedExecutor {
                    store,
                    gate,
                    calls,
                })
            })
        };
        info.ensure_initialized().await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, mut ra) = subscriber(1, |c: &TableChange| c.op == crate::notifier::ChangeOp::Insert, seen.clone());
        let (b, mut rb) = subscriber(2, |c: &TableChange| c.op == crate::notifier::ChangeOp::Delete, seen.clone());
        info.attach(a).await.unwrap();
        info.attach(b).await.unwrap();
        // Clears the join-time dirty flag of the second subscriber
        info.refresh_pass(None).await.unwrap();
        let before = calls.load(Ordering::SeqCst);

        assert!(info.combined_trigger(&TableChange::insert("t", row(json!({"id": 0})))));
        store.fail_next("connection reset");

        let closed = gate.lock().await;
        let pass = tokio::spawn({
            let info = Arc::clone(&info);
            async move { info.refresh_pass(None).await }
        });
        while calls.load(Ordering::SeqCst) == before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Lands while the failing fetch is in flight
        assert!(info.combined_trigger(&TableChange::delete("t", row(json!({"id": 1})))));
        drop(closed);

        assert!(pass.await.unwrap().is_err());
        assert!(matches!(ra.try_recv(), Ok(LiveError::StoreError(_))));
        assert!(rb.try_recv().is_err());

        let state = info.state();
        assert!(state.subscribers[&SubscriptionId(1)].triggered);
        assert!(state.subscribers[&SubscriptionId(2)].triggered);
        assert_eq!(state.phase, QueryPhase::RefreshPending);
    }

    #[tokio::test]
    async fn test_change_before_first_subscriber_is_claimed() {
        let (_store, info, _map) = setup();
        info.ensure_initialized().await.unwrap();

        // Nobody can claim these yet
        assert!(!info.combined_trigger(&TableChange::insert("t", row(json!({"id": 0})))));
        assert!(!info.combined_trigger(&TableChange::delete("t", row(json!({"id": 9})))));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, _ra) = subscriber(1, |c: &TableChange| c.op == crate::notifier::ChangeOp::Insert, seen.clone());
        info.attach(a).await.unwrap();

        let state = info.state();
        assert!(state.subscribers[&SubscriptionId(1)].triggered);
        assert!(state.pending);
        assert!(state.unclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_unclaimed_changes_leave_subscriber_clean() {
        let (_store, info, _map) = setup();
        info.ensure_initialized().await.unwrap();
        info.combined_trigger(&TableChange::delete("t", row(json!({"id": 9}))));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, _ra) = subscriber(1, |c: &TableChange| c.op == crate::notifier::ChangeOp::Insert, seen);
        info.attach(a).await.unwrap();

        assert_eq!(info.phase(), QueryPhase::Idle);
        assert!(!info.state().subscribers[&SubscriptionId(1)].triggered);
    }

    #[tokio::test]
    async fn test_last_subscriber_stops_query() {
        let (_store, info, map) = setup();
        info.ensure_initialized().await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, _ra) = subscriber(1, |_: &TableChange| true, seen.clone());
        let (b, _rb) = subscriber(2, |_: &TableChange| true, seen.clone());
        info.attach(a).await.unwrap();
        info.attach(b).await.unwrap();

        info.remove_subscriber(SubscriptionId(1)).await.unwrap();
        assert!(!info.is_stopped());
        info.remove_subscriber(SubscriptionId(1)).await.unwrap();

        info.remove_subscriber(SubscriptionId(2)).await.unwrap();
        assert!(info.is_stopped());
        assert!(map.is_empty());

        let (c, _rc) = subscriber(3, |_: &TableChange| true, seen);
        assert!(matches!(info.attach(c).await, Err(LiveError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_initialization_stops_query() {
        let (store, info, map) = setup();
        store.fail_next("no route to host");

        let err = info.ensure_initialized().await.unwrap_err();
        assert!(matches!(err, LiveError::StoreError(_)));
        assert!(info.is_stopped());
        assert!(map.is_empty());
        assert_eq!(store.observer().unwrap().watch_count(), 0);
    }
}
