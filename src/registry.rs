/// Live query registry.
///
/// The registry deduplicates registrations: identical query text, parameters
/// and key field share one [`QueryInfo`](crate::query_info) with one watch
/// and one fetch, while each registration gets its own subscriber, diff
/// stream and error channel.
///
/// # Example
///
/// ```ignore
/// use live_delta::prelude::*;
///
/// let observer = TableObserver::new();
/// let store = Arc::new(MemoryStore::with_observer(observer.clone()));
/// let registry = QueryRegistry::new(store.clone(), store, Arc::new(observer), ObserverConfig::new())?;
///
/// let mut handle = registry
///     .register("SELECT * FROM t WHERE id < $1", json!([3]), |_| true, |diff| {
///         println!("{} added", diff.added.len());
///         Ok(())
///     })
///     .await?;
///
/// handle.stop().await?;
/// registry.shutdown().await?;
/// ```
use crate::config::{ObserverConfig, RegisterOptions};
use crate::delta::DeltaQuery;
use crate::diff::RowsDiff;
use crate::error::{BoxError, LiveError, LiveResult};
use crate::executor::QueryExecutor;
use crate::extract::TableExtractor;
use crate::notifier::{ChangeNotifier, TableChange, TriggerFn};
use crate::query_info::{Backend, QueryInfo, QueryMap, QueryPhase};
use crate::subscriber::{DiffCallback, Subscriber, SubscriptionId};
use crate::types::{Params, QueryKey, Row};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

struct RegistryInner {
    queries: Arc<QueryMap>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    config: ObserverConfig,
    backend: Backend,
}

/// Registry of live queries.
///
/// Cloning is cheap; clones share the same queries.
#[derive(Clone)]
pub struct QueryRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("queries", &self.inner.queries.len())
            .field("config", &self.inner.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl QueryRegistry {
    /// Create a registry over the given collaborators.
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        extractor: Arc<dyn TableExtractor>,
        notifier: Arc<dyn ChangeNotifier>,
        config: ObserverConfig,
    ) -> LiveResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                queries: Arc::new(QueryMap::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                config,
                backend: Backend {
                    executor,
                    extractor,
                    notifier,
                },
            }),
        })
    }

    /// Registry-wide settings.
    pub fn config(&self) -> &ObserverConfig {
        &self.inner.config
    }

    /// Register a live query with the default options.
    pub async fn register<T, C>(
        &self,
        query: &str,
        params: impl Into<Params>,
        trigger: T,
        callback: C,
    ) -> LiveResult<LiveQueryHandle>
    where
        T: Fn(&TableChange) -> bool + Send + Sync + 'static,
        C: Fn(&RowsDiff) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register_with(query, params, RegisterOptions::new(), trigger, callback)
            .await
    }

    /// Register a live query.
    ///
    /// Joins the live query for the same (query, params, key field) if one
    /// exists, otherwise creates it and runs the initial fetch. Initial
    /// failures are returned here and leave nothing behind.
    pub async fn register_with<T, C>(
        &self,
        query: &str,
        params: impl Into<Params>,
        options: RegisterOptions,
        trigger: T,
        callback: C,
    ) -> LiveResult<LiveQueryHandle>
    where
        T: Fn(&TableChange) -> bool + Send + Sync + 'static,
        C: Fn(&RowsDiff) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        if self.is_shut_down() {
            return Err(LiveError::invalid("registry has been shut down"));
        }
        if query.trim().is_empty() {
            return Err(LiveError::invalid("query must not be empty"));
        }

        let params = params.into();
        let key_field = options
            .key_field
            .unwrap_or_else(|| self.inner.config.key_field.clone());
        let delta = DeltaQuery::build(query, &params, &key_field)?;
        let key = QueryKey::derive(query, &params, &key_field);

        let trigger: TriggerFn = Arc::new(trigger);
        let callback: DiffCallback = Arc::new(callback);

        loop {
            let info = Arc::clone(
                self.inner
                    .queries
                    .entry(key)
                    .or_insert_with(|| {
                        tracing::debug!("Creating live query {} for {}", key, query.trim());
                        Arc::new(QueryInfo::new(
                            key,
                            query.to_string(),
                            params.clone(),
                            key_field.clone(),
                            delta.clone(),
                            &self.inner.config,
                            self.inner.backend.clone(),
                            Arc::downgrade(&self.inner.queries),
                        ))
                    })
                    .value(),
            );

            match info.ensure_initialized().await {
                Ok(()) => {}
                Err(LiveError::NotFound(_)) => {
                    self.forget(&info);
                    continue;
                }
                Err(err) => {
                    self.forget(&info);
                    return Err(err);
                }
            }

            let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
            let (errors_tx, errors_rx) = mpsc::unbounded_channel();
            let subscriber =
                Subscriber::new(id, Arc::clone(&trigger), Arc::clone(&callback), errors_tx);

            match info.attach(subscriber).await {
                Ok(()) => {}
                Err(LiveError::NotFound(_)) => {
                    self.forget(&info);
                    continue;
                }
                Err(err) => return Err(err),
            }

            let handle = LiveQueryHandle {
                id,
                key,
                info,
                errors: errors_rx,
                stopped: AtomicBool::new(false),
            };

            // Lost a race with shutdown.
            if self.is_shut_down() {
                handle.stop().await?;
                return Err(LiveError::invalid("registry has been shut down"));
            }
            return Ok(handle);
        }
    }

    /// Stop every live query concurrently, then shut the notifier down.
    ///
    /// Calling this twice is a no-op.
    pub async fn shutdown(&self) -> LiveResult<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queries: Vec<Arc<QueryInfo>> = self
            .inner
            .queries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tracing::debug!("Shutting down registry with {} live queries", queries.len());

        let results = futures::future::join_all(queries.iter().map(|query| query.stop())).await;
        self.inner.queries.clear();

        let notifier = self.inner.backend.notifier.shutdown().await;
        results.into_iter().collect::<LiveResult<Vec<()>>>()?;
        notifier
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Number of live queries.
    pub fn query_count(&self) -> usize {
        self.inner.queries.len()
    }

    /// Number of subscribers on the live query for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        let query = self.inner.queries.get(key).map(|entry| Arc::clone(entry.value()));
        query.map(|q| q.subscriber_count()).unwrap_or(0)
    }

    fn forget(&self, info: &Arc<QueryInfo>) {
        self.inner
            .queries
            .remove_if(&info.key(), |_, query| Arc::ptr_eq(query, info));
    }
}

/// Handle to one registration.
///
/// Dropping the handle does not stop the subscription; call
/// [`stop`](Self::stop) or shut the registry down.
pub struct LiveQueryHandle {
    id: SubscriptionId,
    key: QueryKey,
    info: Arc<QueryInfo>,
    errors: mpsc::UnboundedReceiver<LiveError>,
    stopped: AtomicBool,
}

impl fmt::Debug for LiveQueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryHandle")
            .field("id", &self.id)
            .field("query", &self.key)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LiveQueryHandle {
    /// The subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Key of the live query this handle is attached to.
    pub fn query_key(&self) -> QueryKey {
        self.key
    }

    /// Detach this subscription. The live query stops with its last
    /// subscriber. Stopping twice is a no-op.
    pub async fn stop(&self) -> LiveResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.info.remove_subscriber(self.id).await
    }

    /// Mark this subscription dirty and refresh now, whatever its predicate
    /// says.
    pub async fn refresh(&self) -> LiveResult<()> {
        if self.is_stopped() {
            return Err(LiveError::NotFound(format!("subscription {}", self.id)));
        }
        self.info.refresh_subscriber(self.id).await
    }

    /// Rows as of the last diff delivered to this subscription.
    pub fn current_rows(&self) -> Vec<Arc<Row>> {
        self.info.subscriber_rows(self.id)
    }

    /// Whether the subscription is detached, by [`stop`](Self::stop) or
    /// because its live query stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
            || self.info.phase() == QueryPhase::Stopped
            || !self.info.has_subscriber(self.id)
    }

    /// Wait for the next background error. Returns `None` once the
    /// subscription is detached and every error has been read.
    pub async fn next_error(&mut self) -> Option<LiveError> {
        self.errors.recv().await
    }

    /// Next background error, if one is queued.
    pub fn try_next_error(&mut self) -> Option<LiveError> {
        self.errors.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::notifier::TableObserver;
    use crate::view::{Filter, View};
    use serde_json::json;
    use std::time::Duration;

    const QUERY: &str = "SELECT * FROM t WHERE id < $1";

    fn setup() -> (MemoryStore, QueryRegistry) {
        let observer = TableObserver::new();
        let store = MemoryStore::with_observer(observer.clone());
        store.create_table("t", "id");
        store.define_view(QUERY, View::scan("t").filter(Filter::lt("id", "$1")));
        let shared = Arc::new(store.clone());
        let registry = QueryRegistry::new(
            shared.clone(),
            shared,
            Arc::new(observer),
            ObserverConfig::new()
                .key_field("id")
                .debounce(Duration::from_millis(10)),
        )
        .unwrap();
        (store, registry)
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let (_store, registry) = setup();
        let err = registry
            .register("   ", (), |_| true, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::InvalidArgument { .. }));

        let err = registry
            .register_with(
                QUERY,
                json!([3]),
                RegisterOptions::new().key_field("bad key"),
                |_| true,
                |_| Ok(()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::InvalidArgument { .. }));
        assert_eq!(registry.query_count(), 0);
    }

    #[tokio::test]
    async fn test_register_deduplicates() {
        let (store, registry) = setup();
        let a = registry.register(QUERY, json!([3]), |_| true, |_| Ok(())).await.unwrap();
        let b = registry.register(QUERY, json!([3]), |_| true, |_| Ok(())).await.unwrap();

        assert_eq!(a.query_key(), b.query_key());
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.query_count(), 1);
        assert_eq!(registry.subscriber_count(&a.query_key()), 2);
        assert_eq!(store.execution_count(), 1);

        let c = registry.register(QUERY, json!([4]), |_| true, |_| Ok(())).await.unwrap();
        assert_ne!(a.query_key(), c.query_key());
        assert_eq!(registry.query_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_store, registry) = setup();
        let handle = registry.register(QUERY, json!([3]), |_| true, |_| Ok(())).await.unwrap();

        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        assert!(handle.is_stopped());
        assert_eq!(registry.query_count(), 0);
        assert!(matches!(handle.refresh().await, Err(LiveError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_register_after_shutdown() {
        let (_store, registry) = setup();
        let handle = registry.register(QUERY, json!([3]), |_| true, |_| Ok(())).await.unwrap();

        registry.shutdown().await.unwrap();
        registry.shutdown().await.unwrap();
        assert!(registry.is_shut_down());
        assert!(handle.is_stopped());

        let err = registry
            .register(QUERY, json!([3]), |_| true, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_initial_failure_leaves_nothing_behind() {
        let (store, registry) = setup();
        store.fail_next("timeout");

        let err = registry
            .register(QUERY, json!([3]), |_| true, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::StoreError(_)));
        assert_eq!(registry.query_count(), 0);
        assert_eq!(store.observer().unwrap().watch_count(), 0);
    }
}
