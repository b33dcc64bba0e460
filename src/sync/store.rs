//! Plumbing shared by the three stores: lifecycle, notifications and the
//! tasks that pump change subscriptions into a store's fold.

use crate::sync::backend::{Backend, Subscription};
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::listener::SyncListener;
use crate::sync::reconcile::ChangeEvent;
use crate::sync::types::{StoreKind, Table};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receiver side of a change subscription
#[async_trait]
pub(crate) trait ChangeSink: Send + Sync + 'static {
    fn core(&self) -> &StoreCore;

    async fn apply_change(&self, event: ChangeEvent);
}

pub(crate) const CHANGE_FEED_ENDED: &str = "Change feed ended";

/// Forwards every event of `subscription` to `sink` until either side goes away.
///
/// A feed that ends while the store is still open is recorded as the store's
/// error: the snapshot stops following the backend from that point on.
pub(crate) fn spawn_pump<S: ChangeSink>(sink: Weak<S>, mut subscription: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        let table = subscription.table();
        while let Some(event) = subscription.recv().await {
            let Some(sink) = sink.upgrade() else {
                debug!("[Sync] store behind {} dropped", table);
                return;
            };
            sink.apply_change(event).await;
        }
        let Some(sink) = sink.upgrade() else { return };
        if sink.core().is_closed() {
            debug!("[Sync] change stream for {} ended", table);
            return;
        }
        let err = SyncError::Backend(format!("change feed for {} closed, snapshot is no longer live", table));
        sink.core().record_error(CHANGE_FEED_ENDED, &err).await;
    })
}

/// A store scoped by the active team
#[async_trait]
pub(crate) trait ScopedStore: ChangeSink {
    /// Drops the current scope and loads `team_id` (`None`: no active team)
    async fn rescope(self: Arc<Self>, team_id: Option<String>);
}

/// Re-targets `store` every time the active team changes
pub(crate) fn spawn_scope_watch<S: ScopedStore>(
    store: Weak<S>,
    mut scope: watch::Receiver<Option<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while scope.changed().await.is_ok() {
            let team_id = scope.borrow_and_update().clone();
            let Some(store) = store.upgrade() else { break };
            if store.core().is_closed() {
                break;
            }
            info!("[Sync] active team changed to {:?}", team_id);
            store.rescope(team_id).await;
        }
    })
}

/// Opens one subscription per table and pumps each into `sink`
pub(crate) async fn subscribe_tables<S: ChangeSink>(
    core: &StoreCore,
    backend: &dyn Backend,
    sink: &Arc<S>,
    tables: &[Table],
) -> anyhow::Result<()> {
    for table in tables {
        let subscription = backend.subscribe(*table).await?;
        core.track(spawn_pump(Arc::downgrade(sink), subscription)).await;
    }
    Ok(())
}

pub(crate) struct StoreCore {
    kind: StoreKind,
    tag: &'static str,
    listener: Arc<dyn SyncListener>,
    closed: AtomicBool,
    last_error: RwLock<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StoreCore {
    pub fn new(kind: StoreKind, tag: &'static str, listener: Arc<dyn SyncListener>) -> Self {
        Self {
            kind,
            tag,
            listener,
            closed: AtomicBool::new(false),
            last_error: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        }
    }

    pub fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ContextMisuse(format!(
                "{} store used after shutdown",
                self.kind
            )));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Records the error and surfaces the failure notification
    pub async fn fail<T>(&self, message: &str, err: SyncError) -> SyncResult<T> {
        error!("[{}] ❌ {}: {}", self.tag, message, err);
        *self.last_error.write().await = Some(err.to_string());
        self.listener
            .on_failure(message.to_string(), err.to_string())
            .await;
        Err(err)
    }

    /// Records a failure that is not tied to a command (fetch / refresh)
    pub async fn record_error(&self, message: &str, err: &SyncError) {
        error!("[{}] ❌ {}: {}", self.tag, message, err);
        *self.last_error.write().await = Some(err.to_string());
        self.listener
            .on_failure(message.to_string(), err.to_string())
            .await;
    }

    pub async fn succeed(&self, message: &str) {
        info!("[{}] ✅ {}", self.tag, message);
        self.listener.on_success(message.to_string()).await;
        self.listener.on_store_changed(self.kind).await;
    }

    pub async fn changed(&self) {
        self.listener.on_store_changed(self.kind).await;
    }

    pub async fn clear_error(&self) {
        *self.last_error.write().await = None;
    }

    pub async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    pub async fn set_watcher(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.watcher.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stops every pump task; their subscriptions are dropped with them
    pub async fn stop_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("[{}] shutdown called twice", self.tag);
            return;
        }
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        self.stop_tasks().await;
        info!("[{}] closed", self.tag);
    }
}

impl Drop for StoreCore {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{init_test_logger, RecordingListener};
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    struct CountingSink {
        core: StoreCore,
        applied: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl ChangeSink for CountingSink {
        fn core(&self) -> &StoreCore {
            &self.core
        }

        async fn apply_change(&self, _event: ChangeEvent) {
            *self.applied.lock().unwrap() += 1;
        }
    }

    fn sink() -> (Arc<CountingSink>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let sink = Arc::new(CountingSink {
            core: StoreCore::new(StoreKind::Objectives, "TestStore", listener.clone()),
            applied: std::sync::Mutex::new(0),
        });
        (sink, listener)
    }

    fn event() -> ChangeEvent {
        let row = json!({ "id": "okr-1", "team_id": "team-1", "title": "Ship" });
        ChangeEvent::insert(Table::Okrs, row.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn ended_feed_is_recorded_on_an_open_store() {
        init_test_logger();
        let (sink, listener) = sink();
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, _close_rx) = oneshot::channel();
        let pump = spawn_pump(Arc::downgrade(&sink), Subscription::new(Table::Okrs, rx, close_tx));

        tx.send(event()).unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(*sink.applied.lock().unwrap(), 1);
        let error = sink.core.last_error().await.expect("feed end recorded");
        assert!(error.contains("okrs"), "{}", error);
        assert_eq!(listener.failures(), vec![CHANGE_FEED_ENDED.to_string()]);
    }

    #[tokio::test]
    async fn ended_feed_after_shutdown_is_not_an_error() {
        init_test_logger();
        let (sink, listener) = sink();
        sink.core.close().await;
        let (tx, rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let (close_tx, _close_rx) = oneshot::channel();
        let pump = spawn_pump(Arc::downgrade(&sink), Subscription::new(Table::Okrs, rx, close_tx));

        drop(tx);
        pump.await.unwrap();

        assert!(sink.core.last_error().await.is_none());
        assert!(listener.failures().is_empty());
    }
}
