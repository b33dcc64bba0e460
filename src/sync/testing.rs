//! Test helpers: logger setup and a fault-injecting backend

use crate::sync::backend::{Backend, SqliteBackend, Subscription};
use crate::sync::listener::SyncListener;
use crate::sync::types::{Query, Row, StoreKind, Table};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

static INIT_LOGGER: Once = Once::new();

pub(crate) fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        // crate debug on, sqlx statement logging off
        let filter_layer = EnvFilter::new("info,teamgoals_sdk_core_rust=debug,sqlx=warn");

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_test_writer();

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

/// Embedded backend whose writes can be made to fail on demand
pub(crate) struct FlakyBackend {
    pub inner: SqliteBackend,
    fail_writes: AtomicBool,
}

impl FlakyBackend {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            inner: SqliteBackend::in_memory().await?,
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, op: &str, table: Table) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("injected failure: {} on {}", op, table);
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        self.inner.select(table, query).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row> {
        self.check("insert", table)?;
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<()> {
        self.check("update", table)?;
        self.inner.update(table, id, patch).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        self.check("delete", table)?;
        self.inner.delete(table, id).await
    }

    async fn subscribe(&self, table: Table) -> Result<Subscription> {
        self.inner.subscribe(table).await
    }
}

/// Embedded backend where another session writes while a select is in flight
///
/// The select reads its rows first; the queued rows are then inserted (and
/// published) before the stale result is handed back.
pub(crate) struct InterleavedBackend {
    pub inner: SqliteBackend,
    pending: Mutex<Vec<(Table, Row)>>,
}

impl InterleavedBackend {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            inner: SqliteBackend::in_memory().await?,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Queues `row` for insertion right after the next select of `table`
    pub fn insert_during_select(&self, table: Table, row: Row) {
        self.pending.lock().unwrap().push((table, row));
    }
}

#[async_trait]
impl Backend for InterleavedBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        let rows = self.inner.select(table, query).await?;
        let due: Vec<Row> = {
            let mut pending = self.pending.lock().unwrap();
            let (due, rest): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *pending).into_iter().partition(|(t, _)| *t == table);
            *pending = rest;
            due.into_iter().map(|(_, row)| row).collect()
        };
        if !due.is_empty() {
            for row in due {
                self.inner.insert(table, row).await?;
            }
            // let the subscription fold the insert before the result lands
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row> {
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<()> {
        self.inner.update(table, id, patch).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        self.inner.delete(table, id).await
    }

    async fn subscribe(&self, table: Table) -> Result<Subscription> {
        self.inner.subscribe(table).await
    }
}

/// Listener that records every notification
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub successes: Mutex<Vec<String>>,
    pub failures: Mutex<Vec<String>>,
    pub changes: Mutex<Vec<StoreKind>>,
}

impl RecordingListener {
    pub fn successes(&self) -> Vec<String> {
        self.successes.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncListener for RecordingListener {
    async fn on_success(&self, message: String) {
        self.successes.lock().unwrap().push(message);
    }

    async fn on_failure(&self, message: String, _error: String) {
        self.failures.lock().unwrap().push(message);
    }

    async fn on_store_changed(&self, store: StoreKind) {
        self.changes.lock().unwrap().push(store);
    }
}

/// Polls `check` until it holds, for state driven by subscription tasks
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
