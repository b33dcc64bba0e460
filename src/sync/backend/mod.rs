//! Backend collaborator: table reads, row mutations and change subscriptions
//!
//! Two implementations ship with the crate: [`RestBackend`] for the hosted
//! database (HTTP for rows, WebSocket for change notifications) and
//! [`SqliteBackend`], an embedded database with an in-process change feed.

pub mod realtime;
pub mod rest;
pub mod sqlite;

use crate::sync::reconcile::ChangeEvent;
use crate::sync::types::{Query, Row, Table};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub use realtime::RealtimeChannel;
pub use rest::RestBackend;
pub use sqlite::SqliteBackend;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Reads rows matching `query`
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>>;

    /// Inserts one row and returns it as stored (server-assigned id / created_at)
    async fn insert(&self, table: Table, row: Row) -> Result<Row>;

    /// Patches the row with `id`; an unknown id is not an error
    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<()>;

    async fn delete(&self, table: Table, id: &str) -> Result<()>;

    /// Opens a standing subscription to insert/update/delete events of `table`
    async fn subscribe(&self, table: Table) -> Result<Subscription>;
}

/// A standing change subscription on one table
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) signals the
/// producer to stop.
pub struct Subscription {
    table: Table,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    close: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(
        table: Table,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        close: oneshot::Sender<()>,
    ) -> Self {
        Self {
            table,
            events,
            close: Some(close),
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Next change notification, `None` once the producer has stopped
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.close_channel();
    }

    fn close_channel(&mut self) {
        if let Some(close) = self.close.take() {
            debug!("[Subscription] unsubscribing from {}", self.table);
            let _ = close.send(());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close_channel();
    }
}
