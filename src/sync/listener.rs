//! Store listener callbacks

use crate::sync::types::StoreKind;
use async_trait::async_trait;

/// Callbacks the UI layer registers to receive notifications and re-render
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// A command completed, `message` is the user-facing success text
    async fn on_success(&self, message: String);

    /// A command failed, `message` is the user-facing failure text
    async fn on_failure(&self, message: String, error: String);

    /// The snapshot of `store` changed (command or change notification)
    async fn on_store_changed(&self, store: StoreKind);
}

/// Default listener (no-op)
pub struct EmptySyncListener;

#[async_trait]
impl SyncListener for EmptySyncListener {
    async fn on_success(&self, _message: String) {}
    async fn on_failure(&self, _message: String, _error: String) {}
    async fn on_store_changed(&self, _store: StoreKind) {}
}
