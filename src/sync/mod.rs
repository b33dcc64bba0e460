//! Client-side synchronization layer
//!
//! Three stores mirror the backend tables (team + members, objectives,
//! weekly goals + comments). Each applies its own writes optimistically once
//! the backend confirms them and folds the backend's change notifications
//! into the same snapshot; see [`reconcile`] for the fold rules.

pub mod backend;
pub mod client;
pub mod db;
pub mod error;
pub mod form;
pub mod goal;
pub mod listener;
pub mod objective;
pub mod reconcile;
pub mod report;
pub(crate) mod store;
pub mod team;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Backend, RestBackend, SqliteBackend, Subscription};
pub use client::{BackendConfig, ClientConfig, TeamGoalsClient};
pub use error::{SyncError, SyncResult};
pub use listener::{EmptySyncListener, SyncListener};
pub use reconcile::{ChangeEvent, ChangeKind, FoldOutcome, Record, ReplayBuffer, Snapshot};
pub use types::{Query, Row, SortOrder, StoreKind, Table};
