//! Objective (OKR) module
//!
//! - `api.rs`: typed access to the `okrs` table
//! - `models.rs`: objective, patch and snapshot types
//! - `service.rs`: ObjectiveStore

pub mod api;
pub mod models;
pub mod service;

pub use api::ObjectiveApi;
pub use models::{validate_progress, NewObjective, Objective, ObjectivePatch, ObjectiveSnapshot};
pub use service::ObjectiveStore;
