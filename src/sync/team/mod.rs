//! Team module
//!
//! Module layout:
//! - `api.rs`: typed access to the `teams` / `team_members` tables
//! - `models.rs`: team, member and patch types
//! - `service.rs`: TeamStore

pub mod api;
pub mod models;
pub mod service;

pub use api::TeamApi;
pub use models::{
    IconKind, Member, NewMember, NewTeam, Team, TeamIcon, TeamPatch, TeamSnapshot,
    DEFAULT_TEAM_EMOJI, DEFAULT_TEAM_ID, DEFAULT_TEAM_NAME,
};
pub use service::TeamStore;
