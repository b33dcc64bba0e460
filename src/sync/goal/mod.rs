//! Weekly goal module
//!
//! - `api.rs`: typed access to `weekly_goals` / `goal_comments`
//! - `models.rs`: goal, status, comment and patch types
//! - `service.rs`: GoalStore

pub mod api;
pub mod models;
pub mod service;

pub use api::GoalApi;
pub use models::{
    Comment, Goal, GoalInput, GoalPatch, GoalSnapshot, GoalStatus, NewComment, NewGoal,
};
pub use service::GoalStore;
