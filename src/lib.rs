pub mod sync;

// re-export the session types most callers need
pub use sync::{
    client::{BackendConfig, ClientConfig, TeamGoalsClient},
    error::{SyncError, SyncResult},
    goal::{Comment, Goal, GoalInput, GoalPatch, GoalStatus, GoalStore},
    listener::{EmptySyncListener, SyncListener},
    objective::{Objective, ObjectivePatch, ObjectiveStore},
    report::{build_report, Report},
    team::{Member, Team, TeamPatch, TeamStore},
};
