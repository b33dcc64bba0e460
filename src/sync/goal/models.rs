//! Weekly goal and comment models

use crate::sync::error::{require_text, SyncError, SyncResult};
use crate::sync::reconcile::Record;
use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Goal status; any value may follow any other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl GoalStatus {
    pub const ALL: [GoalStatus; 3] = [
        GoalStatus::NotStarted,
        GoalStatus::InProgress,
        GoalStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::NotStarted => "not_started",
            GoalStatus::InProgress => "in_progress",
            GoalStatus::Completed => "completed",
        }
    }

    /// Display label used by reports
    pub fn label(&self) -> &'static str {
        match self {
            GoalStatus::NotStarted => "Not Started",
            GoalStatus::InProgress => "In Progress",
            GoalStatus::Completed => "Completed",
        }
    }

    /// Chart colour of the status
    pub fn color(&self) -> &'static str {
        match self {
            GoalStatus::NotStarted => "#FF4136",
            GoalStatus::InProgress => "#FFDC00",
            GoalStatus::Completed => "#2ECC40",
        }
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GoalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match GoalStatus::ALL.iter().find(|status| status.as_str() == s) {
            Some(status) => Ok(*status),
            None => bail!("unknown goal status: {} (expected not_started, in_progress or completed)", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub goal_id: String,
    #[serde(rename = "comment")]
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Record for Comment {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub team_id: String,
    pub okr_id: String,
    pub team_member_id: String,
    pub description: String,
    pub status: GoalStatus,
    pub created_at: DateTime<Utc>,
    /// Not a column: comments are joined in locally, oldest first
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Goal {
    /// Adds or replaces a comment, keeping creation order.
    /// Returns false when the same comment was already attached.
    pub fn attach_comment(&mut self, comment: Comment) -> bool {
        match self.comments.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) if *existing == comment => return false,
            Some(existing) => *existing = comment,
            None => self.comments.push(comment),
        }
        self.comments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        true
    }

    pub fn detach_comment(&mut self, comment_id: &str) -> bool {
        let before = self.comments.len();
        self.comments.retain(|c| c.id != comment_id);
        self.comments.len() != before
    }
}

impl Record for Goal {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn scope(&self) -> Option<&str> {
        Some(&self.team_id)
    }
}

/// Caller input for a new goal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoalInput {
    pub description: String,
    pub team_member_id: String,
    pub okr_id: String,
}

impl GoalInput {
    pub fn validate(&self) -> SyncResult<()> {
        require_text("goal description", &self.description)?;
        require_text("team member", &self.team_member_id)?;
        require_text("OKR", &self.okr_id)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewGoal {
    pub team_id: String,
    pub okr_id: String,
    pub team_member_id: String,
    pub description: String,
    pub status: GoalStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GoalPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_member_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub okr_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<GoalStatus>,
}

impl GoalPatch {
    pub fn status(status: GoalStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.team_member_id.is_none()
            && self.okr_id.is_none()
            && self.status.is_none()
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.is_empty() {
            return Err(SyncError::Validation("goal update has no fields".to_string()));
        }
        if let Some(description) = &self.description {
            require_text("goal description", description)?;
        }
        if let Some(member) = &self.team_member_id {
            require_text("team member", member)?;
        }
        if let Some(okr) = &self.okr_id {
            require_text("OKR", okr)?;
        }
        Ok(())
    }
}

impl From<GoalInput> for GoalPatch {
    fn from(input: GoalInput) -> Self {
        Self {
            description: Some(input.description),
            team_member_id: Some(input.team_member_id),
            okr_id: Some(input.okr_id),
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewComment {
    pub goal_id: String,
    #[serde(rename = "comment")]
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalSnapshot {
    pub goals: Vec<Goal>,
    pub is_loading: bool,
    pub error: Option<String>,
}
