//! Team and member models

use crate::sync::reconcile::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known id of the single team this application works with
pub const DEFAULT_TEAM_ID: &str = "00000000-0000-0000-0000-000000000001";
pub const DEFAULT_TEAM_NAME: &str = "Demo Team";
pub const DEFAULT_TEAM_EMOJI: &str = "👥";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IconKind {
    Emoji,
    Image,
}

/// Team icon: an emoji or an image url
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamIcon {
    pub kind: IconKind,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub icon_type: IconKind,
    #[serde(default)]
    pub icon_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Team {
    pub fn icon(&self) -> TeamIcon {
        TeamIcon {
            kind: self.icon_type,
            value: self.icon_value.clone(),
        }
    }
}

impl Record for Team {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Insert payload for the team row
#[derive(Debug, Clone, Serialize)]
pub struct NewTeam {
    pub id: String,
    pub name: String,
    pub icon_type: IconKind,
    pub icon_value: Option<String>,
}

impl NewTeam {
    /// The team created when the well-known id is not found
    pub fn default_team(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: DEFAULT_TEAM_NAME.to_string(),
            icon_type: IconKind::Emoji,
            icon_value: Some(DEFAULT_TEAM_EMOJI.to_string()),
        }
    }
}

/// Partial team update; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeamPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_type: Option<IconKind>,
    /// `Some(None)` clears the icon value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_value: Option<Option<String>>,
}

impl TeamPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.icon_type.is_none() && self.icon_value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Record for Member {
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

#[derive(Debug, Clone, Serialize)]
pub struct NewMember {
    pub team_id: String,
    pub name: String,
}

/// Read model handed to the UI
#[derive(Debug, Clone, Serialize)]
pub struct TeamSnapshot {
    pub team: Option<Team>,
    pub members: Vec<Member>,
    pub is_loading: bool,
    pub error: Option<String>,
}
