//! Objective (OKR) models

use crate::sync::error::{require_text, SyncError, SyncResult};
use crate::sync::reconcile::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub team_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Completion in `[0, 1]`
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

impl Record for Objective {
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
pub struct NewObjective {
    pub team_id: String,
    pub title: String,
    pub description: Option<String>,
    pub progress: f64,
}

/// Partial objective update
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectivePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// `Some(None)` clears the description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl ObjectivePatch {
    pub fn progress(value: f64) -> Self {
        Self {
            progress: Some(value),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.progress.is_none()
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.is_empty() {
            return Err(SyncError::Validation("objective update has no fields".to_string()));
        }
        if let Some(title) = &self.title {
            require_text("objective title", title)?;
        }
        if let Some(progress) = self.progress {
            validate_progress(progress)?;
        }
        Ok(())
    }
}

/// Progress must be a finite number in `[0, 1]`
pub fn validate_progress(value: f64) -> SyncResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(SyncError::Validation(format!(
            "progress must be within [0, 1], got {}",
            value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectiveSnapshot {
    pub objectives: Vec<Objective>,
    pub is_loading: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bounds() {
        assert!(validate_progress(0.0).is_ok());
        assert!(validate_progress(0.37).is_ok());
        assert!(validate_progress(1.0).is_ok());
        assert!(validate_progress(-0.01).unwrap_err().is_validation());
        assert!(validate_progress(1.5).unwrap_err().is_validation());
        assert!(validate_progress(f64::NAN).unwrap_err().is_validation());
    }

    #[test]
    fn patch_validation() {
        assert!(ObjectivePatch::default().validate().is_err());
        let blank = ObjectivePatch {
            title: Some(" ".into()),
            ..Default::default()
        };
        assert!(blank.validate().unwrap_err().is_validation());
        assert!(ObjectivePatch::progress(0.25).validate().is_ok());
    }
}
