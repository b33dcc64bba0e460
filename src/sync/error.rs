//! Store-boundary error taxonomy

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Remote call failed (network, permission, constraint violation)
    #[error("backend error: {0}")]
    Backend(String),

    /// Caller-supplied input is missing required fields or out of range
    #[error("validation error: {0}")]
    Validation(String),

    /// Store used outside its active scope (torn down, or no active team)
    #[error("context misuse: {0}")]
    ContextMisuse(String),
}

impl SyncError {
    pub(crate) fn backend(err: anyhow::Error) -> Self {
        SyncError::Backend(format!("{:#}", err))
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, SyncError::Backend(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation(_))
    }

    pub fn is_context_misuse(&self) -> bool {
        matches!(self, SyncError::ContextMisuse(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Rejects blank required text fields
pub(crate) fn require_text(field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(SyncError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("insert into okrs");
        let err = SyncError::backend(err);
        assert!(err.is_backend());
        assert_eq!(
            err.to_string(),
            "backend error: insert into okrs: connection refused"
        );
    }

    #[test]
    fn blank_text_is_rejected() {
        assert!(require_text("name", "  ").unwrap_err().is_validation());
        assert!(require_text("name", "Alice").is_ok());
    }
}
