//! Domain errors

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;

/// External system a [`DomainError::Collaborator`] originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collaborator {
    Telephony,
    Persistence,
    Messaging,
    Completion,
}

impl Collaborator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collaborator::Telephony => "telephony",
            Collaborator::Persistence => "persistence",
            Collaborator::Messaging => "messaging",
            Collaborator::Completion => "completion",
        }
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// Missing or malformed required field, rejected before any collaborator call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Provider credentials absent at call-initiation time
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{collaborator} collaborator failed: {message}")]
    Collaborator {
        collaborator: Collaborator,
        message: String,
    },

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Max call duration reached while the operation was waiting on a collaborator
    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn telephony(message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: Collaborator::Telephony,
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: Collaborator::Persistence,
            message: message.into(),
        }
    }

    pub fn messaging(message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: Collaborator::Messaging,
            message: message.into(),
        }
    }

    pub fn completion(message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: Collaborator::Completion,
            message: message.into(),
        }
    }

    pub fn is_collaborator(&self) -> bool {
        matches!(self, DomainError::Collaborator { .. })
    }

    /// Short machine-readable label, used for metrics and API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation",
            DomainError::Configuration(_) => "configuration",
            DomainError::Collaborator { .. } => "collaborator",
            DomainError::CircuitOpen(_) => "circuit_open",
            DomainError::SessionNotFound(_) => "session_not_found",
            DomainError::SessionExpired(_) => "session_expired",
            DomainError::InvalidStateTransition(_) => "invalid_state_transition",
            DomainError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_error_display() {
        let err = DomainError::telephony("placement refused");
        assert_eq!(
            err.to_string(),
            "telephony collaborator failed: placement refused"
        );
        assert!(err.is_collaborator());
        assert_eq!(err.kind(), "collaborator");
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(DomainError::Validation("x".into()).kind(), "validation");
        assert_eq!(
            DomainError::SessionNotFound("CA1".into()).kind(),
            "session_not_found"
        );
        assert!(!DomainError::CircuitOpen("llm".into()).is_collaborator());
        assert_eq!(
            DomainError::SessionExpired("CA1".into()).kind(),
            "session_expired"
        );
    }
}
