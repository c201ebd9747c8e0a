//! Domain result type

use super::error::{Collaborator, DomainError};
use std::fmt::Display;

/// Standard result type for domain operations
pub type Result<T> = std::result::Result<T, DomainError>;

/// Lift adapter-level errors into [`DomainError::Collaborator`]
pub trait CollaboratorResultExt<T> {
    fn collaborator(self, collaborator: Collaborator) -> Result<T>;
}

impl<T, E: Display> CollaboratorResultExt<T> for std::result::Result<T, E> {
    fn collaborator(self, collaborator: Collaborator) -> Result<T> {
        self.map_err(|e| DomainError::Collaborator {
            collaborator,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_lift() {
        let raw: std::result::Result<(), String> = Err("connection reset".to_string());
        let err = raw.collaborator(Collaborator::Persistence).unwrap_err();
        assert!(matches!(
            err,
            DomainError::Collaborator {
                collaborator: Collaborator::Persistence,
                ..
            }
        ));
    }
}
