//! Shared value objects used across multiple bounded contexts

use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Provider-assigned call identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Parse a provider call identifier, rejecting blank values
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::Validation("call id is required".to_string()));
        }
        if trimmed.len() > 128 {
            return Err(DomainError::Validation(format!(
                "call id too long ({} characters)",
                trimmed.len()
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(Uuid);

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phone number or SIP address a call is placed to or from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn parse(field: &str, raw: Option<&str>) -> Result<Self, DomainError> {
        let value = raw.map(str::trim).unwrap_or_default();
        if value.is_empty() {
            return Err(DomainError::Validation(format!("{} is required", field)));
        }
        let valid = value.starts_with("sip:")
            || value
                .strip_prefix('+')
                .unwrap_or(value)
                .chars()
                .all(|c| c.is_ascii_digit());
        if !valid {
            return Err(DomainError::Validation(format!(
                "{} must be an E.164 number or sip: address",
                field
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_parse() {
        let id = CallId::parse("  CA1234 ").unwrap();
        assert_eq!(id.as_str(), "CA1234");
        assert_eq!(id.to_string(), "CA1234");

        assert!(CallId::parse("").is_err());
        assert!(CallId::parse("   ").is_err());
    }

    #[test]
    fn test_address_parse() {
        assert!(Address::parse("to", Some("+15550100")).is_ok());
        assert!(Address::parse("to", Some("sip:bob@example.com")).is_ok());

        let missing = Address::parse("to", None).unwrap_err();
        assert_eq!(missing.to_string(), "Validation error: to is required");

        assert!(Address::parse("from", Some("call me")).is_err());
    }
}
