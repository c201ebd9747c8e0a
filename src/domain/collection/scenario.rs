//! Named keypad-input scenarios

use crate::domain::shared::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prompts spoken while a scenario's stage runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioPrompts {
    pub initial: String,
    pub retry: String,
    pub success: String,
    pub failure: String,
}

impl ScenarioPrompts {
    pub fn for_code(digit_length: usize, subject: &str) -> Self {
        Self {
            initial: format!(
                "Please enter your {}-digit {}, followed by the pound key.",
                digit_length, subject
            ),
            retry: format!(
                "That entry was not valid. Please enter your {}-digit {} again.",
                digit_length, subject
            ),
            success: "Thank you, your entry has been verified.".to_string(),
            failure: "We were unable to verify your entry. Goodbye.".to_string(),
        }
    }
}

/// Immutable stage template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,
    pub digit_length: usize,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub prompts: ScenarioPrompts,
}

impl ScenarioDefinition {
    pub fn new(
        name: impl Into<String>,
        digit_length: usize,
        timeout_seconds: u64,
        max_retries: u32,
        prompts: ScenarioPrompts,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::Validation("scenario name is required".into()));
        }
        if digit_length == 0 {
            return Err(DomainError::Validation(format!(
                "scenario {} must expect at least one digit",
                name
            )));
        }
        if max_retries == 0 {
            return Err(DomainError::Validation(format!(
                "scenario {} must allow at least one attempt",
                name
            )));
        }
        Ok(Self {
            name,
            digit_length,
            timeout_seconds,
            max_retries,
            prompts,
        })
    }

    fn builtin(name: &str, digit_length: usize, timeout_seconds: u64, subject: &str) -> Self {
        Self {
            name: name.to_string(),
            digit_length,
            timeout_seconds,
            max_retries: 3,
            prompts: ScenarioPrompts::for_code(digit_length, subject),
        }
    }
}

/// Registry of scenarios keyed by name
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    scenarios: HashMap<String, ScenarioDefinition>,
}

impl ScenarioCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the stock scenarios
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for definition in [
            ScenarioDefinition::builtin("otp", 6, 10, "verification code"),
            ScenarioDefinition::builtin("paypal", 6, 10, "security code"),
            ScenarioDefinition::builtin("bank", 8, 10, "account reference"),
            ScenarioDefinition::builtin("pin", 4, 8, "PIN"),
            ScenarioDefinition::builtin("extension", 4, 8, "extension number"),
            ScenarioDefinition::builtin("survey", 1, 8, "rating from 1 to 9"),
        ] {
            catalog.register(definition);
        }
        catalog
    }

    /// Add or replace a scenario
    pub fn register(&mut self, definition: ScenarioDefinition) {
        self.scenarios
            .insert(definition.name.to_ascii_lowercase(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioDefinition> {
        self.scenarios.get(&name.trim().to_ascii_lowercase())
    }

    pub fn require(&self, name: &str) -> Result<&ScenarioDefinition> {
        self.get(name)
            .ok_or_else(|| DomainError::Validation(format!("unknown scenario: {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scenarios.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_paypal() {
        let catalog = ScenarioCatalog::builtin();
        let paypal = catalog.get("paypal").unwrap();
        assert_eq!(paypal.digit_length, 6);
        assert_eq!(paypal.max_retries, 3);
        assert!(paypal.prompts.initial.contains("6-digit"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = ScenarioCatalog::builtin();
        assert!(catalog.get("PayPal").is_some());
        assert!(catalog.get(" bank ").is_some());
        assert!(catalog.require("missing").is_err());
    }

    #[test]
    fn test_register_overrides() {
        let mut catalog = ScenarioCatalog::builtin();
        let before = catalog.len();
        let custom = ScenarioDefinition::new(
            "pin",
            6,
            12,
            5,
            ScenarioPrompts::for_code(6, "PIN"),
        )
        .unwrap();
        catalog.register(custom);

        assert_eq!(catalog.len(), before);
        assert_eq!(catalog.get("pin").unwrap().digit_length, 6);
        assert_eq!(catalog.get("pin").unwrap().max_retries, 5);
    }

    #[test]
    fn test_definition_validation() {
        let prompts = ScenarioPrompts::for_code(4, "PIN");
        assert!(ScenarioDefinition::new("", 4, 8, 3, prompts.clone()).is_err());
        assert!(ScenarioDefinition::new("x", 0, 8, 3, prompts.clone()).is_err());
        assert!(ScenarioDefinition::new("x", 4, 8, 0, prompts).is_err());
    }
}
