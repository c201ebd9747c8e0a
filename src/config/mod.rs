//! Configuration management
//!
//! Loaded from an optional TOML file (`DIALTONE_CONFIG`, else `dialtone.toml`)
//! layered with `DIALTONE__SECTION__KEY` environment variables.

use crate::application::{NotificationSettings, OrchestratorSettings};
use crate::domain::circuit_breaker::CircuitBreakerConfig;
use crate::domain::collection::scenario::{ScenarioCatalog, ScenarioDefinition, ScenarioPrompts};
use crate::domain::shared::error::DomainError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Added to, or replacing, the stock scenarios
    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub callback_base_url: String,
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            from_number: None,
            callback_base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl TelephonyConfig {
    /// Both provider credentials are present
    pub fn is_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.account_sid) && present(&self.auth_token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_duration_secs: u64,
    pub inactivity_window_ms: u64,
    pub terminal_grace_secs: u64,
    pub release_timeout_ms: u64,
    pub accept_unverified_input: bool,
    pub default_scenario: String,
    pub completion_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 3600,
            inactivity_window_ms: 1500,
            terminal_grace_secs: 60,
            release_timeout_ms: 5000,
            accept_unverified_input: false,
            default_scenario: "otp".to_string(),
            completion_timeout_ms: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub fallback_response: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30,
            fallback_response:
                "Sorry, I am temporarily unavailable. Please try again in a moment.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub default_chat_id: Option<String>,
    pub batch_size: usize,
    pub interval_ms: u64,
    pub inter_message_delay_ms: u64,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub tracker_retention_secs: u64,
    pub tracker_idle_secs: u64,
    pub record_retention_secs: u64,
    pub queue_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_chat_id: None,
            batch_size: 10,
            interval_ms: 1000,
            inter_message_delay_ms: 50,
            max_retries: 3,
            retry_interval_ms: 5000,
            tracker_retention_secs: 1800,
            tracker_idle_secs: 7200,
            record_retention_secs: 86400,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// In-memory persistence when unset
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 5,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,dialtone=debug".to_string(),
        }
    }
}

/// Scenario entry in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub digit_length: usize,
    #[serde(default = "default_scenario_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_scenario_retries")]
    pub max_retries: u32,
    /// Noun used in the stock prompts, e.g. "security code"
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub prompts: Option<ScenarioPrompts>,
}

fn default_scenario_timeout() -> u64 {
    10
}

fn default_scenario_retries() -> u32 {
    3
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("DIALTONE_CONFIG")
            .map(|path| File::with_name(&path))
            .unwrap_or_else(|_| File::with_name("dialtone").required(false));

        Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("DIALTONE").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Stock scenarios merged with the configured ones
    pub fn scenario_catalog(&self) -> Result<ScenarioCatalog, DomainError> {
        let mut catalog = ScenarioCatalog::builtin();
        for entry in &self.scenarios {
            let prompts = entry.prompts.clone().unwrap_or_else(|| {
                ScenarioPrompts::for_code(
                    entry.digit_length,
                    entry.subject.as_deref().unwrap_or("code"),
                )
            });
            catalog.register(ScenarioDefinition::new(
                entry.name.clone(),
                entry.digit_length,
                entry.timeout_seconds,
                entry.max_retries,
                prompts,
            )?);
        }
        catalog.require(&self.session.default_scenario).map_err(|_| {
            DomainError::Configuration(format!(
                "default scenario {} is not defined",
                self.session.default_scenario
            ))
        })?;
        Ok(catalog)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_duration: Duration::from_secs(self.session.max_duration_secs),
            inactivity_window: Duration::from_millis(self.session.inactivity_window_ms),
            terminal_grace: Duration::from_secs(self.session.terminal_grace_secs),
            release_timeout: Duration::from_millis(self.session.release_timeout_ms),
            accept_unverified_input: self.session.accept_unverified_input,
            default_scenario: self.session.default_scenario.clone(),
            callback_base_url: self.telephony.callback_base_url.trim_end_matches('/').to_string(),
            default_origin: self.telephony.from_number.clone(),
        }
    }

    pub fn notification_settings(&self) -> NotificationSettings {
        let n = &self.notifications;
        NotificationSettings {
            default_chat_id: n.default_chat_id.clone(),
            batch_size: n.batch_size.max(1),
            interval: Duration::from_millis(n.interval_ms),
            inter_message_delay: Duration::from_millis(n.inter_message_delay_ms),
            max_retries: n.max_retries,
            retry_interval: Duration::from_millis(n.retry_interval_ms),
            tracker_retention: Duration::from_secs(n.tracker_retention_secs),
            tracker_idle: Duration::from_secs(n.tracker_idle_secs),
            record_retention: Duration::from_secs(n.record_retention_secs),
            ..NotificationSettings::default()
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.session.completion_timeout_ms)
    }

    #[cfg(feature = "postgres")]
    pub fn database_config(&self) -> Option<crate::infrastructure::persistence::DatabaseConfig> {
        let url = self.database.url.clone()?;
        Some(crate::infrastructure::persistence::DatabaseConfig {
            url,
            max_connections: self.database.max_connections,
            min_connections: self.database.min_connections,
            connect_timeout: Duration::from_secs(self.database.connect_timeout_secs),
            ..Default::default()
        })
    }
}
