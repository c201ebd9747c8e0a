//! Dialtone - call-session lifecycle orchestrator
//!
//! Drives telephone calls placed through a telephony provider: session state
//! from provider webhooks, staged keypad collection and verification,
//! conversational turns behind a circuit breaker, and ordered status
//! notifications to a messaging channel.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
