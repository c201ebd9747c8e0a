//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Aggregates: the call session and its phase machine
//! - Value Objects: phases, statuses, scenarios, outcomes
//! - Repository Interfaces: ports for persistence
//! - Gateways: ports for the telephony, completion and messaging collaborators
//! - Domain Events: session transitions feeding the notification pipeline

pub mod call;
pub mod circuit_breaker;
pub mod collection;
pub mod gateway;
pub mod notification;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
