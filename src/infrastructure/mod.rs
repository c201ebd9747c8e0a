//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Repository implementations (in-memory, PostgreSQL)
//! - Sandbox collaborators for the telephony, completion and messaging ports

pub mod persistence;
pub mod sandbox;
