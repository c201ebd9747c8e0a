//! Interface layer - External interfaces
//!
//! This layer handles:
//! - Provider webhooks
//! - Call management REST API
//! - Request/response formatting
//! - Prometheus metrics

pub mod api;
