//! Call bounded context - manages the lifecycle of call sessions

pub mod aggregate;
pub mod error_metrics;
pub mod event;
pub mod record;
pub mod repository;
pub mod strategy;
pub mod value_object;

pub use aggregate::{CallSession, ConversationTurn, SessionSummary, StatusEffect};
pub use error_metrics::{ErrorEntry, ErrorMetrics};
pub use event::SessionEvent;
pub use record::{CallInputRecord, CallPatch, CallRecord, HealthLevel};
pub use repository::CallRepository;
pub use strategy::{CallStrategy, StrategyContext};
pub use value_object::{CallPhase, CallType, ProviderStatus, TerminationReason};
