//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases.
//! It's responsible for:
//! - Owning live sessions and their timers
//! - Coordinating the session with its collaborators
//! - Passing session events on to the notification pipeline
//! - Converting between domain models and DTOs

pub mod conversation;
pub mod notification_pipeline;
pub mod orchestrator;
pub mod registry;
pub mod timers;

pub use conversation::{ConversationService, TurnReply};
pub use notification_pipeline::{EventPublisher, NotificationPipeline, NotificationSettings};
pub use orchestrator::{CallOrchestrator, OrchestratorSettings};
pub use registry::{SessionHandle, SessionRegistry};
