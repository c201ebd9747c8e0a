//! Notification bounded context - outbound status messages

pub mod formatter;
pub mod record;
pub mod tracker;

pub use record::{
    content_hash, DeliveryState, DeliveryUpdate, NotificationPriority, NotificationRecord,
};
pub use tracker::{CallTracker, GateDecision, TrackerTable};
