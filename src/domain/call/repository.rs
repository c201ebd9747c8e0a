//! Call repository interface

use crate::domain::call::record::{CallInputRecord, CallPatch, CallRecord, HealthLevel};
use crate::domain::notification::{DeliveryUpdate, NotificationRecord};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, NotificationId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence port for calls, keypad audit rows, health log and the
/// notification queue.
///
/// This is defined in the domain layer as a trait (port),
/// and implemented in the infrastructure layer (adapter).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallRepository: Send + Sync {
    /// Insert a call row
    async fn save_call(&self, record: &CallRecord) -> Result<()>;

    /// Apply a partial update to a call row
    async fn update_call(&self, call_id: &CallId, patch: &CallPatch) -> Result<()>;

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>>;

    /// Audit an accepted keypad entry
    async fn save_call_input(&self, record: &CallInputRecord) -> Result<()>;

    async fn log_service_health(
        &self,
        event: &str,
        level: HealthLevel,
        details: serde_json::Value,
    ) -> Result<()>;

    /// Queue a notification record
    async fn save_notification(&self, record: &NotificationRecord) -> Result<()>;

    /// Records in PENDING or RETRYING state, oldest sequence first
    async fn get_pending_notifications(&self, limit: usize) -> Result<Vec<NotificationRecord>>;

    /// Write back the result of a delivery attempt
    async fn update_notification(&self, id: &NotificationId, update: &DeliveryUpdate) -> Result<()>;

    /// Drop SENT and FAILED notifications last touched before `cutoff`.
    /// Stores without durable history also drop calls that ended before it,
    /// with their keypad rows and health entries. Returns the rows removed.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
