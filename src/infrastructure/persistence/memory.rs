//! In-memory repository, used when no database is configured and in tests

use crate::domain::call::record::{CallInputRecord, CallPatch, CallRecord, HealthLevel};
use crate::domain::call::repository::CallRepository;
use crate::domain::notification::{DeliveryUpdate, NotificationRecord};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, NotificationId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Service health log entry
#[derive(Debug, Clone, PartialEq)]
pub struct HealthLogEntry {
    pub event: String,
    pub level: HealthLevel,
    pub details: serde_json::Value,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Store {
    calls: HashMap<CallId, CallRecord>,
    inputs: Vec<CallInputRecord>,
    health: Vec<HealthLogEntry>,
    notifications: HashMap<NotificationId, NotificationRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCallRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemoryCallRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn call_inputs(&self, call_id: &CallId) -> Vec<CallInputRecord> {
        self.store
            .read()
            .await
            .inputs
            .iter()
            .filter(|i| &i.call_id == call_id)
            .cloned()
            .collect()
    }

    pub async fn health_log(&self) -> Vec<HealthLogEntry> {
        self.store.read().await.health.clone()
    }

    /// All notifications of a call in enqueue order
    pub async fn notifications_for(&self, call_id: &CallId) -> Vec<NotificationRecord> {
        let store = self.store.read().await;
        let mut records: Vec<NotificationRecord> = store
            .notifications
            .values()
            .filter(|n| &n.call_id == call_id)
            .cloned()
            .collect();
        records.sort_by_key(|n| n.sequence);
        records
    }

    pub async fn call_count(&self) -> usize {
        self.store.read().await.calls.len()
    }
}

#[async_trait]
impl CallRepository for InMemoryCallRepository {
    async fn save_call(&self, record: &CallRecord) -> Result<()> {
        debug!(call_id = %record.call_id, "Saving call record");
        self.store
            .write()
            .await
            .calls
            .insert(record.call_id.clone(), record.clone());
        Ok(())
    }

    async fn update_call(&self, call_id: &CallId, patch: &CallPatch) -> Result<()> {
        let mut store = self.store.write().await;
        let record = store
            .calls
            .get_mut(call_id)
            .ok_or_else(|| DomainError::persistence(format!("call {} not found", call_id)))?;
        patch.apply_to(record);
        Ok(())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        Ok(self.store.read().await.calls.get(call_id).cloned())
    }

    async fn save_call_input(&self, record: &CallInputRecord) -> Result<()> {
        self.store.write().await.inputs.push(record.clone());
        Ok(())
    }

    async fn log_service_health(
        &self,
        event: &str,
        level: HealthLevel,
        details: serde_json::Value,
    ) -> Result<()> {
        self.store.write().await.health.push(HealthLogEntry {
            event: event.to_string(),
            level,
            details,
            logged_at: Utc::now(),
        });
        Ok(())
    }

    async fn save_notification(&self, record: &NotificationRecord) -> Result<()> {
        self.store
            .write()
            .await
            .notifications
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_pending_notifications(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        let store = self.store.read().await;
        let mut pending: Vec<NotificationRecord> = store
            .notifications
            .values()
            .filter(|n| !n.delivery_state.is_final())
            .cloned()
            .collect();
        pending.sort_by_key(|n| n.sequence);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_notification(&self, id: &NotificationId, update: &DeliveryUpdate) -> Result<()> {
        let mut store = self.store.write().await;
        let record = store
            .notifications
            .get_mut(id)
            .ok_or_else(|| DomainError::persistence(format!("notification {} not found", id)))?;
        if !update.apply_to(record) {
            return Err(DomainError::persistence(format!(
                "notification {}: cannot move from {} to {}",
                id, record.delivery_state, update.state
            )));
        }
        Ok(())
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut store = self.store.write().await;
        let before = store.notifications.len()
            + store.calls.len()
            + store.inputs.len()
            + store.health.len();

        store
            .notifications
            .retain(|_, n| !n.delivery_state.is_final() || n.updated_at >= cutoff);
        store
            .calls
            .retain(|_, c| c.ended_at.map_or(true, |ended| ended >= cutoff));
        let Store { calls, inputs, .. } = &mut *store;
        inputs.retain(|i| calls.contains_key(&i.call_id));
        store.health.retain(|h| h.logged_at >= cutoff);

        let removed = before
            - (store.notifications.len()
                + store.calls.len()
                + store.inputs.len()
                + store.health.len());
        if removed > 0 {
            debug!(removed, "Finished records purged");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::value_object::{CallPhase, CallType};
    use crate::domain::notification::{DeliveryState, NotificationPriority};
    use std::collections::BTreeMap;

    fn call(id: &str) -> CallRecord {
        CallRecord {
            call_id: CallId::parse(id).unwrap(),
            call_type: CallType::PureCollection,
            phase: CallPhase::Initiated,
            outcome: None,
            destination: Some("+15550001111".to_string()),
            origin: None,
            metadata: BTreeMap::new(),
            provider_status: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_seconds: None,
            termination_reason: None,
            error_count: 0,
            last_error: None,
        }
    }

    fn notification(call_id: &str, sequence: u64) -> NotificationRecord {
        NotificationRecord::new(
            CallId::parse(call_id).unwrap(),
            format!("kind-{}", sequence),
            "chat".to_string(),
            "text".to_string(),
            None,
            NotificationPriority::Normal,
            sequence,
        )
    }

    #[tokio::test]
    async fn test_update_unknown_call_fails() {
        let repo = InMemoryCallRepository::new();
        let result = repo
            .update_call(&CallId::parse("CA-x").unwrap(), &CallPatch::phase(CallPhase::Completed))
            .await;
        assert!(matches!(result, Err(DomainError::Collaborator { .. })));
    }

    #[tokio::test]
    async fn test_save_and_patch_call() {
        let repo = InMemoryCallRepository::new();
        let record = call("CA1");
        repo.save_call(&record).await.unwrap();
        repo.update_call(&record.call_id, &CallPatch::phase(CallPhase::Ringing))
            .await
            .unwrap();

        let stored = repo.get_call(&record.call_id).await.unwrap().unwrap();
        assert_eq!(stored.phase, CallPhase::Ringing);
        assert_eq!(repo.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_pending_ordered_and_limited() {
        let repo = InMemoryCallRepository::new();
        for seq in [3, 1, 2] {
            repo.save_notification(&notification("CA1", seq)).await.unwrap();
        }
        let pending = repo.get_pending_notifications(2).await.unwrap();
        let sequences: Vec<u64> = pending.iter().map(|n| n.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);

        repo.update_notification(&pending[0].id, &DeliveryUpdate::sent("m".into(), 0))
            .await
            .unwrap();
        let pending = repo.get_pending_notifications(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|n| n.delivery_state == DeliveryState::Pending));

        // sent twice is refused
        let first = repo.notifications_for(&CallId::parse("CA1").unwrap()).await[0].clone();
        assert!(repo
            .update_notification(&first.id, &DeliveryUpdate::sent("m2".into(), 0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_purge_keeps_live_records() {
        let repo = InMemoryCallRepository::new();

        let mut ended = call("CA-ended");
        ended.phase = CallPhase::Completed;
        ended.ended_at = Some(Utc::now());
        repo.save_call(&ended).await.unwrap();
        repo.save_call(&call("CA-live")).await.unwrap();
        for id in ["CA-ended", "CA-live"] {
            repo.save_call_input(&CallInputRecord {
                id: uuid::Uuid::new_v4(),
                call_id: CallId::parse(id).unwrap(),
                stage_key: "otp".to_string(),
                scenario: "otp".to_string(),
                value: "123456".to_string(),
                attempts: 1,
                duration_ms: 900,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        repo.log_service_health("session_errors", HealthLevel::Warning, serde_json::json!({}))
            .await
            .unwrap();

        let sent = notification("CA-ended", 1);
        repo.save_notification(&sent).await.unwrap();
        repo.update_notification(&sent.id, &DeliveryUpdate::sent("m".into(), 0))
            .await
            .unwrap();
        repo.save_notification(&notification("CA-live", 2)).await.unwrap();

        // nothing is old enough yet
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(repo.purge_finished(cutoff).await.unwrap(), 0);

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(repo.purge_finished(cutoff).await.unwrap(), 4);

        assert_eq!(repo.call_count().await, 1);
        assert!(repo.get_call(&ended.call_id).await.unwrap().is_none());
        assert!(repo.call_inputs(&ended.call_id).await.is_empty());
        assert_eq!(repo.call_inputs(&CallId::parse("CA-live").unwrap()).await.len(), 1);
        assert!(repo.health_log().await.is_empty());
        // pending work survives any cutoff
        assert_eq!(repo.get_pending_notifications(10).await.unwrap().len(), 1);
    }
}
