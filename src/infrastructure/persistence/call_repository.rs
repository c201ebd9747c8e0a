//! PostgreSQL implementation of the call repository

use crate::domain::call::record::{CallInputRecord, CallPatch, CallRecord, HealthLevel};
use crate::domain::call::repository::CallRepository;
use crate::domain::call::value_object::{CallPhase, CallType, ProviderStatus};
use crate::domain::notification::{
    DeliveryState, DeliveryUpdate, NotificationPriority, NotificationRecord,
};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, NotificationId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tracing::{debug, error};
use uuid::Uuid;

fn db_error(operation: &str, e: sqlx::Error) -> DomainError {
    error!(operation, "Database error: {}", e);
    DomainError::persistence(format!("{}: {}", operation, e))
}

fn phase_column(phase: CallPhase) -> Result<String> {
    serde_json::to_value(phase)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| DomainError::Internal(format!("unserializable phase {:?}", phase)))
}

fn parse_phase(raw: &str) -> Option<CallPhase> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
}

#[derive(FromRow)]
struct CallRow {
    call_id: String,
    call_type: String,
    phase: String,
    outcome: Option<String>,
    destination: Option<String>,
    origin: Option<String>,
    metadata: Json<BTreeMap<String, String>>,
    provider_status: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    termination_reason: Option<String>,
    error_count: i64,
    last_error: Option<String>,
}

impl TryFrom<CallRow> for CallRecord {
    type Error = DomainError;

    fn try_from(r: CallRow) -> Result<Self> {
        Ok(CallRecord {
            call_id: CallId::parse(&r.call_id)?,
            call_type: r.call_type.parse().unwrap_or(CallType::Conversational),
            phase: parse_phase(&r.phase).unwrap_or(CallPhase::Completed),
            outcome: r.outcome.as_deref().and_then(parse_phase),
            destination: r.destination,
            origin: r.origin,
            metadata: r.metadata.0,
            provider_status: r
                .provider_status
                .as_deref()
                .and_then(|s| ProviderStatus::parse(s).ok()),
            started_at: r.started_at,
            ended_at: r.ended_at,
            duration_seconds: r.duration_seconds,
            termination_reason: r.termination_reason,
            error_count: r.error_count.max(0) as u64,
            last_error: r.last_error,
        })
    }
}

#[derive(FromRow)]
struct NotificationRow {
    id: Uuid,
    call_id: String,
    kind: String,
    target_channel: String,
    text: String,
    content_hash: String,
    provider_status: Option<String>,
    priority: i16,
    sequence: i64,
    delivery_state: String,
    retry_count: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    provider_message_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for NotificationRecord {
    type Error = DomainError;

    fn try_from(r: NotificationRow) -> Result<Self> {
        Ok(NotificationRecord {
            id: NotificationId::from_uuid(r.id),
            call_id: CallId::parse(&r.call_id)?,
            kind: r.kind,
            target_channel: r.target_channel,
            text: r.text,
            content_hash: r.content_hash,
            provider_status: r
                .provider_status
                .as_deref()
                .and_then(|s| ProviderStatus::parse(s).ok()),
            priority: NotificationPriority::from_i16(r.priority),
            sequence: r.sequence.max(0) as u64,
            delivery_state: DeliveryState::parse(&r.delivery_state).unwrap_or(DeliveryState::Failed),
            retry_count: r.retry_count.max(0) as u32,
            next_attempt_at: r.next_attempt_at,
            last_error: r.last_error,
            provider_message_id: r.provider_message_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

pub struct PgCallRepository {
    pool: PgPool,
}

impl PgCallRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallRepository for PgCallRepository {
    async fn save_call(&self, record: &CallRecord) -> Result<()> {
        debug!(call_id = %record.call_id, "Inserting call");

        sqlx::query(
            r#"
            INSERT INTO calls (
                call_id, call_type, phase, outcome,
                destination, origin, metadata, provider_status,
                started_at, ended_at, duration_seconds, termination_reason,
                error_count, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.call_id.as_str())
        .bind(record.call_type.as_str())
        .bind(phase_column(record.phase)?)
        .bind(record.outcome.map(phase_column).transpose()?)
        .bind(&record.destination)
        .bind(&record.origin)
        .bind(Json(&record.metadata))
        .bind(record.provider_status.map(|s| s.as_str()))
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_seconds)
        .bind(&record.termination_reason)
        .bind(record.error_count as i64)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("save_call", e))?;

        Ok(())
    }

    async fn update_call(&self, call_id: &CallId, patch: &CallPatch) -> Result<()> {
        debug!(call_id = %call_id, "Updating call");

        let result = sqlx::query(
            r#"
            UPDATE calls
            SET phase = COALESCE($2, phase),
                outcome = COALESCE($3, outcome),
                provider_status = COALESCE($4, provider_status),
                ended_at = COALESCE($5, ended_at),
                duration_seconds = COALESCE($6, duration_seconds),
                termination_reason = COALESCE($7, termination_reason),
                error_count = COALESCE($8, error_count),
                last_error = COALESCE($9, last_error),
                updated_at = NOW()
            WHERE call_id = $1
            "#,
        )
        .bind(call_id.as_str())
        .bind(patch.phase.map(phase_column).transpose()?)
        .bind(patch.outcome.map(phase_column).transpose()?)
        .bind(patch.provider_status.map(|s| s.as_str()))
        .bind(patch.ended_at)
        .bind(patch.duration_seconds)
        .bind(&patch.termination_reason)
        .bind(patch.error_count.map(|c| c as i64))
        .bind(&patch.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update_call", e))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::persistence(format!("call not found: {}", call_id)));
        }
        Ok(())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        let row = sqlx::query_as::<_, CallRow>(
            r#"
            SELECT call_id, call_type, phase, outcome,
                   destination, origin, metadata, provider_status,
                   started_at, ended_at, duration_seconds, termination_reason,
                   error_count, last_error
            FROM calls
            WHERE call_id = $1
            "#,
        )
        .bind(call_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get_call", e))?;

        row.map(CallRecord::try_from).transpose()
    }

    async fn save_call_input(&self, record: &CallInputRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO call_inputs (
                id, call_id, stage_key, scenario, value, attempts, duration_ms, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.call_id.as_str())
        .bind(&record.stage_key)
        .bind(&record.scenario)
        .bind(&record.value)
        .bind(record.attempts as i32)
        .bind(record.duration_ms as i64)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("save_call_input", e))?;

        Ok(())
    }

    async fn log_service_health(
        &self,
        event: &str,
        level: HealthLevel,
        details: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_health (id, event, level, details, logged_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event)
        .bind(level.as_str())
        .bind(Json(details))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("log_service_health", e))?;

        Ok(())
    }

    async fn save_notification(&self, record: &NotificationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, call_id, kind, target_channel, text, content_hash,
                provider_status, priority, sequence, delivery_state,
                retry_count, next_attempt_at, last_error, provider_message_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.call_id.as_str())
        .bind(&record.kind)
        .bind(&record.target_channel)
        .bind(&record.text)
        .bind(&record.content_hash)
        .bind(record.provider_status.map(|s| s.as_str()))
        .bind(record.priority.as_i16())
        .bind(record.sequence as i64)
        .bind(record.delivery_state.as_str())
        .bind(record.retry_count as i32)
        .bind(record.next_attempt_at)
        .bind(&record.last_error)
        .bind(&record.provider_message_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("save_notification", e))?;

        Ok(())
    }

    async fn get_pending_notifications(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, call_id, kind, target_channel, text, content_hash,
                   provider_status, priority, sequence, delivery_state,
                   retry_count, next_attempt_at, last_error, provider_message_id,
                   created_at, updated_at
            FROM notifications
            WHERE delivery_state IN ('PENDING', 'RETRYING')
            ORDER BY sequence ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get_pending_notifications", e))?;

        rows.into_iter().map(NotificationRecord::try_from).collect()
    }

    async fn update_notification(&self, id: &NotificationId, update: &DeliveryUpdate) -> Result<()> {
        // final states are never rewritten
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET delivery_state = $2,
                retry_count = $3,
                last_error = $4,
                provider_message_id = COALESCE($5, provider_message_id),
                next_attempt_at = COALESCE($6, next_attempt_at),
                updated_at = NOW()
            WHERE id = $1 AND delivery_state IN ('PENDING', 'RETRYING')
            "#,
        )
        .bind(id.as_uuid())
        .bind(update.state.as_str())
        .bind(update.retry_count as i32)
        .bind(&update.error)
        .bind(&update.provider_message_id)
        .bind(update.next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update_notification", e))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::persistence(format!(
                "notification {} not pending",
                id
            )));
        }
        Ok(())
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        // calls, keypad rows and health entries are the audit trail and stay
        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE delivery_state IN ('SENT', 'FAILED') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("purge_finished", e))?;

        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_column_roundtrip() {
        let column = phase_column(CallPhase::CollectingInput).unwrap();
        assert_eq!(column, "COLLECTING_INPUT");
        assert_eq!(parse_phase(&column), Some(CallPhase::CollectingInput));
        assert_eq!(parse_phase("bogus"), None);
    }
}
