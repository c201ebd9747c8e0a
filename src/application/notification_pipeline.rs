//! Notification pipeline
//!
//! Session events arrive over a bounded channel. Each one passes the per-call
//! gate (consecutive-kind de-dup, content de-dup, provider status order),
//! is rendered and queued through the repository. A delivery loop drains the
//! queue in small batches, throttled, with linear retry backoff.

use crate::domain::call::event::SessionEvent;
use crate::domain::call::record::HealthLevel;
use crate::domain::call::repository::CallRepository;
use crate::domain::gateway::{MessageOptions, MessagingChannel};
use crate::domain::shared::events::DomainEvent;
use crate::domain::notification::{
    formatter, content_hash, DeliveryUpdate, GateDecision, NotificationPriority,
    NotificationRecord, TrackerTable,
};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    /// Channel used when the session carries no `chat_id`
    pub default_chat_id: Option<String>,
    pub batch_size: usize,
    pub interval: Duration,
    pub inter_message_delay: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub tracker_retention: Duration,
    pub tracker_idle: Duration,
    /// Finished notifications (and, in memory, ended calls) older than this
    /// are purged on each sweep
    pub record_retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            default_chat_id: None,
            batch_size: 10,
            interval: Duration::from_millis(1000),
            inter_message_delay: Duration::from_millis(50),
            max_retries: 3,
            retry_interval: Duration::from_millis(5000),
            tracker_retention: Duration::from_secs(1800),
            tracker_idle: Duration::from_secs(7200),
            record_retention: Duration::from_secs(86400),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Sending half held by the orchestrator
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Publish in order; waits when the pipeline is behind
    pub async fn publish(&self, events: Vec<SessionEvent>) {
        for event in events {
            let call_id = event.call_id().clone();
            counter!("session_events_published_total", "type" => event.event_type()).increment(1);
            if self.tx.send(event).await.is_err() {
                warn!(call_id = %call_id, "Notification pipeline closed, event dropped");
            }
        }
    }
}

/// Outcome of a single delivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Due records skipped because an earlier record of the same call is
    /// still waiting
    pub held: usize,
}

pub struct NotificationPipeline {
    repository: Arc<dyn CallRepository>,
    messaging: Arc<dyn MessagingChannel>,
    settings: NotificationSettings,
    trackers: Mutex<TrackerTable>,
    sequence: AtomicU64,
}

impl NotificationPipeline {
    pub fn new(
        repository: Arc<dyn CallRepository>,
        messaging: Arc<dyn MessagingChannel>,
        settings: NotificationSettings,
    ) -> Self {
        // continue after records queued by a previous process
        let start = Utc::now().timestamp_micros().max(0) as u64;
        Self {
            repository,
            messaging,
            settings,
            trackers: Mutex::new(TrackerTable::new()),
            sequence: AtomicU64::new(start),
        }
    }

    pub fn settings(&self) -> &NotificationSettings {
        &self.settings
    }

    /// Gate one event and queue it. Returns the gate decision; suppressed
    /// events are not stored.
    pub async fn enqueue(&self, event: &SessionEvent) -> Result<GateDecision> {
        let call_id = event.call_id();
        let Some(target) = event
            .target()
            .map(str::to_string)
            .or_else(|| self.settings.default_chat_id.clone())
        else {
            debug!(call_id = %call_id, "No notification target, event skipped");
            counter!("notifications_suppressed_total", "reason" => "no_target").increment(1);
            return Ok(GateDecision::Closed);
        };

        let kind = event.kind();
        let text = formatter::render(event);
        let hash = content_hash(call_id, &kind, &text);

        let decision = self.trackers.lock().await.admit(
            call_id,
            &kind,
            event.provider_status(),
            &hash,
            event.is_terminal(),
            Utc::now(),
        );
        if decision != GateDecision::Accept {
            debug!(
                call_id = %call_id,
                kind = %kind,
                event_type = event.event_type(),
                occurred_at = %event.occurred_at(),
                decision = decision.as_str(),
                "Notification suppressed"
            );
            counter!("notifications_suppressed_total", "reason" => decision.as_str()).increment(1);
            return Ok(decision);
        }

        let priority = if event.is_terminal() {
            NotificationPriority::High
        } else {
            NotificationPriority::Normal
        };
        let record = NotificationRecord::new(
            call_id.clone(),
            kind,
            target,
            text,
            event.provider_status(),
            priority,
            self.sequence.fetch_add(1, Ordering::SeqCst),
        );
        self.repository.save_notification(&record).await?;
        counter!("notifications_queued_total").increment(1);
        debug!(call_id = %call_id, kind = %record.kind, sequence = record.sequence, "Notification queued");
        Ok(GateDecision::Accept)
    }

    /// Deliver one batch of due records
    pub async fn deliver_batch(&self) -> Result<DeliveryReport> {
        let now = Utc::now();
        let batch_size = self.settings.batch_size.max(1);
        let pending = self
            .repository
            .get_pending_notifications(batch_size * 5)
            .await?;

        let mut report = DeliveryReport::default();
        let mut blocked: HashSet<CallId> = HashSet::new();
        let mut candidates: Vec<NotificationRecord> = Vec::new();
        for record in pending {
            if blocked.contains(&record.call_id) {
                if record.is_due(now) {
                    report.held += 1;
                }
                continue;
            }
            if !record.is_due(now) {
                // later records of this call wait behind it
                blocked.insert(record.call_id.clone());
                continue;
            }
            candidates.push(record);
        }

        // calls with a terminal notification go first; order within a call
        // is kept since the sort is stable
        let mut call_priority: HashMap<CallId, NotificationPriority> = HashMap::new();
        for record in &candidates {
            let entry = call_priority
                .entry(record.call_id.clone())
                .or_insert(record.priority);
            *entry = (*entry).max(record.priority);
        }
        candidates.sort_by_key(|r| std::cmp::Reverse(call_priority[&r.call_id]));
        candidates.truncate(batch_size);

        let mut first = true;
        for record in candidates {
            if blocked.contains(&record.call_id) {
                report.held += 1;
                continue;
            }
            if !first && !self.settings.inter_message_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_message_delay).await;
            }
            first = false;

            match self
                .messaging
                .send_message(&record.target_channel, &record.text, &MessageOptions::default())
                .await
            {
                Ok(sent) => {
                    self.repository
                        .update_notification(
                            &record.id,
                            &DeliveryUpdate::sent(sent.message_id, record.retry_count),
                        )
                        .await?;
                    counter!("notifications_sent_total").increment(1);
                    report.sent += 1;
                }
                Err(e) => {
                    blocked.insert(record.call_id.clone());
                    if self.on_delivery_failure(&record, e.to_string()).await? {
                        report.retried += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report != DeliveryReport::default() {
            debug!(
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                held = report.held,
                "Notification batch delivered"
            );
        }
        Ok(report)
    }

    /// Schedule a retry or give up. Returns `true` when a retry was scheduled.
    async fn on_delivery_failure(&self, record: &NotificationRecord, error: String) -> Result<bool> {
        if record.retry_count < self.settings.max_retries {
            let retry_count = record.retry_count + 1;
            let backoff = self.settings.retry_interval * retry_count;
            let next_attempt_at = Utc::now()
                + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::seconds(5));
            warn!(
                call_id = %record.call_id,
                kind = %record.kind,
                retry = retry_count,
                error = %error,
                "Notification delivery failed, retry scheduled"
            );
            self.repository
                .update_notification(
                    &record.id,
                    &DeliveryUpdate::retrying(error, retry_count, next_attempt_at),
                )
                .await?;
            counter!("notifications_retried_total").increment(1);
            return Ok(true);
        }

        error!(
            call_id = %record.call_id,
            kind = %record.kind,
            retries = record.retry_count,
            error = %error,
            "Notification delivery failed permanently"
        );
        self.repository
            .update_notification(&record.id, &DeliveryUpdate::failed(error.clone(), record.retry_count))
            .await?;
        counter!("notifications_failed_total").increment(1);

        let details = json!({
            "notification_id": record.id.to_string(),
            "call_id": record.call_id.to_string(),
            "kind": record.kind,
            "retries": record.retry_count,
            "error": error,
        });
        if let Err(e) = self
            .repository
            .log_service_health("notification_delivery_failed", HealthLevel::Error, details)
            .await
        {
            warn!(call_id = %record.call_id, error = %e, "Failed to write health log");
        }
        Ok(false)
    }

    /// Drop per-call trackers past their retention window
    pub async fn evict_trackers(&self) -> usize {
        let retention = ChronoDuration::from_std(self.settings.tracker_retention)
            .unwrap_or_else(|_| ChronoDuration::minutes(30));
        let idle = ChronoDuration::from_std(self.settings.tracker_idle)
            .unwrap_or_else(|_| ChronoDuration::hours(2));
        let evicted = self
            .trackers
            .lock()
            .await
            .evict_expired(Utc::now(), retention, idle);
        if evicted > 0 {
            debug!(evicted, "Notification trackers evicted");
        }
        evicted
    }

    /// Periodic housekeeping: expire trackers and purge finished records
    pub async fn sweep(&self) {
        self.evict_trackers().await;
        let retention = ChronoDuration::from_std(self.settings.record_retention)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        match self.repository.purge_finished(Utc::now() - retention).await {
            Ok(0) => {}
            Ok(purged) => {
                counter!("records_purged_total").increment(purged as u64);
                debug!(purged, "Finished records purged");
            }
            Err(e) => warn!(error = %e, "Failed to purge finished records"),
        }
    }

    pub async fn tracked_calls(&self) -> usize {
        self.trackers.lock().await.len()
    }

    /// Run intake and delivery until `shutdown` flips or the event channel
    /// closes and the queue has been flushed once more.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let intake = {
                let pipeline = self.clone();
                let mut shutdown = shutdown.clone();
                async move {
                    loop {
                        tokio::select! {
                            maybe = events.recv() => match maybe {
                                Some(event) => {
                                    if let Err(e) = pipeline.enqueue(&event).await {
                                        error!(call_id = %event.call_id(), error = %e, "Failed to queue notification");
                                    }
                                }
                                None => break,
                            },
                            _ = shutdown.changed() => break,
                        }
                    }
                    // take what was already published
                    while let Ok(event) = events.try_recv() {
                        if let Err(e) = pipeline.enqueue(&event).await {
                            error!(call_id = %event.call_id(), error = %e, "Failed to queue notification");
                        }
                    }
                }
            };

            let delivery = {
                let pipeline = self.clone();
                let mut shutdown = shutdown.clone();
                async move {
                    let mut tick = tokio::time::interval(pipeline.settings.interval);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    let mut sweep = tokio::time::interval(pipeline.settings.sweep_interval);
                    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = tick.tick() => {
                                if let Err(e) = pipeline.deliver_batch().await {
                                    error!(error = %e, "Notification delivery pass failed");
                                }
                            }
                            _ = sweep.tick() => pipeline.sweep().await,
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            };

            tokio::join!(intake, delivery);
            if let Err(e) = self.deliver_batch().await {
                warn!(error = %e, "Final notification flush failed");
            }
            info!("Notification pipeline stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::event::{SessionEventBase, StatusChanged};
    use crate::domain::call::repository::MockCallRepository;
    use crate::domain::call::value_object::ProviderStatus;
    use crate::domain::gateway::{MockMessagingChannel, SentMessage};

    fn status_event(status: ProviderStatus) -> SessionEvent {
        let id = CallId::parse("CA1").unwrap();
        SessionEvent::StatusChanged(StatusChanged {
            base: SessionEventBase::new("session.status_changed", &id, Some("chat-1")),
            status,
            duration_seconds: None,
            error: None,
        })
    }

    #[tokio::test]
    async fn test_suppressed_event_not_stored() {
        let mut repo = MockCallRepository::new();
        repo.expect_save_notification().times(1).returning(|_| Ok(()));
        let pipeline = NotificationPipeline::new(
            Arc::new(repo),
            Arc::new(MockMessagingChannel::new()),
            NotificationSettings::default(),
        );

        let ringing = status_event(ProviderStatus::Ringing);
        assert_eq!(pipeline.enqueue(&ringing).await.unwrap(), GateDecision::Accept);
        assert_eq!(
            pipeline.enqueue(&ringing).await.unwrap(),
            GateDecision::Redelivered
        );
        assert_eq!(pipeline.tracked_calls().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_purges_past_retention() {
        let mut repo = MockCallRepository::new();
        let before = Utc::now();
        repo.expect_purge_finished()
            .withf(move |cutoff| *cutoff <= before - ChronoDuration::seconds(59))
            .times(1)
            .returning(|_| Ok(3));
        let pipeline = NotificationPipeline::new(
            Arc::new(repo),
            Arc::new(MockMessagingChannel::new()),
            NotificationSettings {
                record_retention: Duration::from_secs(60),
                ..NotificationSettings::default()
            },
        );
        pipeline.sweep().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_logged_to_health() {
        let record = NotificationRecord::new(
            CallId::parse("CA1").unwrap(),
            "status:ringing".to_string(),
            "chat-1".to_string(),
            "Call CA1: ringing".to_string(),
            Some(ProviderStatus::Ringing),
            NotificationPriority::Normal,
            1,
        );
        let mut exhausted = record.clone();
        exhausted.retry_count = 3;

        let mut repo = MockCallRepository::new();
        repo.expect_get_pending_notifications()
            .returning(move |_| Ok(vec![exhausted.clone()]));
        repo.expect_update_notification()
            .withf(|_, update| update.state == crate::domain::notification::DeliveryState::Failed)
            .times(1)
            .returning(|_, _| Ok(()));
        repo.expect_log_service_health()
            .withf(|event, level, _| {
                event == "notification_delivery_failed" && *level == HealthLevel::Error
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut messaging = MockMessagingChannel::new();
        messaging
            .expect_send_message()
            .returning(|_, _, _| Err(crate::domain::DomainError::messaging("429")));

        let pipeline = NotificationPipeline::new(
            Arc::new(repo),
            Arc::new(messaging),
            NotificationSettings::default(),
        );
        let report = pipeline.deliver_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 0);
    }

    #[tokio::test]
    async fn test_successful_send_marks_sent() {
        let record = NotificationRecord::new(
            CallId::parse("CA2").unwrap(),
            "finalized".to_string(),
            "chat-1".to_string(),
            "Call CA2 succeeded".to_string(),
            None,
            NotificationPriority::High,
            7,
        );

        let mut repo = MockCallRepository::new();
        repo.expect_get_pending_notifications()
            .returning(move |_| Ok(vec![record.clone()]));
        repo.expect_update_notification()
            .withf(|_, update| update.provider_message_id.as_deref() == Some("m-1"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut messaging = MockMessagingChannel::new();
        messaging
            .expect_send_message()
            .withf(|chat, text, _| chat == "chat-1" && text == "Call CA2 succeeded")
            .times(1)
            .returning(|_, _, _| {
                Ok(SentMessage {
                    message_id: "m-1".to_string(),
                })
            });

        let pipeline = NotificationPipeline::new(
            Arc::new(repo),
            Arc::new(messaging),
            NotificationSettings::default(),
        );
        let report = pipeline.deliver_batch().await.unwrap();
        assert_eq!(report.sent, 1);
    }
}
