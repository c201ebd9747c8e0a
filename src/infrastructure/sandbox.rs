//! Sandbox collaborators
//!
//! Stand-ins for the telephony provider, the completion service and the
//! messaging channel, used when no provider account is configured. Every
//! request is logged and recorded so it can be inspected afterwards.

use crate::domain::gateway::{
    CallUpdate, CompletionContext, CompletionService, MessageOptions, MessagingChannel,
    SentMessage, TelephonyGateway,
};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{Address, CallId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// A placed outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedCall {
    pub call_id: CallId,
    pub to: String,
    pub from: String,
    pub callback_url: String,
}

/// Telephony provider stand-in; synthesises call ids
pub struct SandboxTelephony {
    configured: bool,
    unavailable: AtomicBool,
    placed: Mutex<Vec<PlacedCall>>,
    updates: Mutex<Vec<(CallId, CallUpdate)>>,
}

impl SandboxTelephony {
    /// `configured` mirrors whether provider credentials are present
    pub fn new(configured: bool) -> Self {
        Self {
            configured,
            unavailable: AtomicBool::new(false),
            placed: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent request fail with a telephony error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn placed_calls(&self) -> Vec<PlacedCall> {
        self.placed.lock().await.clone()
    }

    pub async fn updates_for(&self, call_id: &CallId) -> Vec<CallUpdate> {
        self.updates
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::telephony("sandbox provider unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TelephonyGateway for SandboxTelephony {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn place_call(&self, to: &Address, from: &Address, callback_url: &str) -> Result<CallId> {
        self.check_available()?;
        let call_id = CallId::parse(&format!("SB{}", Uuid::new_v4().simple()))?;
        info!(call_id = %call_id, to = %to, from = %from, "Sandbox call placed");
        self.placed.lock().await.push(PlacedCall {
            call_id: call_id.clone(),
            to: to.to_string(),
            from: from.to_string(),
            callback_url: callback_url.to_string(),
        });
        Ok(call_id)
    }

    async fn update_call(&self, call_id: &CallId, update: CallUpdate) -> Result<()> {
        self.check_available()?;
        info!(call_id = %call_id, update = ?update, "Sandbox call updated");
        self.updates.lock().await.push((call_id.clone(), update));
        Ok(())
    }
}

/// Completion service stand-in that acknowledges what the caller said
#[derive(Default)]
pub struct CannedCompletion {
    unavailable: AtomicBool,
}

impl CannedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionService for CannedCompletion {
    async fn complete(&self, prompt: &str, context: &CompletionContext) -> Result<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::completion("sandbox completion unavailable"));
        }
        Ok(format!(
            "You said: {} (turn {})",
            prompt.trim(),
            context.history.len() + 1
        ))
    }
}

/// A message handed to the messaging channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub chat_id: String,
    pub text: String,
    pub message_id: String,
}

/// Messaging channel stand-in that logs each message
#[derive(Default)]
pub struct LogMessagingChannel {
    next_id: AtomicU64,
    fail_next: AtomicU32,
    delivered: Mutex<Vec<DeliveredMessage>>,
}

impl LogMessagingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a messaging error
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub async fn delivered(&self) -> Vec<DeliveredMessage> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl MessagingChannel for LogMessagingChannel {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        _options: &MessageOptions,
    ) -> Result<SentMessage> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DomainError::messaging("sandbox channel rejected message"));
        }

        let message_id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        info!(chat_id, message_id = %message_id, text, "Notification delivered");
        self.delivered.lock().await.push(DeliveredMessage {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            message_id: message_id.clone(),
        });
        Ok(SentMessage { message_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sandbox_places_and_records() {
        let telephony = SandboxTelephony::new(true);
        let to = Address::parse("to", Some("+15550001111")).unwrap();
        let from = Address::parse("from", Some("+15550002222")).unwrap();

        let call_id = telephony
            .place_call(&to, &from, "http://localhost/webhooks/incoming-call")
            .await
            .unwrap();
        assert!(call_id.as_str().starts_with("SB"));

        telephony
            .update_call(&call_id, CallUpdate::Hangup { text: None })
            .await
            .unwrap();
        assert_eq!(telephony.updates_for(&call_id).await.len(), 1);

        telephony.set_unavailable(true);
        assert!(telephony.place_call(&to, &from, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_channel_fails_then_recovers() {
        let channel = LogMessagingChannel::new();
        channel.fail_next(1);
        let options = MessageOptions::default();

        assert!(channel.send_message("chat", "one", &options).await.is_err());
        let sent = channel.send_message("chat", "one", &options).await.unwrap();
        assert_eq!(sent.message_id, "1");
        assert_eq!(channel.delivered().await.len(), 1);
    }
}
