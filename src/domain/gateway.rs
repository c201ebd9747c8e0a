//! Ports for the external collaborators: telephony provider, completion
//! service and messaging channel

use crate::domain::call::aggregate::ConversationTurn;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{Address, CallId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Keypad gather parameters attached to a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherSpec {
    pub num_digits: usize,
    pub timeout_seconds: u64,
}

/// Change requested on a live call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallUpdate {
    /// Speak `text`, then optionally gather keypad input
    Prompt {
        text: String,
        gather: Option<GatherSpec>,
    },
    /// Speak `text` if any, then end the call
    Hangup { text: Option<String> },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Provider credentials are present
    fn is_configured(&self) -> bool;

    /// Place an outbound call; returns the provider call id
    async fn place_call(&self, to: &Address, from: &Address, callback_url: &str) -> Result<CallId>;

    async fn update_call(&self, call_id: &CallId, update: CallUpdate) -> Result<()>;
}

/// Conversation so far, passed along with each completion request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionContext {
    pub call_id: Option<CallId>,
    pub history: Vec<ConversationTurn>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str, context: &CompletionContext) -> Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOptions {
    pub parse_mode: Option<String>,
    pub disable_notification: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: &MessageOptions,
    ) -> Result<SentMessage>;
}
