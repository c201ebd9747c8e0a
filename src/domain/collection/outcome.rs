//! Results of feeding keypad input into a call

use serde::{Deserialize, Serialize};

/// What happened to the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputStatus {
    /// Keystrokes buffered, waiting for more or for the inactivity flush
    Buffering,
    /// Entry rejected, caller gets another attempt
    Retry,
    /// Stage satisfied, next stage begins
    Advance,
    /// All stages satisfied
    Complete,
    /// Attempts exhausted, the call ends
    Failed,
    /// Nothing to collect (no active stage, call already over)
    Ignored,
}

/// What the telephony side should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    /// Play the prompt and collect keypad input
    Gather,
    /// Keep listening, nothing to say
    Wait,
    /// Hand control back to the conversation
    Continue,
    /// Play the prompt and end the call
    Hangup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOutcome {
    pub status: InputStatus,
    pub action: CallAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digit_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    pub attempts: u32,
    /// Replayed from an earlier identical delivery
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl InputOutcome {
    fn base(status: InputStatus, action: CallAction) -> Self {
        Self {
            status,
            action,
            stage_key: None,
            next_stage: None,
            prompt: None,
            remaining: None,
            digit_count: None,
            expected_length: None,
            timeout_seconds: None,
            attempts: 0,
            duplicate: false,
        }
    }

    pub fn buffering(stage_key: &str, attempts: u32) -> Self {
        Self {
            stage_key: Some(stage_key.to_string()),
            attempts,
            ..Self::base(InputStatus::Buffering, CallAction::Wait)
        }
    }

    pub fn retry(stage_key: &str, prompt: &str, remaining: u32, attempts: u32) -> Self {
        Self {
            stage_key: Some(stage_key.to_string()),
            prompt: Some(prompt.to_string()),
            remaining: Some(remaining),
            attempts,
            ..Self::base(InputStatus::Retry, CallAction::Gather)
        }
    }

    pub fn failed(stage_key: &str, prompt: &str, attempts: u32) -> Self {
        Self {
            stage_key: Some(stage_key.to_string()),
            prompt: Some(prompt.to_string()),
            remaining: Some(0),
            attempts,
            ..Self::base(InputStatus::Failed, CallAction::Hangup)
        }
    }

    pub fn advance(
        stage_key: &str,
        digit_count: usize,
        attempts: u32,
        next_stage: &str,
        next_prompt: &str,
    ) -> Self {
        Self {
            stage_key: Some(stage_key.to_string()),
            next_stage: Some(next_stage.to_string()),
            prompt: Some(next_prompt.to_string()),
            digit_count: Some(digit_count),
            attempts,
            ..Self::base(InputStatus::Advance, CallAction::Gather)
        }
    }

    pub fn complete(
        stage_key: &str,
        digit_count: usize,
        attempts: u32,
        prompt: &str,
        action: CallAction,
    ) -> Self {
        Self {
            stage_key: Some(stage_key.to_string()),
            prompt: Some(prompt.to_string()),
            digit_count: Some(digit_count),
            attempts,
            ..Self::base(InputStatus::Complete, action)
        }
    }

    pub fn ignored(prompt: Option<&str>) -> Self {
        Self {
            prompt: prompt.map(str::to_string),
            ..Self::base(InputStatus::Ignored, CallAction::Wait)
        }
    }

    /// Attach gather parameters for the stage being prompted
    pub fn with_gather(mut self, expected_length: usize, timeout_seconds: u64) -> Self {
        self.expected_length = Some(expected_length);
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn as_duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }

    pub fn ends_call(&self) -> bool {
        matches!(self.action, CallAction::Hangup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_outcome_serializes_hangup() {
        let outcome = InputOutcome::failed("otp", "Goodbye.", 3);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["action"], "hangup");
        assert_eq!(json["remaining"], 0);
        assert!(json.get("duplicate").is_none());
        assert!(outcome.ends_call());
    }

    #[test]
    fn test_duplicate_flag_serialized_only_when_set() {
        let outcome = InputOutcome::retry("otp", "again", 2, 1).as_duplicate();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["duplicate"], true);
        assert_eq!(json["remaining"], 2);
    }
}
