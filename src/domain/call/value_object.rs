//! Call value objects

use crate::domain::shared::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of call flow a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Free-form conversation backed by the completion service
    Conversational,
    /// One-time-code verification against an expected value
    Verification,
    /// Keypad collection across one or more stages
    PureCollection,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Conversational => "conversational",
            CallType::Verification => "verification",
            CallType::PureCollection => "pure_collection",
        }
    }
}

impl FromStr for CallType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "conversational" | "conversation" => Ok(CallType::Conversational),
            "verification" | "verify" | "otp" => Ok(CallType::Verification),
            "pure_collection" | "collection" | "collect" | "dtmf" => Ok(CallType::PureCollection),
            other => Err(DomainError::Validation(format!("unknown call type: {}", other))),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallPhase {
    Initiated,
    Ringing,
    Answered,
    InProgress,
    CollectingInput,
    Validating,
    Success,
    Fail,
    Completed,
}

impl CallPhase {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, next: &CallPhase) -> bool {
        use CallPhase::*;

        match (self, next) {
            // Nothing leaves Completed
            (Completed, _) => false,

            // Outcome phases only finalize
            (Success, Completed) | (Fail, Completed) => true,
            (Success, _) | (Fail, _) => false,

            // Terminal provider status or deadline, from anywhere else
            (_, Fail) | (_, Completed) => true,

            // Provider progress may skip steps but never goes back
            (Initiated, Ringing | Answered | InProgress) => true,
            (Ringing, Answered | InProgress) => true,
            (Answered, InProgress) => true,

            (InProgress, CollectingInput) => true,
            (InProgress, Success) => true,
            (CollectingInput, Validating) => true,
            (Validating, Success | CollectingInput) => true,

            _ => false,
        }
    }

    /// Position along the provider-driven progression
    pub fn progress_rank(&self) -> u8 {
        match self {
            CallPhase::Initiated => 0,
            CallPhase::Ringing => 1,
            CallPhase::Answered => 2,
            CallPhase::InProgress => 3,
            CallPhase::CollectingInput | CallPhase::Validating => 4,
            CallPhase::Success | CallPhase::Fail => 5,
            CallPhase::Completed => 6,
        }
    }

    pub fn is_outcome(&self) -> bool {
        matches!(self, CallPhase::Success | CallPhase::Fail)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, CallPhase::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Initiated => "initiated",
            CallPhase::Ringing => "ringing",
            CallPhase::Answered => "answered",
            CallPhase::InProgress => "in_progress",
            CallPhase::CollectingInput => "collecting_input",
            CallPhase::Validating => "validating",
            CallPhase::Success => "success",
            CallPhase::Fail => "fail",
            CallPhase::Completed => "completed",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call status as reported by the telephony provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Answered,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
}

impl ProviderStatus {
    /// Normalize case, separators and common spellings
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let normalized = raw
            .trim()
            .to_ascii_lowercase()
            .replace(['_', ' '], "-");
        match normalized.as_str() {
            "queued" => Ok(ProviderStatus::Queued),
            "initiated" => Ok(ProviderStatus::Initiated),
            "ringing" => Ok(ProviderStatus::Ringing),
            "in-progress" | "inprogress" => Ok(ProviderStatus::InProgress),
            "answered" => Ok(ProviderStatus::Answered),
            "completed" => Ok(ProviderStatus::Completed),
            "busy" => Ok(ProviderStatus::Busy),
            "no-answer" | "noanswer" => Ok(ProviderStatus::NoAnswer),
            "failed" => Ok(ProviderStatus::Failed),
            "canceled" | "cancelled" => Ok(ProviderStatus::Canceled),
            "" => Err(DomainError::Validation("call status is required".to_string())),
            other => Err(DomainError::Validation(format!(
                "unknown call status: {}",
                other
            ))),
        }
    }

    /// Position in the provider's total status order
    pub fn rank(&self) -> u8 {
        match self {
            ProviderStatus::Queued => 0,
            ProviderStatus::Initiated => 1,
            ProviderStatus::Ringing => 2,
            ProviderStatus::InProgress => 3,
            ProviderStatus::Answered => 4,
            ProviderStatus::Completed
            | ProviderStatus::Busy
            | ProviderStatus::NoAnswer
            | ProviderStatus::Failed
            | ProviderStatus::Canceled => 5,
        }
    }

    /// No further provider status events are expected
    pub fn is_terminal(&self) -> bool {
        self.rank() == 5
    }

    /// Terminal without a normal completion
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Busy
                | ProviderStatus::NoAnswer
                | ProviderStatus::Failed
                | ProviderStatus::Canceled
        )
    }

    /// Session phase for a non-terminal status
    pub fn progress_phase(&self) -> Option<CallPhase> {
        match self {
            ProviderStatus::Queued | ProviderStatus::Initiated => Some(CallPhase::Initiated),
            ProviderStatus::Ringing => Some(CallPhase::Ringing),
            ProviderStatus::Answered => Some(CallPhase::Answered),
            ProviderStatus::InProgress => Some(CallPhase::InProgress),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Queued => "queued",
            ProviderStatus::Initiated => "initiated",
            ProviderStatus::Ringing => "ringing",
            ProviderStatus::InProgress => "in-progress",
            ProviderStatus::Answered => "answered",
            ProviderStatus::Completed => "completed",
            ProviderStatus::Busy => "busy",
            ProviderStatus::NoAnswer => "no-answer",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Provider reported a terminal status
    Provider(ProviderStatus),
    /// Max call duration elapsed
    Timeout,
    /// Keypad attempts exhausted
    InputExhausted,
    /// Explicit hangup or cleanup request
    Explicit(String),
}

impl TerminationReason {
    pub fn as_str(&self) -> String {
        match self {
            TerminationReason::Provider(status) => format!("provider:{}", status),
            TerminationReason::Timeout => "timeout".to_string(),
            TerminationReason::InputExhausted => "input_exhausted".to_string(),
            TerminationReason::Explicit(reason) => format!("explicit:{}", reason),
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            TerminationReason::Provider(status) => status.is_failure(),
            TerminationReason::Timeout | TerminationReason::InputExhausted => true,
            TerminationReason::Explicit(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_parse_normalizes() {
        assert_eq!(ProviderStatus::parse("RINGING").unwrap(), ProviderStatus::Ringing);
        assert_eq!(
            ProviderStatus::parse(" In_Progress ").unwrap(),
            ProviderStatus::InProgress
        );
        assert_eq!(ProviderStatus::parse("no answer").unwrap(), ProviderStatus::NoAnswer);
        assert_eq!(ProviderStatus::parse("cancelled").unwrap(), ProviderStatus::Canceled);
        assert!(ProviderStatus::parse("").is_err());
        assert!(ProviderStatus::parse("on-hold").is_err());
    }

    #[test]
    fn test_provider_status_order() {
        let ordered = [
            ProviderStatus::Queued,
            ProviderStatus::Initiated,
            ProviderStatus::Ringing,
            ProviderStatus::InProgress,
            ProviderStatus::Answered,
            ProviderStatus::Completed,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].rank() < pair[1].rank(), "{:?}", pair);
        }
        assert!(ProviderStatus::Busy.is_terminal());
        assert!(ProviderStatus::Busy.is_failure());
        assert!(ProviderStatus::Completed.is_terminal());
        assert!(!ProviderStatus::Completed.is_failure());
        assert!(!ProviderStatus::Answered.is_terminal());
    }

    #[test]
    fn test_valid_phase_transitions() {
        use CallPhase::*;

        assert!(Initiated.can_transition_to(&Ringing));
        assert!(Initiated.can_transition_to(&InProgress));
        assert!(Ringing.can_transition_to(&Answered));
        assert!(InProgress.can_transition_to(&CollectingInput));
        assert!(CollectingInput.can_transition_to(&Validating));
        assert!(Validating.can_transition_to(&Success));
        assert!(Validating.can_transition_to(&CollectingInput));
        assert!(Validating.can_transition_to(&Fail));
        assert!(Success.can_transition_to(&Completed));
        assert!(Fail.can_transition_to(&Completed));
        assert!(Ringing.can_transition_to(&Fail));
        assert!(CollectingInput.can_transition_to(&Completed));
    }

    #[test]
    fn test_invalid_phase_transitions() {
        use CallPhase::*;

        assert!(!InProgress.can_transition_to(&Ringing));
        assert!(!Answered.can_transition_to(&Initiated));
        assert!(!CollectingInput.can_transition_to(&Success));
        assert!(!Success.can_transition_to(&Fail));
        assert!(!Fail.can_transition_to(&CollectingInput));
        assert!(!Completed.can_transition_to(&Fail));
        assert!(!Completed.can_transition_to(&Completed));
    }

    #[test]
    fn test_call_type_parse() {
        assert_eq!("otp".parse::<CallType>().unwrap(), CallType::Verification);
        assert_eq!(
            "pure-collection".parse::<CallType>().unwrap(),
            CallType::PureCollection
        );
        assert_eq!(
            "Conversational".parse::<CallType>().unwrap(),
            CallType::Conversational
        );
        assert!("fax".parse::<CallType>().is_err());
    }
}
