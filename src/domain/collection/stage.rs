//! Per-stage keypad collection

use super::digits::{self, DtmfKey};
use super::outcome::InputOutcome;
use super::scenario::{ScenarioDefinition, ScenarioPrompts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Collection progress of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Collecting,
    Completed,
    Exhausted,
}

/// Result of appending keystrokes to the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResult {
    /// Digits buffered, waiting for more
    Buffered,
    /// A terminator key arrived, the buffer is ready to flush
    Terminated,
    /// Same delivery seen before
    Duplicate,
    /// Stage no longer accepts input
    Frozen,
}

/// Judgement on one complete entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageVerdict {
    Accepted {
        value: String,
        digit_count: usize,
        attempts: u32,
        duration: Duration,
    },
    Retry {
        remaining: u32,
        attempts: u32,
    },
    Exhausted {
        attempts: u32,
    },
}

/// Tracks one keypad collection stage of a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCollector {
    stage_key: String,
    scenario: String,
    digits_buffer: String,
    attempts: u32,
    max_attempts: u32,
    expected_length: usize,
    timeout_seconds: u64,
    prompts: ScenarioPrompts,
    status: StageStatus,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    #[serde(skip)]
    seen_deliveries: HashSet<String>,
    #[serde(skip)]
    settled: Option<(String, InputOutcome)>,
}

impl StageCollector {
    pub fn from_scenario(stage_key: impl Into<String>, scenario: &ScenarioDefinition) -> Self {
        let now = Utc::now();
        Self {
            stage_key: stage_key.into(),
            scenario: scenario.name.clone(),
            digits_buffer: String::new(),
            attempts: 0,
            max_attempts: scenario.max_retries.max(1),
            expected_length: scenario.digit_length,
            timeout_seconds: scenario.timeout_seconds,
            prompts: scenario.prompts.clone(),
            status: StageStatus::Collecting,
            created_at: now,
            last_updated_at: now,
            seen_deliveries: HashSet::new(),
            settled: None,
        }
    }

    /// Append keystrokes delivered by one webhook.
    ///
    /// `delivery_id` identifies the provider delivery; a repeated id is
    /// ignored. Everything after a `#` in the increment is dropped.
    pub fn append(&mut self, increment: &str, delivery_id: Option<&str>) -> AppendResult {
        if self.status != StageStatus::Collecting {
            return AppendResult::Frozen;
        }
        if let Some(id) = delivery_id {
            if !self.seen_deliveries.insert(id.to_string()) {
                return AppendResult::Duplicate;
            }
        }

        self.last_updated_at = Utc::now();
        for c in increment.chars() {
            self.digits_buffer.push(c);
            if DtmfKey::from_char(c).is_some_and(|k| k.is_terminator()) {
                return AppendResult::Terminated;
            }
        }
        AppendResult::Buffered
    }

    /// Take the buffered keystrokes as one complete entry
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.digits_buffer)
    }

    /// Format check: digits only (after `*`/`#`) and exactly the expected length
    pub fn is_well_formed(&self, entry: &str) -> bool {
        digits::validate(entry, self.expected_length)
    }

    /// Count one evaluated entry. `accepted` is the caller's final judgement
    /// (format plus any expected-value check).
    pub fn register_attempt(&mut self, entry: &str, accepted: bool) -> StageVerdict {
        debug_assert_eq!(self.status, StageStatus::Collecting);

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_updated_at = Utc::now();

        if accepted {
            self.status = StageStatus::Completed;
            let value = digits::strip_structural(entry);
            let duration = (self.last_updated_at - self.created_at)
                .to_std()
                .unwrap_or_default();
            return StageVerdict::Accepted {
                digit_count: value.chars().count(),
                value,
                attempts: self.attempts,
                duration,
            };
        }

        if self.attempts >= self.max_attempts {
            self.status = StageStatus::Exhausted;
            StageVerdict::Exhausted {
                attempts: self.attempts,
            }
        } else {
            StageVerdict::Retry {
                remaining: self.max_attempts - self.attempts,
                attempts: self.attempts,
            }
        }
    }

    /// Remember the outcome that settled this stage so a redelivered entry
    /// gets the same answer
    pub fn settle(&mut self, entry: &str, outcome: &InputOutcome) {
        self.settled = Some((entry.to_string(), outcome.clone()));
    }

    /// Outcome previously returned for exactly this entry, if the stage is settled
    pub fn replay(&self, entry: &str) -> Option<InputOutcome> {
        match &self.settled {
            Some((settled_entry, outcome)) if settled_entry == entry => {
                Some(outcome.clone().as_duplicate())
            }
            _ => None,
        }
    }

    pub fn settled_outcome(&self) -> Option<&InputOutcome> {
        self.settled.as_ref().map(|(_, outcome)| outcome)
    }

    pub fn stage_key(&self) -> &str {
        &self.stage_key
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn buffer(&self) -> &str {
        &self.digits_buffer
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn expected_length(&self) -> usize {
        self.expected_length
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    pub fn prompts(&self) -> &ScenarioPrompts {
        &self.prompts
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn is_collecting(&self) -> bool {
        self.status == StageStatus::Collecting
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_updated_at(&self) -> DateTime<Utc> {
        self.last_updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::collection::scenario::ScenarioCatalog;

    fn paypal_stage() -> StageCollector {
        let catalog = ScenarioCatalog::builtin();
        StageCollector::from_scenario("paypal", catalog.get("paypal").unwrap())
    }

    fn evaluate(stage: &mut StageCollector, entry: &str) -> StageVerdict {
        let ok = stage.is_well_formed(entry);
        stage.register_attempt(entry, ok)
    }

    #[test]
    fn test_wrong_length_then_valid() {
        let mut stage = paypal_stage();

        assert_eq!(
            evaluate(&mut stage, "12345"),
            StageVerdict::Retry {
                remaining: 2,
                attempts: 1
            }
        );

        match evaluate(&mut stage, "123456") {
            StageVerdict::Accepted {
                value,
                digit_count,
                attempts,
                ..
            } => {
                assert_eq!(value, "123456");
                assert_eq!(digit_count, 6);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert_eq!(stage.status(), StageStatus::Completed);
        assert_eq!(stage.append("1", None), AppendResult::Frozen);
    }

    #[test]
    fn test_exhaustion_after_max_attempts() {
        let mut stage = paypal_stage();

        assert!(matches!(evaluate(&mut stage, ""), StageVerdict::Retry { remaining: 2, .. }));
        assert!(matches!(evaluate(&mut stage, "1"), StageVerdict::Retry { remaining: 1, .. }));
        assert_eq!(
            evaluate(&mut stage, "abc"),
            StageVerdict::Exhausted { attempts: 3 }
        );
        assert!(stage.attempts() <= stage.max_attempts());
        assert_eq!(stage.status(), StageStatus::Exhausted);
        assert_eq!(stage.remaining(), 0);
    }

    #[test]
    fn test_append_buffers_until_terminator() {
        let mut stage = paypal_stage();

        assert_eq!(stage.append("1", Some("d1")), AppendResult::Buffered);
        assert_eq!(stage.append("2", Some("d2")), AppendResult::Buffered);
        assert_eq!(stage.append("34#99", Some("d3")), AppendResult::Terminated);
        assert_eq!(stage.flush(), "1234#");
        assert_eq!(stage.buffer(), "");
    }

    #[test]
    fn test_redelivered_increment_ignored() {
        let mut stage = paypal_stage();

        assert_eq!(stage.append("1", Some("evt-1")), AppendResult::Buffered);
        assert_eq!(stage.append("1", Some("evt-1")), AppendResult::Duplicate);
        assert_eq!(stage.append("1", Some("evt-2")), AppendResult::Buffered);
        assert_eq!(stage.buffer(), "11");
    }

    #[test]
    fn test_replay_settled_entry() {
        let mut stage = paypal_stage();
        let verdict = evaluate(&mut stage, "123456");
        assert!(matches!(verdict, StageVerdict::Accepted { .. }));

        let outcome = InputOutcome::complete(
            "paypal",
            6,
            1,
            "done",
            crate::domain::collection::outcome::CallAction::Hangup,
        );
        stage.settle("123456", &outcome);

        let replayed = stage.replay("123456").unwrap();
        assert!(replayed.duplicate);
        assert_eq!(replayed.digit_count, Some(6));
        assert!(stage.replay("654321").is_none());
    }
}
