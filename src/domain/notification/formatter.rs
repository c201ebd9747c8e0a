//! Human-readable text for session events

use crate::domain::call::event::SessionEvent;
use crate::domain::call::value_object::{CallPhase, ProviderStatus};

/// Render the message sent to the messaging channel. Collected values are
/// never included, only counts.
pub fn render(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StatusChanged(e) => {
            let mut text = format!("Call {}: {}", e.base.call_id, describe_status(e.status));
            if let Some(seconds) = e.duration_seconds {
                text.push_str(&format!(" ({}s)", seconds));
            }
            if let Some(error) = &e.error {
                text.push_str(&format!(" - {}", error));
            }
            text
        }
        SessionEvent::StageCompleted(e) => format!(
            "Call {}: {} input received ({} digits, attempt {})",
            e.base.call_id, e.stage_key, e.digit_count, e.attempts
        ),
        SessionEvent::InputFailed(e) => format!(
            "Call {}: {} input failed after {} attempts",
            e.base.call_id, e.stage_key, e.attempts
        ),
        SessionEvent::Finalized(e) => {
            let outcome = match e.outcome {
                CallPhase::Success => "succeeded",
                CallPhase::Fail => "failed",
                _ => "ended",
            };
            format!(
                "Call {} {} ({}, {}s)",
                e.base.call_id,
                outcome,
                e.reason.as_str(),
                e.duration_seconds
            )
        }
    }
}

fn describe_status(status: ProviderStatus) -> &'static str {
    match status {
        ProviderStatus::Queued => "queued",
        ProviderStatus::Initiated => "dialing",
        ProviderStatus::Ringing => "ringing",
        ProviderStatus::InProgress => "in progress",
        ProviderStatus::Answered => "answered",
        ProviderStatus::Completed => "completed",
        ProviderStatus::Busy => "line busy",
        ProviderStatus::NoAnswer => "no answer",
        ProviderStatus::Failed => "call failed",
        ProviderStatus::Canceled => "canceled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::event::{SessionEventBase, SessionFinalized, StatusChanged};
    use crate::domain::call::value_object::TerminationReason;
    use crate::domain::shared::value_objects::CallId;

    #[test]
    fn test_render_status_and_outcome() {
        let id = CallId::parse("CA9").unwrap();
        let status = SessionEvent::StatusChanged(StatusChanged {
            base: SessionEventBase::new("session.status_changed", &id, None),
            status: ProviderStatus::Completed,
            duration_seconds: Some(42),
            error: None,
        });
        assert_eq!(render(&status), "Call CA9: completed (42s)");

        let finalized = SessionEvent::Finalized(SessionFinalized {
            base: SessionEventBase::new("session.finalized", &id, None),
            outcome: CallPhase::Fail,
            reason: TerminationReason::Timeout,
            duration_seconds: 3600,
        });
        assert_eq!(render(&finalized), "Call CA9 failed (timeout, 3600s)");
    }
}
