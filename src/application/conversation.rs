//! Conversational turns through the completion-service breaker

use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::gateway::{CompletionContext, CompletionService};
use crate::domain::shared::error::DomainError;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Reply for one caller utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub text: String,
    /// Served from the fallback, the completion service was not usable
    pub degraded: bool,
}

/// Calls the completion service with a per-call timeout. The breaker is
/// shared by every session; a timeout counts as a failure.
pub struct ConversationService {
    completion: Arc<dyn CompletionService>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    fallback: String,
}

impl ConversationService {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            completion,
            breaker,
            timeout,
            fallback: fallback.into(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Run one turn. Never fails: an open breaker, a timeout or a collaborator
    /// error all degrade to the fallback text.
    pub async fn respond(&self, prompt: &str, context: &CompletionContext) -> TurnReply {
        let completion = self.completion.clone();
        let timeout = self.timeout;
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, completion.complete(prompt, context)).await {
                    Ok(result) => result,
                    Err(_) => Err(DomainError::completion(format!(
                        "no reply within {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
            .await;

        match result {
            Ok(text) if !text.trim().is_empty() => {
                counter!("completion_turns_total", "result" => "ok").increment(1);
                TurnReply {
                    text,
                    degraded: false,
                }
            }
            Ok(_) => {
                counter!("completion_turns_total", "result" => "empty").increment(1);
                self.degraded()
            }
            Err(DomainError::CircuitOpen(_)) => {
                counter!("completion_turns_total", "result" => "short_circuit").increment(1);
                self.degraded()
            }
            Err(e) => {
                let call_id = context.call_id.as_ref().map(|c| c.to_string());
                warn!(call_id = ?call_id, error = %e, "Completion failed, serving fallback");
                counter!("completion_turns_total", "result" => "error").increment(1);
                self.degraded()
            }
        }
    }

    fn degraded(&self) -> TurnReply {
        TurnReply {
            text: self.fallback.clone(),
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::circuit_breaker::{BreakerState, CircuitBreakerConfig};
    use crate::domain::gateway::MockCompletionService;

    fn service(mock: MockCompletionService, threshold: u32) -> ConversationService {
        let breaker = Arc::new(CircuitBreaker::new(
            "completion",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(30),
            },
        ));
        ConversationService::new(
            Arc::new(mock),
            breaker,
            Duration::from_millis(100),
            "Sorry, I am temporarily unavailable.",
        )
    }

    #[tokio::test]
    async fn test_reply_passes_through() {
        let mut mock = MockCompletionService::new();
        mock.expect_complete()
            .returning(|prompt, _| Ok(format!("echo: {}", prompt)));
        let svc = service(mock, 3);

        let reply = svc.respond("hello", &CompletionContext::default()).await;
        assert_eq!(reply.text, "echo: hello");
        assert!(!reply.degraded);
    }

    #[tokio::test]
    async fn test_outage_degrades_then_short_circuits() {
        let mut mock = MockCompletionService::new();
        mock.expect_complete()
            .times(2)
            .returning(|_, _| Err(DomainError::completion("503")));
        let svc = service(mock, 2);

        for _ in 0..2 {
            let reply = svc.respond("hi", &CompletionContext::default()).await;
            assert!(reply.degraded);
        }
        assert_eq!(svc.breaker().state(), BreakerState::Open);

        // breaker open: the mock is not called a third time
        let reply = svc.respond("hi", &CompletionContext::default()).await;
        assert_eq!(reply.text, "Sorry, I am temporarily unavailable.");
    }
}
