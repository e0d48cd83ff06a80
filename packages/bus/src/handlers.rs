//! ACGS-Bus: Handler Execution
//!
//! Handlers register per message type and run sequentially; each returns a
//! [`ValidationResult`] merged into the running verdict. A handler error
//! (including a deadline breach) aborts the remainder under
//! `fail_closed`, or is recorded and skipped otherwise. The execution
//! policy comes from a narrow environment interface rather than any
//! concrete config type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::{Message, MessageType, ValidationResult};

/// Per-message-type handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, message: &Message) -> Result<ValidationResult, BusError>;
}

/// The slice of configuration handler execution needs.
pub trait ExecutionEnv: Send + Sync {
    fn fail_closed(&self) -> bool;
    fn handler_deadline(&self) -> Duration;
}

impl ExecutionEnv for BusConfig {
    fn fail_closed(&self) -> bool {
        self.fail_closed
    }

    fn handler_deadline(&self) -> Duration {
        Duration::from_millis(self.handler_deadline_ms)
    }
}

/// What execution produced: the merged verdict plus the handler failures
/// observed along the way (deadline breaches and returned errors).
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub result: ValidationResult,
    pub handler_failures: Vec<String>,
}

impl ExecutionOutcome {
    pub fn failed(&self) -> bool {
        !self.handler_failures.is_empty()
    }
}

/// Registry of handlers keyed by message type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<MessageType, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(message_type).or_default().push(handler);
    }

    pub fn count(&self, message_type: MessageType) -> usize {
        self.handlers.get(&message_type).map_or(0, |h| h.len())
    }

    /// Run every handler for the message's type, sequentially, merging
    /// results. Cancellation arrives through the caller's deadline on the
    /// whole execution; individual handlers additionally get the
    /// per-handler deadline from `env`.
    pub async fn execute(&self, env: &dyn ExecutionEnv, message: &Message) -> ExecutionOutcome {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .get(&message.message_type)
            .map(|h| h.clone())
            .unwrap_or_default();

        let mut outcome = ExecutionOutcome::default();
        for handler in handlers {
            let ran =
                tokio::time::timeout(env.handler_deadline(), handler.handle(message)).await;
            match ran {
                Ok(Ok(result)) => outcome.result.merge(result),
                Ok(Err(err)) => {
                    let failure = format!("{}: {err}", handler.name());
                    tracing::warn!(handler = handler.name(), error = %err, "handler failed");
                    outcome.handler_failures.push(failure.clone());
                    outcome.result.errors.push(failure);
                    if env.fail_closed() {
                        outcome.result.valid = false;
                        break;
                    }
                }
                Err(_) => {
                    let failure =
                        format!("{}: deadline exceeded", handler.name());
                    tracing::warn!(handler = handler.name(), "handler deadline exceeded");
                    outcome.handler_failures.push(failure.clone());
                    outcome.result.errors.push(failure);
                    if env.fail_closed() {
                        outcome.result.valid = false;
                        break;
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    struct TestEnv {
        fail_closed: bool,
        deadline: Duration,
    }

    impl ExecutionEnv for TestEnv {
        fn fail_closed(&self) -> bool {
            self.fail_closed
        }
        fn handler_deadline(&self) -> Duration {
            self.deadline
        }
    }

    struct OkHandler(f64);

    #[async_trait]
    impl MessageHandler for OkHandler {
        fn name(&self) -> &str {
            "ok"
        }
        async fn handle(&self, _message: &Message) -> Result<ValidationResult, BusError> {
            Ok(ValidationResult {
                impact_score: self.0,
                ..Default::default()
            })
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }
        async fn handle(&self, _message: &Message) -> Result<ValidationResult, BusError> {
            Err(BusError::HandlerFailed("boom".into()))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        fn name(&self) -> &str {
            "slow"
        }
        async fn handle(&self, _message: &Message) -> Result<ValidationResult, BusError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ValidationResult::default())
        }
    }

    struct DenyHandler;

    #[async_trait]
    impl MessageHandler for DenyHandler {
        fn name(&self) -> &str {
            "deny"
        }
        async fn handle(&self, _message: &Message) -> Result<ValidationResult, BusError> {
            Ok(ValidationResult::invalid("content rejected"))
        }
    }

    fn message() -> Message {
        Message::builder("agent-a", MessageType::Query)
            .fingerprint("cdd01ef066bc6cf2")
            .build()
            .unwrap()
    }

    fn env(fail_closed: bool) -> TestEnv {
        TestEnv {
            fail_closed,
            deadline: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn results_merge_across_handlers() {
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Query, Arc::new(OkHandler(0.2)));
        registry.register(MessageType::Query, Arc::new(OkHandler(0.6)));

        let outcome = registry.execute(&env(true), &message()).await;
        assert!(outcome.result.valid);
        assert!(!outcome.failed());
        assert!((outcome.result.impact_score - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn no_handlers_is_trivially_valid() {
        let registry = HandlerRegistry::new();
        let outcome = registry.execute(&env(true), &message()).await;
        assert!(outcome.result.valid);
    }

    #[tokio::test]
    async fn fail_closed_aborts_remainder() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Recording(Arc<AtomicBool>);

        #[async_trait]
        impl MessageHandler for Recording {
            async fn handle(&self, _m: &Message) -> Result<ValidationResult, BusError> {
                self.0.store(true, Ordering::SeqCst);
                Ok(ValidationResult::default())
            }
        }

        let reached = Arc::new(AtomicBool::new(false));
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Query, Arc::new(FailingHandler));
        registry.register(MessageType::Query, Arc::new(Recording(reached.clone())));

        let outcome = registry.execute(&env(true), &message()).await;
        assert!(!outcome.result.valid);
        assert!(outcome.failed());
        assert!(!reached.load(Ordering::SeqCst), "remainder must not run");
    }

    #[tokio::test]
    async fn fail_open_continues_and_stays_valid() {
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Query, Arc::new(FailingHandler));
        registry.register(MessageType::Query, Arc::new(OkHandler(0.3)));

        let outcome = registry.execute(&env(false), &message()).await;
        assert!(outcome.result.valid, "fail-open keeps the result valid");
        assert!(outcome.failed());
        assert_eq!(outcome.handler_failures.len(), 1);
        assert!((outcome.result.impact_score - 0.3).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn handler_invalidation_is_not_a_failure() {
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Query, Arc::new(DenyHandler));

        let outcome = registry.execute(&env(true), &message()).await;
        assert!(!outcome.result.valid);
        assert!(!outcome.failed(), "a deny verdict is not a handler failure");
    }

    #[tokio::test]
    async fn deadline_breach_counts_as_error() {
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Query, Arc::new(SlowHandler));

        let outcome = registry.execute(&env(true), &message()).await;
        assert!(!outcome.result.valid);
        assert!(outcome.handler_failures[0].contains("deadline"));
    }
}
