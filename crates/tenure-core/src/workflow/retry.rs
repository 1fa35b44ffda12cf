//! Exponential backoff and the retry-with-dead-letter wrapper.
//!
//! [`RetryHandler`] holds the stateless backoff arithmetic shared by step
//! retries and collaborator calls. [`retry_with_dead_letter`] runs an
//! operation up to `max_retries + 1` times and, when every attempt fails,
//! queues a [`DeadLetterItem`](tenure_types::dead_letter::DeadLetterItem)
//! instead of dropping the work.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tenure_types::dead_letter::{RetryContext, RetryOutcome};
use tenure_types::workflow::RetryPolicy;

use super::dead_letter::DeadLetterQueue;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless backoff calculations.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt follows the failed `attempt` (1-based).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts()
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    ///
    /// `min(initial_delay_ms * backoff_multiplier^(attempt - 1), max_delay_ms)`
    pub fn delay_after(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(policy.max_delay_ms as f64)
        } else {
            policy.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0).round() as u64)
    }

    /// Every delay the policy sleeps through when all attempts fail, in ms.
    pub fn delay_schedule(policy: &RetryPolicy) -> Vec<u64> {
        (1..policy.max_attempts())
            .map(|attempt| Self::delay_after(policy, attempt).as_millis() as u64)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// retry_with_dead_letter
// ---------------------------------------------------------------------------

/// What to queue when every attempt fails.
#[derive(Debug, Clone)]
pub struct DeadLetterRequest {
    pub operation_type: String,
    pub payload: Value,
    pub metadata: HashMap<String, Value>,
}

impl DeadLetterRequest {
    pub fn new(operation_type: &str, payload: Value) -> Self {
        Self {
            operation_type: operation_type.to_string(),
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Run `operation` with exponential backoff; queue it on exhaustion.
///
/// The operation receives the current [`RetryContext`] (attempt number,
/// previous error, delay slept so far).
pub async fn retry_with_dead_letter<T, E, F, Fut>(
    queue: &DeadLetterQueue,
    policy: &RetryPolicy,
    request: DeadLetterRequest,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut ctx = RetryContext {
        attempt: 1,
        max_attempts: policy.max_attempts(),
        last_error: None,
        total_delay_ms: 0,
    };

    loop {
        match operation(ctx.clone()).await {
            Ok(value) => {
                if ctx.attempt > 1 {
                    tracing::info!(
                        operation = request.operation_type.as_str(),
                        attempt = ctx.attempt,
                        "operation succeeded after retry"
                    );
                }
                return RetryOutcome::Succeeded {
                    value,
                    attempts: ctx.attempt,
                };
            }
            Err(err) => {
                let message = err.to_string();
                if !RetryHandler::should_retry(policy, ctx.attempt) {
                    let item = queue.add(
                        &request.operation_type,
                        request.payload,
                        &message,
                        ctx.attempt,
                        request.metadata,
                    );
                    tracing::warn!(
                        operation = item.operation_type.as_str(),
                        attempts = item.attempts,
                        dead_letter_id = %item.id,
                        error = message.as_str(),
                        "operation exhausted retries, queued to dead-letter queue"
                    );
                    return RetryOutcome::DeadLettered {
                        dead_letter_id: item.id,
                        attempts: item.attempts,
                        last_error: message,
                    };
                }

                let delay = RetryHandler::delay_after(policy, ctx.attempt);
                tracing::debug!(
                    operation = request.operation_type.as_str(),
                    attempt = ctx.attempt,
                    max_attempts = ctx.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = message.as_str(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;

                ctx.total_delay_ms += delay.as_millis() as u64;
                ctx.last_error = Some(message);
                ctx.attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
