//! Retry bookkeeping and dead-letter queue types.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// State carried between attempts of a retried operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Sum of all backoff delays slept so far.
    pub total_delay_ms: u64,
}

/// An operation that exhausted all retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub id: Uuid,
    /// Operation type tag, e.g. `process_status_sync`.
    pub operation_type: String,
    pub payload: Value,
    pub last_error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Aggregate view of the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
}

/// Result of a retried operation.
#[derive(Debug, Clone)]
pub enum RetryOutcome<T> {
    Succeeded {
        value: T,
        attempts: u32,
    },
    /// All attempts failed; the operation was queued under `dead_letter_id`.
    DeadLettered {
        dead_letter_id: Uuid,
        attempts: u32,
        last_error: String,
    },
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::DeadLettered { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn dead_letter_id(&self) -> Option<Uuid> {
        match self {
            RetryOutcome::DeadLettered { dead_letter_id, .. } => Some(*dead_letter_id),
            RetryOutcome::Succeeded { .. } => None,
        }
    }
}
