//! In-memory dead-letter queue for operations that exhausted their retries.
//!
//! The queue owns its items: callers can read and remove entries, but attempt
//! counters only move through [`DeadLetterQueue::update_attempt`] and the
//! replay helpers. One queue is constructed per engine and injected, so tests
//! and concurrent engines never share state.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tenure_types::dead_letter::{DeadLetterItem, DeadLetterStats};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter item not found: {0}")]
    NotFound(Uuid),
}

/// Result of replaying one queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The operation succeeded and the item was removed.
    Recovered,
    /// The operation failed again; the item stays queued with a bumped counter.
    StillFailing { attempts: u32, error: String },
}

/// Totals from a bulk replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub recovered: usize,
    pub still_failing: usize,
}

/// Concurrent dead-letter store keyed by item ID.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    items: DashMap<Uuid, DeadLetterItem>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failed operation and return the stored item.
    pub fn add(
        &self,
        operation_type: &str,
        payload: Value,
        last_error: &str,
        attempts: u32,
        metadata: HashMap<String, Value>,
    ) -> DeadLetterItem {
        let now = Utc::now();
        let item = DeadLetterItem {
            id: Uuid::now_v7(),
            operation_type: operation_type.to_string(),
            payload,
            last_error: last_error.to_string(),
            attempts,
            created_at: now,
            last_attempt_at: now,
            metadata,
        };
        self.items.insert(item.id, item.clone());
        item
    }

    pub fn get(&self, id: &Uuid) -> Option<DeadLetterItem> {
        self.items.get(id).map(|entry| entry.value().clone())
    }

    /// All items, oldest first.
    pub fn get_all(&self) -> Vec<DeadLetterItem> {
        let mut items: Vec<DeadLetterItem> =
            self.items.iter().map(|entry| entry.value().clone()).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    pub fn get_by_type(&self, operation_type: &str) -> Vec<DeadLetterItem> {
        self.get_all()
            .into_iter()
            .filter(|item| item.operation_type == operation_type)
            .collect()
    }

    pub fn remove(&self, id: &Uuid) -> Option<DeadLetterItem> {
        self.items.remove(id).map(|(_, item)| item)
    }

    /// Record another failed attempt against an item.
    pub fn update_attempt(&self, id: &Uuid, error: &str) -> Option<DeadLetterItem> {
        let mut entry = self.items.get_mut(id)?;
        entry.attempts += 1;
        entry.last_error = error.to_string();
        entry.last_attempt_at = Utc::now();
        Some(entry.value().clone())
    }

    pub fn stats(&self) -> DeadLetterStats {
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for entry in self.items.iter() {
            let item = entry.value();
            *by_type.entry(item.operation_type.clone()).or_default() += 1;
            oldest = Some(oldest.map_or(item.created_at, |o| o.min(item.created_at)));
            newest = Some(newest.map_or(item.created_at, |n| n.max(item.created_at)));
        }

        DeadLetterStats {
            total: by_type.values().sum(),
            by_type,
            oldest,
            newest,
        }
    }

    /// Drop every item. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replay one item. Success removes it; failure bumps its attempt count.
    pub async fn retry_dead_letter<T, E, F, Fut>(
        &self,
        id: &Uuid,
        operation: F,
    ) -> Result<ReplayOutcome, DeadLetterError>
    where
        F: FnOnce(DeadLetterItem) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let item = self.get(id).ok_or(DeadLetterError::NotFound(*id))?;
        let operation_type = item.operation_type.clone();

        match operation(item).await {
            Ok(_) => {
                self.remove(id);
                tracing::info!(
                    dead_letter_id = %id,
                    operation = operation_type.as_str(),
                    "dead-letter item recovered"
                );
                Ok(ReplayOutcome::Recovered)
            }
            Err(err) => {
                let error = err.to_string();
                let updated = self
                    .update_attempt(id, &error)
                    .ok_or(DeadLetterError::NotFound(*id))?;
                tracing::warn!(
                    dead_letter_id = %id,
                    operation = operation_type.as_str(),
                    attempts = updated.attempts,
                    error = error.as_str(),
                    "dead-letter replay failed"
                );
                Ok(ReplayOutcome::StillFailing {
                    attempts: updated.attempts,
                    error,
                })
            }
        }
    }

    /// Replay every item of one operation type, oldest first.
    pub async fn retry_all_of_type<T, E, F, Fut>(
        &self,
        operation_type: &str,
        mut operation: F,
    ) -> ReplaySummary
    where
        F: FnMut(DeadLetterItem) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut summary = ReplaySummary::default();
        for item in self.get_by_type(operation_type) {
            match self.retry_dead_letter(&item.id, &mut operation).await {
                Ok(ReplayOutcome::Recovered) => summary.recovered += 1,
                Ok(ReplayOutcome::StillFailing { .. }) => summary.still_failing += 1,
                // Removed concurrently; nothing left to replay.
                Err(DeadLetterError::NotFound(_)) => {}
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
