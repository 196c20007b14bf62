//! Event-id deduplication
//!
//! Stripe delivers at least once. Before an event is queued its id is
//! recorded here; a second delivery of an id that is still processing or
//! already done is acknowledged without being queued again. Failed events are
//! kept with their error so operators can find them, and may be retried if
//! Stripe (or an operator replay) delivers them again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::stripe::error::StripeWebhookResult;

/// Processing state of an event id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Queued or being reconciled
    Processing,
    /// Reconciled (or deliberately skipped)
    Completed,
    /// Gave up; the message is the last error
    Failed(String),
}

/// Result of recording a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First time this id is seen
    New,
    /// Id is already processing or completed
    Duplicate,
    /// Id failed before and is being tried again
    Retry,
}

impl RecordOutcome {
    /// Whether the event should be queued
    pub fn should_process(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// A failed event kept for follow-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEvent {
    /// Stripe event id
    pub event_id: String,
    /// Last error message
    pub error: String,
}

/// Storage for event processing state
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Record a delivery of `event_id` and mark it processing
    async fn check_and_record(&self, event_id: &str) -> StripeWebhookResult<RecordOutcome>;

    /// Mark an event as done
    async fn mark_completed(&self, event_id: &str) -> StripeWebhookResult<()>;

    /// Mark an event as failed with `error`
    async fn mark_failed(&self, event_id: &str, error: &str) -> StripeWebhookResult<()>;

    /// Forget an event so the next delivery is treated as new
    async fn release(&self, event_id: &str) -> StripeWebhookResult<()>;

    /// Current status of an event
    async fn status(&self, event_id: &str) -> StripeWebhookResult<Option<EventStatus>>;

    /// Events that ended in failure
    async fn failed_events(&self) -> StripeWebhookResult<Vec<FailedEvent>>;
}

#[derive(Debug)]
struct Entry {
    status: EventStatus,
    recorded_at: Instant,
}

/// In-memory idempotency store with TTL and size bound
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    max_entries: usize,
}

impl InMemoryIdempotencyStore {
    /// Create a store remembering ids for `ttl`, at most `max_entries` of them
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no ids are remembered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, entries: &mut HashMap<String, Entry>) {
        let ttl = self.ttl;
        entries.retain(|_, e| e.recorded_at.elapsed() < ttl);

        while entries.len() >= self.max_entries {
            // Failed entries are evicted last; they are the ones operators need.
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| (matches!(e.status, EventStatus::Failed(_)), e.recorded_at))
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    entries.remove(&id);
                }
                None => break,
            }
        }
    }

    fn set_status(&self, event_id: &str, status: EventStatus) {
        let mut entries = self.entries.lock();
        match entries.get_mut(event_id) {
            Some(entry) => entry.status = status,
            None => {
                self.evict(&mut entries);
                entries.insert(
                    event_id.to_string(),
                    Entry {
                        status,
                        recorded_at: Instant::now(),
                    },
                );
            }
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_record(&self, event_id: &str) -> StripeWebhookResult<RecordOutcome> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(event_id) {
            if entry.recorded_at.elapsed() < self.ttl {
                return Ok(match entry.status {
                    EventStatus::Failed(_) => {
                        entry.status = EventStatus::Processing;
                        RecordOutcome::Retry
                    }
                    _ => RecordOutcome::Duplicate,
                });
            }
        }

        self.evict(&mut entries);
        entries.insert(
            event_id.to_string(),
            Entry {
                status: EventStatus::Processing,
                recorded_at: Instant::now(),
            },
        );
        Ok(RecordOutcome::New)
    }

    async fn mark_completed(&self, event_id: &str) -> StripeWebhookResult<()> {
        self.set_status(event_id, EventStatus::Completed);
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> StripeWebhookResult<()> {
        self.set_status(event_id, EventStatus::Failed(error.to_string()));
        Ok(())
    }

    async fn release(&self, event_id: &str) -> StripeWebhookResult<()> {
        self.entries.lock().remove(event_id);
        Ok(())
    }

    async fn status(&self, event_id: &str) -> StripeWebhookResult<Option<EventStatus>> {
        Ok(self
            .entries
            .lock()
            .get(event_id)
            .map(|entry| entry.status.clone()))
    }

    async fn failed_events(&self) -> StripeWebhookResult<Vec<FailedEvent>> {
        let mut failed: Vec<FailedEvent> = self
            .entries
            .lock()
            .iter()
            .filter_map(|(id, entry)| match &entry.status {
                EventStatus::Failed(error) => Some(FailedEvent {
                    event_id: id.clone(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect();
        failed.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        Ok(failed)
    }
}
