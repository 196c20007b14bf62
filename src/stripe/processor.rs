//! Async Event Processing
//!
//! Handles background processing of webhook events with retry logic.
//! The webhook is acknowledged as soon as the event is queued; reconciliation
//! runs afterwards, so its failures never reach Stripe and must be recorded
//! here instead.
//!
//! # Architecture
//!
//! ```text
//! Webhook Received
//!       |
//!       v
//! [Verify Signature]
//!       |
//!       v
//! [Check Idempotency] --> Already processing/done? --> Return 200
//!       |
//!       v
//! [Queue Event] --> Return 200 (503 if the queue is full)
//!       |
//!       v
//! [Handle Event with Retries + Timeout]
//!       |
//!       v
//! [Update Idempotency Store + Stats]
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::error::{ReconcileError, ReconcileResult};
use crate::stripe::config::StripeWebhookConfig;
use crate::stripe::error::{StripeWebhookError, StripeWebhookResult};
use crate::stripe::events::StripeEvent;
use crate::stripe::idempotency::IdempotencyStore;

/// Something that reconciles one verified event
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle `event`; an `Ok` return means there is nothing left to do
    async fn handle_event(&self, event: &StripeEvent) -> ReconcileResult<()>;
}

/// Final result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Reconciled (or classified as irrelevant)
    Processed,
    /// Nothing local matched the event; acknowledged with a warning
    Unattributable(String),
    /// Gave up; the message is the last error
    Failed(String),
}

/// Counters exposed on `/status`
#[derive(Debug, Default)]
pub struct ProcessorStats {
    received: AtomicU64,
    duplicates: AtomicU64,
    processed: AtomicU64,
    unattributable: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Verified deliveries
    pub received: u64,
    /// Deliveries of an event id already processing or done
    pub duplicates: u64,
    /// Events reconciled
    pub processed: u64,
    /// Events acknowledged without a local match
    pub unattributable: u64,
    /// Events that exhausted their retries
    pub failed: u64,
    /// Retry attempts made
    pub retries: u64,
}

impl ProcessorStats {
    /// Count a verified delivery
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a duplicate delivery
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: &EventOutcome) {
        let counter = match outcome {
            EventOutcome::Processed => &self.processed,
            EventOutcome::Unattributable(_) => &self.unattributable,
            EventOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            unattributable: self.unattributable.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Event processor that handles webhook events asynchronously
pub struct EventProcessor<H: EventHandler, S: IdempotencyStore> {
    worker: Worker<H, S>,
    /// Channel for background task processing
    task_sender: mpsc::Sender<ProcessingTask>,
}

/// A processing task sent to the background worker
struct ProcessingTask {
    event: StripeEvent,
}

/// Everything needed to process one event, cloned into each task
struct Worker<H, S> {
    handler: Arc<H>,
    idempotency_store: Arc<S>,
    config: StripeWebhookConfig,
    stats: Arc<ProcessorStats>,
}

impl<H, S> Clone for Worker<H, S> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            idempotency_store: Arc::clone(&self.idempotency_store),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<H: EventHandler, S: IdempotencyStore> EventProcessor<H, S> {
    /// Create a new event processor and the handle that drives it
    pub fn new(
        handler: Arc<H>,
        idempotency_store: Arc<S>,
        config: StripeWebhookConfig,
    ) -> (Self, ProcessorHandle<H, S>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        let worker = Worker {
            handler,
            idempotency_store,
            config,
            stats: Arc::new(ProcessorStats::default()),
        };

        let handle = ProcessorHandle {
            worker: worker.clone(),
            task_receiver: rx,
        };

        (
            Self {
                worker,
                task_sender: tx,
            },
            handle,
        )
    }

    /// Queue an event for async processing
    ///
    /// Never waits for space: a full or closed queue is reported as
    /// [`StripeWebhookError::QueueUnavailable`] so the delivery can be
    /// refused and retried by Stripe.
    pub fn queue_event(&self, event: StripeEvent) -> StripeWebhookResult<()> {
        self.task_sender
            .try_send(ProcessingTask { event })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    StripeWebhookError::QueueUnavailable("event queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    StripeWebhookError::QueueUnavailable("event processor stopped".to_string())
                }
            })
    }

    /// Process an event inline, with the same retries and bookkeeping as
    /// the background worker
    pub async fn process_event_sync(&self, event: &StripeEvent) -> EventOutcome {
        self.worker.process_with_retry(event).await
    }

    /// The idempotency store shared with the worker
    pub fn idempotency_store(&self) -> &Arc<S> {
        &self.worker.idempotency_store
    }

    /// Processing counters
    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.worker.stats)
    }
}

/// Handle for running the background processor
pub struct ProcessorHandle<H: EventHandler, S: IdempotencyStore> {
    worker: Worker<H, S>,
    task_receiver: mpsc::Receiver<ProcessingTask>,
}

impl<H: EventHandler, S: IdempotencyStore> ProcessorHandle<H, S> {
    /// Run the background processor
    ///
    /// Returns once every [`EventProcessor`] has been dropped and all
    /// in-flight events have finished. This should be spawned as a tokio
    /// task:
    ///
    /// ```rust,ignore
    /// let worker = tokio::spawn(handle.run());
    /// ```
    pub async fn run(mut self) {
        tracing::info!("Starting Stripe webhook event processor");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                task = self.task_receiver.recv() => match task {
                    Some(task) => {
                        let worker = self.worker.clone();
                        // Each event runs in its own task
                        in_flight.spawn(async move {
                            worker.process_with_retry(&task.event).await;
                        });
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Event processing task panicked");
                    }
                }
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for in-flight events");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Event processing task panicked");
            }
        }

        tracing::info!("Stripe webhook event processor shutting down");
    }
}

/// Why a single attempt failed
#[derive(Debug)]
enum AttemptError {
    Reconcile(ReconcileError),
    TimedOut(Duration),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Reconcile(e) => e.is_retryable(),
            Self::TimedOut(_) => true,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconcile(e) => write!(f, "{e}"),
            Self::TimedOut(limit) => write!(f, "processing timed out after {limit:?}"),
        }
    }
}

impl<H: EventHandler, S: IdempotencyStore> Worker<H, S> {
    /// Process a single event with retry logic
    async fn process_with_retry(&self, event: &StripeEvent) -> EventOutcome {
        let config = &self.config;
        let mut attempt = 0;

        let outcome = loop {
            if attempt > 0 {
                let delay = config.retry_delay(attempt - 1);
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying event processing"
                );
                tokio::time::sleep(delay).await;
            }

            match self.process_single_event(event).await {
                Ok(()) => {
                    tracing::info!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempts = attempt + 1,
                        "Event processed successfully"
                    );
                    break EventOutcome::Processed;
                }
                Err(AttemptError::Reconcile(ReconcileError::Unattributable(reason))) => {
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        reason = %reason,
                        "Event could not be attributed to a local record; acknowledging"
                    );
                    break EventOutcome::Unattributable(reason);
                }
                Err(e) if e.is_retryable() && attempt < config.max_retries => {
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempt = attempt + 1,
                        max_retries = config.max_retries,
                        error = %e,
                        "Event processing failed"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempts = attempt + 1,
                        error = %e,
                        "Event processing failed permanently; manual reconciliation required"
                    );
                    break EventOutcome::Failed(e.to_string());
                }
            }
        };

        self.record(event, &outcome).await;
        outcome
    }

    /// Process a single attempt under the configured timeout
    async fn process_single_event(&self, event: &StripeEvent) -> Result<(), AttemptError> {
        match timeout(self.config.processing_timeout, self.handler.handle_event(event)).await {
            Ok(result) => result.map_err(AttemptError::Reconcile),
            Err(_) => Err(AttemptError::TimedOut(self.config.processing_timeout)),
        }
    }

    async fn record(&self, event: &StripeEvent, outcome: &EventOutcome) {
        self.stats.record_outcome(outcome);

        let result = match outcome {
            EventOutcome::Processed | EventOutcome::Unattributable(_) => {
                self.idempotency_store.mark_completed(&event.id).await
            }
            EventOutcome::Failed(error) => {
                self.idempotency_store.mark_failed(&event.id, error).await
            }
        };

        if let Err(e) = result {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to update idempotency store"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, StoreError};
    use crate::stripe::idempotency::{EventStatus, InMemoryIdempotencyStore};
    use std::sync::atomic::AtomicU32;

    /// Handler that fails a configurable number of times before succeeding
    struct ScriptedHandler {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> ReconcileError,
        delay: Duration,
    }

    impl ScriptedHandler {
        fn ok() -> Self {
            Self::failing(0, || ReconcileError::unattributable("unused"))
        }

        fn failing(failures: u32, error: fn() -> ReconcileError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle_event(&self, _event: &StripeEvent) -> ReconcileResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(())
        }
    }

    fn test_event(id: &str) -> StripeEvent {
        let json = format!(
            r#"{{
                "id": "{id}",
                "type": "customer.subscription.updated",
                "created": 1614556800,
                "livemode": false,
                "data": {{"object": {{"id": "sub_1", "customer": "cus_1"}}}}
            }}"#
        );
        StripeEvent::from_bytes(json.as_bytes()).unwrap()
    }

    fn setup(
        handler: ScriptedHandler,
    ) -> (
        Arc<ScriptedHandler>,
        Arc<InMemoryIdempotencyStore>,
        EventProcessor<ScriptedHandler, InMemoryIdempotencyStore>,
        ProcessorHandle<ScriptedHandler, InMemoryIdempotencyStore>,
    ) {
        let handler = Arc::new(handler);
        let store = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600), 1000));
        let (processor, handle) = EventProcessor::new(
            handler.clone(),
            store.clone(),
            StripeWebhookConfig::test_config(),
        );
        (handler, store, processor, handle)
    }

    #[tokio::test]
    async fn test_successful_event_marked_completed() {
        let (handler, store, processor, _handle) = setup(ScriptedHandler::ok());
        let event = test_event("evt_ok");
        store.check_and_record(&event.id).await.unwrap();

        assert_eq!(processor.process_event_sync(&event).await, EventOutcome::Processed);
        assert_eq!(handler.calls(), 1);
        assert_eq!(
            store.status("evt_ok").await.unwrap(),
            Some(EventStatus::Completed)
        );
        assert_eq!(processor.stats().snapshot().processed, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (handler, store, processor, _handle) = setup(ScriptedHandler::failing(2, || {
            ReconcileError::Provider(ProviderError::Api {
                status: 500,
                message: "try again".into(),
            })
        }));
        let event = test_event("evt_retry");

        assert_eq!(processor.process_event_sync(&event).await, EventOutcome::Processed);
        assert_eq!(handler.calls(), 3);
        assert_eq!(processor.stats().snapshot().retries, 2);
        assert!(store.failed_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_recorded_as_failed() {
        let (handler, store, processor, _handle) = setup(ScriptedHandler::failing(10, || {
            ReconcileError::Transaction(StoreError::Corrupt("disk".into()))
        }));
        let event = test_event("evt_fail");

        let outcome = processor.process_event_sync(&event).await;
        assert!(matches!(outcome, EventOutcome::Failed(ref msg) if msg.contains("disk")));
        // One attempt plus max_retries (2) retries
        assert_eq!(handler.calls(), 3);

        let failed = store.failed_events().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event_id, "evt_fail");
        assert_eq!(processor.stats().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_retried() {
        let (handler, _store, processor, _handle) = setup(ScriptedHandler::failing(10, || {
            ReconcileError::invalid_payload("bad session")
        }));

        let outcome = processor.process_event_sync(&test_event("evt_bad")).await;
        assert!(matches!(outcome, EventOutcome::Failed(_)));
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_unattributable_is_acknowledged() {
        let (handler, store, processor, _handle) = setup(ScriptedHandler::failing(10, || {
            ReconcileError::unattributable("no purchaseId")
        }));

        let outcome = processor.process_event_sync(&test_event("evt_orphan")).await;
        assert_eq!(outcome, EventOutcome::Unattributable("no purchaseId".into()));
        assert_eq!(handler.calls(), 1);
        assert_eq!(
            store.status("evt_orphan").await.unwrap(),
            Some(EventStatus::Completed)
        );
        assert_eq!(processor.stats().snapshot().unattributable, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut slow = ScriptedHandler::ok();
        slow.delay = Duration::from_millis(200);
        let handler = Arc::new(slow);
        let store = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600), 1000));
        let mut config = StripeWebhookConfig::test_config();
        config.processing_timeout = Duration::from_millis(10);
        config.max_retries = 0;
        let (processor, _handle) = EventProcessor::new(handler, store, config);

        let outcome = processor.process_event_sync(&test_event("evt_slow")).await;
        assert!(matches!(outcome, EventOutcome::Failed(ref msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_processor_queue_and_run() {
        let (handler, store, processor, handle) = setup(ScriptedHandler::ok());
        let worker = tokio::spawn(handle.run());

        let event = test_event("evt_queued");
        store.check_and_record(&event.id).await.unwrap();
        processor.queue_event(event).unwrap();

        // Dropping the processor closes the queue; run() drains and returns
        drop(processor);
        worker.await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(
            store.status("evt_queued").await.unwrap(),
            Some(EventStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_queue_closed_is_unavailable() {
        let (_handler, _store, processor, handle) = setup(ScriptedHandler::ok());
        drop(handle);

        let err = processor.queue_event(test_event("evt_late")).unwrap_err();
        assert!(matches!(err, StripeWebhookError::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn test_queue_full_is_unavailable() {
        let handler = Arc::new(ScriptedHandler::ok());
        let store = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600), 1000));
        let mut config = StripeWebhookConfig::test_config();
        config.queue_capacity = 1;
        let (processor, _handle) = EventProcessor::new(handler, store, config);

        processor.queue_event(test_event("evt_1")).unwrap();
        let err = processor.queue_event(test_event("evt_2")).unwrap_err();
        assert!(matches!(err, StripeWebhookError::QueueUnavailable(_)));
    }
}
