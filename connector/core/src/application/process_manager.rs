// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Process Manager - State Machine Tick Loop
//!
//! Drives persisted state-machine entities to completion: polls the store
//! for due, unleased entities, runs the per-state transition handler, and
//! persists the outcome. Polling (rather than event push) is deliberate:
//! a crashed worker's leases simply expire and another instance reclaims the
//! work, so no recovery protocol is needed beyond the lease clock.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Poll → lease → transition → persist loop
//! - **Dependencies:** Domain (store, entity, events), Infrastructure (event bus)
//!
//! # Tick Loop
//!
//! ```text
//! loop {
//!     batch = store.next_not_leased(batch_size, actionable_states, now)
//!
//!     for entity in batch {            // lease already held
//!         outcome = handlers[entity.state].process(entity)
//!
//!         match outcome {
//!             Ok        => save(entity)               // advanced, lease released
//!             Retryable => backoff or terminate; save
//!             Fatal     => terminate; save
//!             Internal  => release(entity)            // untouched, retried next tick
//!         }
//!     }
//!
//!     full batch  → re-poll after min_poll_delay (drain to empty)
//!     otherwise   → sleep poll_interval
//! }
//! ```
//!
//! Any number of managers may run against the same store, in one runtime or
//! many; correctness rests entirely on the store's atomic select-and-lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::retry::RetryPolicy;
use crate::domain::dispatch::DispatchError;
use crate::domain::entity::{ProcessState, StatefulEntity};
use crate::domain::events::ProcessEvent;
use crate::domain::repository::{ProcessStore, StoreError};
use crate::infrastructure::event_bus::EventBus;

/// Configuration for one process manager instance
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Worker identifier carried into logs; the store-side lease holder name
    /// is configured on the store itself.
    pub worker: String,

    /// Maximum entities leased per tick
    pub batch_size: usize,

    /// Sleep between ticks while the store has no due work
    pub poll_interval: Duration,

    /// Minimum delay before re-polling after a full batch; bounds the poll
    /// rate during drain-to-empty
    pub min_poll_delay: Duration,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            worker: "connector-worker".to_string(),
            batch_size: 20,
            poll_interval: Duration::from_secs(1),
            min_poll_delay: Duration::from_millis(50),
        }
    }
}

/// Classified outcome of a transition handler. `Internal` marks a
/// programming/integrity error: the entity must be released unchanged, never
/// terminated, so it stays due for a later retry.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("retryable transition failure: {0}")]
    Retryable(String),

    #[error("fatal transition failure: {0}")]
    Fatal(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<DispatchError> for TransitionError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Retryable(reason) => TransitionError::Retryable(reason),
            DispatchError::Fatal(reason) => TransitionError::Fatal(reason),
        }
    }
}

/// Per-state transition logic, invoked once per eligible entity per tick
/// with the lease held. On success the handler has already advanced the
/// entity to its next stable state.
#[async_trait]
pub trait TransitionHandler<E: StatefulEntity>: Send + Sync {
    /// The state this handler serves; registering it makes that state
    /// actionable for the outbound loop.
    fn state(&self) -> E::State;

    async fn process(&self, entity: &mut E) -> Result<(), TransitionError>;
}

/// Generic tick-loop engine over one entity type. Contract negotiation and
/// transfer process are separate instantiations with their own handler
/// tables; the engine itself is never subclassed.
pub struct ProcessManager<E: StatefulEntity> {
    store: Arc<dyn ProcessStore<E>>,
    handlers: HashMap<E::State, Arc<dyn TransitionHandler<E>>>,
    retry_policy: RetryPolicy,
    config: ProcessManagerConfig,
    event_bus: EventBus,
    shutdown_token: CancellationToken,
}

impl<E: StatefulEntity> ProcessManager<E> {
    pub fn new(
        store: Arc<dyn ProcessStore<E>>,
        retry_policy: RetryPolicy,
        config: ProcessManagerConfig,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            retry_policy,
            config,
            event_bus,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Register a transition handler; the handler table is populated at
    /// startup and queried at runtime, one handler per state.
    pub fn register_handler(&mut self, handler: Arc<dyn TransitionHandler<E>>) {
        let state = handler.state();
        if self.handlers.insert(state, handler).is_some() {
            warn!(state = ?state, "Replacing previously registered transition handler");
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the tick loop as a background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            worker = %self.config.worker,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting process manager loop"
        );

        let mut delay = self.config.poll_interval;
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!(worker = %self.config.worker, "Shutdown signal received, stopping process manager");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    delay = match self.tick().await {
                        // Full batch: more work is likely waiting, drain to empty
                        Ok(n) if n >= self.config.batch_size => self.config.min_poll_delay,
                        Ok(_) => self.config.poll_interval,
                        Err(e) => {
                            warn!(worker = %self.config.worker, error = %e, "Process manager tick failed");
                            self.config.poll_interval
                        }
                    };
                }
            }
        }

        info!(worker = %self.config.worker, "Process manager loop stopped");
    }

    /// Execute one poll-process-persist iteration; returns the number of
    /// entities leased and processed.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let actionable: Vec<E::State> = self.handlers.keys().copied().collect();
        if actionable.is_empty() {
            return Ok(0);
        }

        let batch = self
            .store
            .next_not_leased(self.config.batch_size, &actionable, Utc::now())
            .await?;
        let processed = batch.len();

        // Each entity holds its own lease, so batch members need no further
        // coordination; a slow dispatch must not stall the rest of the batch.
        futures::stream::iter(batch)
            .for_each_concurrent(self.config.batch_size.max(1), |entity| {
                self.process_entity(entity)
            })
            .await;

        if processed > 0 {
            debug!(worker = %self.config.worker, processed, "Tick completed");
        }
        Ok(processed)
    }

    async fn process_entity(&self, mut entity: E) {
        let id = entity.id().clone();
        let previous_state = entity.state();

        // Terminal absorption: retained for audit, never transitioned again.
        if previous_state.is_terminal() {
            debug!(entity_id = %id, state = previous_state.label(), "Skipping terminal entity");
            self.release_quietly(&entity).await;
            return;
        }

        // Awaiting an asynchronous counterparty response; only the inbound
        // handler may advance it.
        if entity.record().pending {
            debug!(entity_id = %id, state = previous_state.label(), "Entity pending, skipping");
            self.release_quietly(&entity).await;
            return;
        }

        let Some(handler) = self.handlers.get(&previous_state) else {
            warn!(entity_id = %id, state = previous_state.label(), "No transition handler registered");
            self.release_quietly(&entity).await;
            return;
        };

        match handler.process(&mut entity).await {
            Ok(()) => {
                counter!("connector_transitions_total", "state" => entity.state().label())
                    .increment(1);
                debug!(
                    entity_id = %id,
                    from = previous_state.label(),
                    to = entity.state().label(),
                    "State transition"
                );
                self.persist(entity, previous_state).await;
            }
            Err(TransitionError::Retryable(reason)) => {
                counter!("connector_transition_failures_total", "kind" => "retryable")
                    .increment(1);
                let attempts = entity.record().state_count + 1;
                if self.retry_policy.exhausted(attempts) {
                    warn!(
                        entity_id = %id,
                        state = previous_state.label(),
                        attempts,
                        reason = %reason,
                        "Retries exhausted, terminating"
                    );
                    entity.begin_termination(&reason);
                } else {
                    let backoff = self.retry_policy.delay(attempts);
                    debug!(
                        entity_id = %id,
                        state = previous_state.label(),
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %reason,
                        "Retryable dispatch failure, backing off"
                    );
                    entity.record_mut().record_failed_attempt(backoff);
                }
                self.persist(entity, previous_state).await;
            }
            Err(TransitionError::Fatal(reason)) => {
                counter!("connector_transition_failures_total", "kind" => "fatal").increment(1);
                warn!(
                    entity_id = %id,
                    state = previous_state.label(),
                    reason = %reason,
                    "Fatal dispatch failure, terminating"
                );
                entity.begin_termination(&reason);
                self.persist(entity, previous_state).await;
            }
            Err(TransitionError::Internal(e)) => {
                // Integrity error: never mutate persisted state. The lease is
                // released unused so the entity stays due for the next tick.
                counter!("connector_transition_failures_total", "kind" => "internal").increment(1);
                error!(
                    entity_id = %id,
                    state = previous_state.label(),
                    error = %e,
                    "Transition handler error, releasing entity unchanged"
                );
                self.release_quietly(&entity).await;
            }
        }
    }

    async fn persist(&self, entity: E, previous_state: E::State) {
        let id = entity.id().clone();
        if let Err(e) = self.store.save(&entity).await {
            error!(entity_id = %id, error = %e, "Failed to persist entity");
            return;
        }
        if entity.state() != previous_state {
            self.event_bus.publish(ProcessEvent::state_changed(&entity));
        }
    }

    async fn release_quietly(&self, entity: &E) {
        if let Err(e) = self.store.release(entity.id()).await {
            warn!(entity_id = %entity.id(), error = %e, "Failed to release lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::negotiation::{ContractNegotiation, NegotiationKind, NegotiationState};
    use crate::infrastructure::repositories::InMemoryNegotiationStore;
    use tokio::sync::Mutex;

    struct ScriptedHandler {
        state: NegotiationState,
        next: NegotiationState,
        results: Mutex<Vec<Result<(), TransitionError>>>,
        invocations: Mutex<u32>,
    }

    impl ScriptedHandler {
        fn new(
            state: NegotiationState,
            next: NegotiationState,
            results: Vec<Result<(), TransitionError>>,
        ) -> Self {
            Self {
                state,
                next,
                results: Mutex::new(results),
                invocations: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TransitionHandler<ContractNegotiation> for ScriptedHandler {
        fn state(&self) -> NegotiationState {
            self.state
        }

        async fn process(&self, entity: &mut ContractNegotiation) -> Result<(), TransitionError> {
            *self.invocations.lock().await += 1;
            let mut results = self.results.lock().await;
            let result = if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            };
            if result.is_ok() {
                entity.record_mut().pending = false;
                entity.record_mut().transition_to(self.next);
            }
            result
        }
    }

    fn store() -> Arc<InMemoryNegotiationStore> {
        Arc::new(InMemoryNegotiationStore::new(
            "worker-a",
            Duration::from_secs(30),
        ))
    }

    async fn seed(
        store: &Arc<InMemoryNegotiationStore>,
        state: NegotiationState,
    ) -> ContractNegotiation {
        let mut negotiation = ContractNegotiation::new(
            NegotiationKind::Consumer,
            "provider-1",
            "http://provider.example/dsp",
            "dataspace-protocol-http",
        );
        negotiation.record_mut().transition_to(state);
        store.save(&negotiation).await.unwrap();
        negotiation
    }

    fn manager(
        store: Arc<InMemoryNegotiationStore>,
        retry: RetryPolicy,
        handlers: Vec<Arc<ScriptedHandler>>,
    ) -> (ProcessManager<ContractNegotiation>, EventBus) {
        let bus = EventBus::with_default_capacity();
        let mut pm = ProcessManager::new(
            store as Arc<dyn ProcessStore<ContractNegotiation>>,
            retry,
            ProcessManagerConfig::default(),
            bus.clone(),
        );
        for handler in handlers {
            pm.register_handler(handler);
        }
        (pm, bus)
    }

    #[tokio::test]
    async fn test_successful_transition_persists_and_publishes() {
        let store = store();
        let seeded = seed(&store, NegotiationState::Requesting).await;
        let handler = Arc::new(ScriptedHandler::new(
            NegotiationState::Requesting,
            NegotiationState::Requested,
            vec![Ok(())],
        ));
        let (pm, bus) = manager(store.clone(), RetryPolicy::default(), vec![handler]);
        let mut events = bus.subscribe();

        let processed = pm.tick().await.unwrap();
        assert_eq!(processed, 1);

        let reloaded = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state(), NegotiationState::Requested);
        assert_eq!(reloaded.record.state_count, 0);

        let event = events.try_recv().unwrap();
        assert_eq!(event.name(), "contract.negotiation.requested");
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_succeeds() {
        let store = store();
        let seeded = seed(&store, NegotiationState::Requesting).await;
        let handler = Arc::new(ScriptedHandler::new(
            NegotiationState::Requesting,
            NegotiationState::Requested,
            vec![
                Err(TransitionError::Retryable("connection reset".to_string())),
                Ok(()),
            ],
        ));
        let retry = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(50));
        let (pm, _bus) = manager(store.clone(), retry, vec![handler]);

        pm.tick().await.unwrap();
        let after_failure = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(after_failure.state(), NegotiationState::Requesting);
        assert_eq!(after_failure.record.state_count, 1);
        assert!(after_failure.record.state_timestamp > seeded.record.state_timestamp);

        // Not yet due: the backoff keeps the entity out of the next poll
        // until its state_timestamp passes.
        tokio::time::sleep(Duration::from_millis(10)).await;
        pm.tick().await.unwrap();
        let recovered = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(recovered.state(), NegotiationState::Requested);
        assert_eq!(recovered.record.state_count, 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_terminates_with_cause() {
        let store = store();
        let seeded = seed(&store, NegotiationState::Agreeing).await;
        let handler = Arc::new(ScriptedHandler::new(
            NegotiationState::Agreeing,
            NegotiationState::Agreed,
            vec![
                Err(TransitionError::Retryable("503 from counterparty".to_string())),
                Err(TransitionError::Retryable("503 from counterparty".to_string())),
                Err(TransitionError::Retryable("503 from counterparty".to_string())),
            ],
        ));
        let retry = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(10));
        let (pm, _bus) = manager(store.clone(), retry, vec![handler]);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            pm.tick().await.unwrap();
        }

        let terminated = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(terminated.state(), NegotiationState::Terminating);
        assert_eq!(
            terminated.record.error_detail.as_deref(),
            Some("503 from counterparty")
        );
    }

    #[tokio::test]
    async fn test_fatal_failure_terminates_immediately() {
        let store = store();
        let seeded = seed(&store, NegotiationState::Requesting).await;
        let handler = Arc::new(ScriptedHandler::new(
            NegotiationState::Requesting,
            NegotiationState::Requested,
            vec![Err(TransitionError::Fatal("400 invalid offer".to_string()))],
        ));
        let (pm, _bus) = manager(store.clone(), RetryPolicy::default(), vec![handler]);

        pm.tick().await.unwrap();

        let terminated = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(terminated.state(), NegotiationState::Terminating);
        assert_eq!(terminated.record.error_detail.as_deref(), Some("400 invalid offer"));
    }

    #[tokio::test]
    async fn test_internal_error_releases_entity_unchanged() {
        let store = store();
        let seeded = seed(&store, NegotiationState::Requesting).await;
        let handler = Arc::new(ScriptedHandler::new(
            NegotiationState::Requesting,
            NegotiationState::Requested,
            vec![Err(TransitionError::Internal(anyhow::anyhow!(
                "mandatory offer missing"
            )))],
        ));
        let (pm, _bus) = manager(store.clone(), RetryPolicy::default(), vec![handler]);

        pm.tick().await.unwrap();

        let untouched = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(untouched.state(), NegotiationState::Requesting);
        assert_eq!(untouched.record.state_count, 0);

        // Lease was released: the entity can be claimed again immediately.
        assert!(store.find_by_id_and_lease(&seeded.record.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_pending_entities_are_not_redriven() {
        let store = store();
        let mut seeded = seed(&store, NegotiationState::Requesting).await;
        seeded.record_mut().pending = true;
        store.save(&seeded).await.unwrap();

        let handler = Arc::new(ScriptedHandler::new(
            NegotiationState::Requesting,
            NegotiationState::Requested,
            vec![Ok(())],
        ));
        let (pm, _bus) = manager(store.clone(), RetryPolicy::default(), vec![handler.clone()]);

        pm.tick().await.unwrap();
        assert_eq!(*handler.invocations.lock().await, 0);
        let untouched = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(untouched.state(), NegotiationState::Requesting);
    }

    #[tokio::test]
    async fn test_terminal_entities_are_never_processed() {
        let store = store();
        seed(&store, NegotiationState::Finalized).await;
        let handler = Arc::new(ScriptedHandler::new(
            NegotiationState::Finalized,
            NegotiationState::Terminated,
            vec![Ok(())],
        ));
        let (pm, _bus) = manager(store.clone(), RetryPolicy::default(), vec![handler.clone()]);

        pm.tick().await.unwrap();
        assert_eq!(*handler.invocations.lock().await, 0);
    }
}
