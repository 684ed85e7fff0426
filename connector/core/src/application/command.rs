// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Queue & Runner
//!
//! Side-channel for externally forced transitions (cancel, manual override)
//! on a specific entity. Commands are transient and at-most-once: the queue
//! is a bounded in-memory channel, nothing is persisted, and a command that
//! loses the lease race is dropped; callers needing guaranteed delivery
//! re-issue.
//!
//! The runner applies commands under the same store lease contract as the
//! tick loop; the two paths race for leases and need no other coordination.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::entity::{ProcessId, ProcessState, StatefulEntity};
use crate::domain::events::ProcessEvent;
use crate::domain::negotiation::ContractNegotiation;
use crate::domain::repository::{ProcessStore, StoreError};
use crate::infrastructure::event_bus::EventBus;

/// A request to force a transition on one entity from outside the protocol
/// flow. `kind` is the handler-registry discriminant.
pub trait EntityCommand: Send + Sync + fmt::Debug + 'static {
    fn target(&self) -> &ProcessId;

    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub enum NegotiationCommand {
    Terminate { id: ProcessId, reason: String },
}

impl EntityCommand for NegotiationCommand {
    fn target(&self) -> &ProcessId {
        match self {
            NegotiationCommand::Terminate { id, .. } => id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            NegotiationCommand::Terminate { .. } => "terminate",
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// The command does not apply to the entity's current state.
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mutation applied to a leased entity on behalf of a command.
#[async_trait]
pub trait CommandHandler<E: StatefulEntity, C: EntityCommand>: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn handle(&self, entity: &mut E, command: &C) -> Result<(), CommandError>;
}

/// Bounded FIFO handed to management APIs. `enqueue` never blocks; a full
/// queue signals backpressure by returning `false`.
#[derive(Clone)]
pub struct CommandQueue<C> {
    tx: mpsc::Sender<C>,
}

impl<C: EntityCommand> CommandQueue<C> {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<C>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, command: C) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(command = ?command, "Command queue full, rejecting command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                warn!(command = ?command, "Command runner stopped, rejecting command");
                false
            }
        }
    }
}

/// Consumes the queue on its own task, decoupled from the tick loop.
pub struct CommandRunner<E: StatefulEntity, C: EntityCommand> {
    store: Arc<dyn ProcessStore<E>>,
    handlers: HashMap<&'static str, Arc<dyn CommandHandler<E, C>>>,
    event_bus: EventBus,
    shutdown_token: CancellationToken,
}

impl<E: StatefulEntity, C: EntityCommand> CommandRunner<E, C> {
    pub fn new(store: Arc<dyn ProcessStore<E>>, event_bus: EventBus) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            event_bus,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Register a command handler; the registry is populated at startup and
    /// resolved by the command's discriminant at runtime.
    pub fn register_handler(&mut self, handler: Arc<dyn CommandHandler<E, C>>) {
        let kind = handler.kind();
        if self.handlers.insert(kind, handler).is_some() {
            warn!(kind, "Replacing previously registered command handler");
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the consuming loop as a background task
    pub fn start(self: Arc<Self>, mut rx: mpsc::Receiver<C>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting command runner loop");
            loop {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => {
                        info!("Shutdown signal received, stopping command runner");
                        break;
                    }
                    command = rx.recv() => {
                        match command {
                            Some(command) => self.execute(command).await,
                            None => {
                                info!("Command queue closed, stopping command runner");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Apply one command under lease. Lease conflicts drop the command with a
    /// warning; commands are never retried or requeued.
    pub async fn execute(&self, command: C) {
        let Some(handler) = self.handlers.get(command.kind()) else {
            warn!(kind = command.kind(), "No handler registered for command, dropping");
            return;
        };

        let mut entity = match self.store.find_by_id_and_lease(command.target()).await {
            Ok(entity) => entity,
            Err(StoreError::LeaseConflict(_)) => {
                warn!(
                    command = ?command,
                    "Target entity is leased by another worker, dropping command"
                );
                return;
            }
            Err(StoreError::NotFound(_)) => {
                warn!(command = ?command, "Target entity not found, dropping command");
                return;
            }
            Err(e) => {
                warn!(command = ?command, error = %e, "Failed to lease target entity, dropping command");
                return;
            }
        };

        let previous_state = entity.state();
        match handler.handle(&mut entity, &command).await {
            Ok(()) => {
                if let Err(e) = self.store.save(&entity).await {
                    warn!(entity_id = %command.target(), error = %e, "Failed to persist command outcome");
                    return;
                }
                debug!(
                    entity_id = %command.target(),
                    kind = command.kind(),
                    from = previous_state.label(),
                    to = entity.state().label(),
                    "Command applied"
                );
                if entity.state() != previous_state {
                    self.event_bus.publish(ProcessEvent::state_changed(&entity));
                }
            }
            Err(CommandError::Rejected(reason)) => {
                debug!(entity_id = %command.target(), kind = command.kind(), reason = %reason, "Command rejected");
                self.release_quietly(command.target()).await;
            }
            Err(e) => {
                warn!(entity_id = %command.target(), kind = command.kind(), error = %e, "Command failed");
                self.release_quietly(command.target()).await;
            }
        }
    }

    async fn release_quietly(&self, id: &ProcessId) {
        if let Err(e) = self.store.release(id).await {
            warn!(entity_id = %id, error = %e, "Failed to release lease after command");
        }
    }
}

/// Forces a negotiation onto its termination path; the tick loop then emits
/// the termination notice to the counterparty.
pub struct TerminateNegotiationHandler;

#[async_trait]
impl CommandHandler<ContractNegotiation, NegotiationCommand> for TerminateNegotiationHandler {
    fn kind(&self) -> &'static str {
        "terminate"
    }

    async fn handle(
        &self,
        entity: &mut ContractNegotiation,
        command: &NegotiationCommand,
    ) -> Result<(), CommandError> {
        let NegotiationCommand::Terminate { reason, .. } = command;
        if entity.state().is_terminal() {
            return Err(CommandError::Rejected(format!(
                "negotiation already in terminal state {}",
                entity.state().label()
            )));
        }
        entity.begin_termination(reason);
        Ok(())
    }
}
