// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod process_manager;
pub mod retry;
pub mod handlers;
pub mod command;
pub mod inbound;
pub mod callback;

// Re-export the engine surface for convenience
pub use process_manager::{ProcessManager, ProcessManagerConfig, TransitionError, TransitionHandler};
pub use retry::RetryPolicy;
pub use command::{CommandQueue, CommandRunner, EntityCommand, NegotiationCommand, TerminateNegotiationHandler};
pub use inbound::{Ack, InboundError, InboundNegotiationService};
