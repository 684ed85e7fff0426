// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Engine Domain Events
//!
//! Emitted after every persisted state change; consumed by the callback
//! notifier and by any embedding runtime that subscribes to the event bus.
//! Events carry the callback registrations of the entity that produced them
//! so delivery needs no store round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entity::{CallbackAddress, ProcessId, ProcessState, StatefulEntity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    StateChanged {
        entity_id: ProcessId,
        /// Dotted entity-type prefix, e.g. `contract.negotiation`.
        entity_type: String,
        state: String,
        state_code: i32,
        error_detail: Option<String>,
        callbacks: Vec<CallbackAddress>,
        occurred_at: DateTime<Utc>,
    },
}

impl ProcessEvent {
    pub fn state_changed<E: StatefulEntity>(entity: &E) -> Self {
        let record = entity.record();
        ProcessEvent::StateChanged {
            entity_id: record.id.clone(),
            entity_type: E::entity_type().to_string(),
            state: record.state.label().to_string(),
            state_code: record.state.code(),
            error_detail: record.error_detail.clone(),
            callbacks: record.callback_addresses.clone(),
            occurred_at: record.updated_at,
        }
    }

    pub fn entity_id(&self) -> &ProcessId {
        match self {
            ProcessEvent::StateChanged { entity_id, .. } => entity_id,
        }
    }

    /// Event name matched against callback-address subscriptions,
    /// e.g. `contract.negotiation.agreed`.
    pub fn name(&self) -> String {
        match self {
            ProcessEvent::StateChanged { entity_type, state, .. } => {
                format!("{}.{}", entity_type, state.to_lowercase())
            }
        }
    }

    pub fn callbacks(&self) -> &[CallbackAddress] {
        match self {
            ProcessEvent::StateChanged { callbacks, .. } => callbacks,
        }
    }
}
