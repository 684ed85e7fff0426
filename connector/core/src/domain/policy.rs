// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy Gate Boundary
//!
//! The engine never evaluates policy rules itself; it hands an opaque
//! [`Policy`] and the calling [`ParticipantAgent`] to a [`PolicyGate`] scoped
//! by message type and acts on pass/fail. Rule semantics live behind the
//! gate, outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Opaque usage policy; carried through the engine, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy(pub serde_json::Value);

/// The remote party on whose behalf a message is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantAgent {
    pub identity: String,
    #[serde(default)]
    pub claims: HashMap<String, String>,
}

impl ParticipantAgent {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            claims: HashMap::new(),
        }
    }
}

/// Evaluation scopes, one per negotiation message type plus the provider-side
/// pre-agreement check.
pub mod scopes {
    pub const NEGOTIATION_REQUEST: &str = "contract.negotiation.request";
    pub const NEGOTIATION_OFFER: &str = "contract.negotiation.offer";
    pub const NEGOTIATION_ACCEPT: &str = "contract.negotiation.accept";
    pub const NEGOTIATION_AGREE: &str = "contract.negotiation.agree";
    pub const NEGOTIATION_VERIFY: &str = "contract.negotiation.verify";
    pub const NEGOTIATION_FINALIZE: &str = "contract.negotiation.finalize";
    pub const NEGOTIATION_TERMINATE: &str = "contract.negotiation.terminate";
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy denied in scope '{scope}': {reason}")]
    Denied { scope: String, reason: String },

    #[error("policy engine failure: {0}")]
    Engine(String),
}

#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn evaluate(
        &self,
        scope: &str,
        policy: &Policy,
        agent: &ParticipantAgent,
    ) -> Result<(), PolicyError>;
}

/// Gate that admits everything; development and test wiring only.
pub struct PermitAllGate;

#[async_trait]
impl PolicyGate for PermitAllGate {
    async fn evaluate(
        &self,
        _scope: &str,
        _policy: &Policy,
        _agent: &ParticipantAgent,
    ) -> Result<(), PolicyError> {
        Ok(())
    }
}
