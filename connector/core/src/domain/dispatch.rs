// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Dispatch Layer Boundary
//!
//! Sends an outbound protocol message to a counterparty and resolves a
//! classified result. The engine only ever sees the retryable/fatal split;
//! transport details live in `crate::infrastructure::dispatch`.
//!
//! Duplicate sends are possible when a lease legitimately expires
//! mid-dispatch and another worker reclaims the entity; counterparties
//! deduplicate on correlation ids, so the dispatcher does not try to detect
//! that race.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::message::NegotiationMessage;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    /// Process id the counterparty assigned on its side, when the reply
    /// carries one; used to set the local correlation id on first contact.
    pub remote_process_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transient transport or 5xx-class failure; eligible for backoff.
    #[error("retryable dispatch failure: {0}")]
    Retryable(String),

    /// Structurally invalid request or 4xx-class rejection; never retried.
    #[error("fatal dispatch failure: {0}")]
    Fatal(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Retryable(_))
    }
}

#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    async fn send(
        &self,
        address: &str,
        message: &NegotiationMessage,
    ) -> Result<DispatchResponse, DispatchError>;
}
