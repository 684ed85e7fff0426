// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Stateful Entity Base - Process Engine Core
//!
//! Shared shape for every record driven by the process engine. Concrete
//! process types (contract negotiation, transfer process) embed
//! [`ProcessRecord`] by composition and expose it through the
//! [`StatefulEntity`] trait; the engine itself never knows the concrete type.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** State-machine record, lease token, callback registration

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Closed, per-entity-type state enumeration. Codes are stable and used for
/// persistence; labels feed logs and callback event names.
pub trait ProcessState:
    Copy + Clone + PartialEq + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static
{
    fn code(&self) -> i32;

    fn from_code(code: i32) -> Option<Self>
    where
        Self: Sized;

    fn label(&self) -> &'static str;

    /// Terminal states are retained for audit but never transitioned again.
    fn is_terminal(&self) -> bool;
}

/// Externally registered endpoint notified on persisted state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAddress {
    pub uri: String,
    /// Event-name prefixes this endpoint subscribed to,
    /// e.g. `contract.negotiation.agreed` or just `contract.negotiation`.
    pub events: Vec<String>,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default)]
    pub auth_key_alias: Option<String>,
}

impl CallbackAddress {
    pub fn new(uri: impl Into<String>, events: Vec<String>) -> Self {
        Self {
            uri: uri.into(),
            events,
            transactional: false,
            auth_key_alias: None,
        }
    }

    pub fn matches(&self, event_name: &str) -> bool {
        self.events.iter().any(|prefix| event_name.starts_with(prefix.as_str()))
    }
}

/// Persisted state-machine record embedded by every concrete process type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord<S> {
    pub id: ProcessId,
    /// Mutated only by the engine.
    pub state: S,
    /// Consecutive attempts in the current state without a successful forward
    /// transition; reset to 0 on every state change.
    pub state_count: u32,
    /// The entity becomes eligible for its next processing attempt once this
    /// instant has passed; doubles as the backoff target after failures.
    pub state_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_detail: Option<String>,
    /// Opaque propagation map, carried but never interpreted here.
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
    /// Set while the entity awaits an asynchronous counterparty response; the
    /// outbound loop must not re-drive a pending entity.
    #[serde(default)]
    pub pending: bool,
}

impl<S: ProcessState> ProcessRecord<S> {
    pub fn new(state: S) -> Self {
        let now = Utc::now();
        Self {
            id: ProcessId::new(),
            state,
            state_count: 0,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            error_detail: None,
            trace_context: HashMap::new(),
            callback_addresses: Vec::new(),
            pending: false,
        }
    }

    /// Forward transition: resets the attempt counter and makes the entity
    /// immediately due.
    pub fn transition_to(&mut self, next: S) {
        let now = Utc::now();
        self.state = next;
        self.state_count = 0;
        self.state_timestamp = now;
        self.updated_at = now;
    }

    /// Failed attempt in the current state: bumps the counter and pushes the
    /// next eligibility past the backoff delay.
    pub fn record_failed_attempt(&mut self, delay: Duration) {
        let now = Utc::now();
        self.state_count += 1;
        self.state_timestamp =
            now + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::zero());
        self.updated_at = now;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Concrete process types expose their embedded record through this trait so
/// one generic process manager can drive all of them.
pub trait StatefulEntity: Clone + Send + Sync + 'static {
    type State: ProcessState;

    /// Dotted event-name prefix, e.g. `contract.negotiation`.
    fn entity_type() -> &'static str;

    fn record(&self) -> &ProcessRecord<Self::State>;

    fn record_mut(&mut self) -> &mut ProcessRecord<Self::State>;

    /// Force the entity onto its termination path with a cause. Must be a
    /// no-op for entities already in a terminal state.
    fn begin_termination(&mut self, reason: &str);

    fn id(&self) -> &ProcessId {
        &self.record().id
    }

    fn state(&self) -> Self::State {
        self.record().state
    }
}

/// Time-bounded mutual-exclusion token over one entity. Not a distributed
/// transaction: validity is purely `leased_at + lease_duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub entity_id: ProcessId,
    pub leased_by: String,
    pub leased_at: DateTime<Utc>,
    pub lease_duration: Duration,
}

impl Lease {
    pub fn acquire(entity_id: ProcessId, leased_by: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            entity_id,
            leased_by: leased_by.into(),
            leased_at: Utc::now(),
            lease_duration,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let expiry = self.leased_at
            + TimeDelta::from_std(self.lease_duration).unwrap_or_else(|_| TimeDelta::zero());
        now < expiry
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_valid_at(now)
    }
}
