// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Store Implementations
//!
//! Infrastructure implementations of the store contracts defined in the
//! domain layer, following the Repository pattern from DDD.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist process entities and mediate per-entity leasing
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **PostgresNegotiationStore** - production persistence; select-and-lease
//!   via `FOR UPDATE SKIP LOCKED`
//! - **InMemoryNegotiationStore** - development and testing; a single mutex
//!   over the entity and lease maps makes select-and-lease atomic
//!
//! Lease semantics are identical across backends: a lease is valid until
//! `leased_at + lease_duration`; expired leases are reclaimable by any
//! worker; `save` releases the caller's lease.

pub mod postgres_negotiation;

pub use postgres_negotiation::PostgresNegotiationStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::entity::{Lease, ProcessId, ProcessState, StatefulEntity};
use crate::domain::negotiation::{ContractNegotiation, NegotiationState};
use crate::domain::repository::{NegotiationStore, ProcessStore, QuerySpec, StoreError};

struct Inner {
    negotiations: HashMap<ProcessId, ContractNegotiation>,
    leases: HashMap<ProcessId, Lease>,
}

/// Thread-safe in-memory negotiation store. `clone_handle` produces a second
/// view over the same state under a different lease holder name, simulating
/// a second worker against a shared database.
#[derive(Clone)]
pub struct InMemoryNegotiationStore {
    inner: Arc<Mutex<Inner>>,
    holder: String,
    lease_duration: Duration,
}

impl InMemoryNegotiationStore {
    pub fn new(holder: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                negotiations: HashMap::new(),
                leases: HashMap::new(),
            })),
            holder: holder.into(),
            lease_duration,
        }
    }

    /// Second worker view over the same backing state.
    pub fn clone_handle(&self, holder: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            holder: holder.into(),
            lease_duration: self.lease_duration,
        }
    }

    fn acquire_lease(
        inner: &mut Inner,
        id: &ProcessId,
        holder: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(existing) = inner.leases.get(id) {
            if existing.is_valid_at(now) {
                return Err(StoreError::LeaseConflict(id.to_string()));
            }
        }
        inner
            .leases
            .insert(id.clone(), Lease::acquire(id.clone(), holder, lease_duration));
        Ok(())
    }
}

#[async_trait]
impl ProcessStore<ContractNegotiation> for InMemoryNegotiationStore {
    async fn save(&self, entity: &ContractNegotiation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let id = entity.id().clone();
        if let Some(lease) = inner.leases.get(&id) {
            if lease.is_valid_at(Utc::now()) && lease.leased_by != self.holder {
                return Err(StoreError::LeaseConflict(id.to_string()));
            }
        }
        // Save ends lease ownership; the next attempt must re-acquire.
        inner.leases.remove(&id);
        inner.negotiations.insert(id, entity.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &ProcessId) -> Result<Option<ContractNegotiation>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.negotiations.get(id).cloned())
    }

    async fn query(&self, spec: &QuerySpec) -> Result<Vec<ContractNegotiation>, StoreError> {
        let inner = self.inner.lock();
        let mut matches: Vec<ContractNegotiation> = inner
            .negotiations
            .values()
            .filter(|n| {
                spec.state_code
                    .map(|code| n.state().code() == code)
                    .unwrap_or(true)
            })
            .filter(|n| {
                spec.counter_party_id
                    .as_deref()
                    .map(|cp| n.counter_party_id == cp)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        Ok(matches
            .into_iter()
            .skip(spec.offset)
            .take(spec.limit)
            .collect())
    }

    async fn next_not_leased(
        &self,
        limit: usize,
        states: &[NegotiationState],
        due_before: DateTime<Utc>,
    ) -> Result<Vec<ContractNegotiation>, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let mut due: Vec<ContractNegotiation> = inner
            .negotiations
            .values()
            .filter(|n| states.contains(&n.state()))
            .filter(|n| n.record.state_timestamp <= due_before)
            .filter(|n| {
                inner
                    .leases
                    .get(n.id())
                    .map(|lease| !lease.is_valid_at(now))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        // Longest-overdue first; id tie-break keeps tests deterministic.
        due.sort_by(|a, b| {
            a.record
                .state_timestamp
                .cmp(&b.record.state_timestamp)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        due.truncate(limit);

        for negotiation in &due {
            Self::acquire_lease(
                &mut inner,
                negotiation.id(),
                &self.holder,
                self.lease_duration,
                now,
            )?;
        }
        Ok(due)
    }

    async fn find_by_id_and_lease(&self, id: &ProcessId) -> Result<ContractNegotiation, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.negotiations.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Self::acquire_lease(&mut inner, id, &self.holder, self.lease_duration, Utc::now())?;
        Ok(inner.negotiations[id].clone())
    }

    async fn release(&self, id: &ProcessId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let held_by_other = inner
            .leases
            .get(id)
            .map(|lease| lease.is_valid_at(Utc::now()) && lease.leased_by != self.holder)
            .unwrap_or(false);
        if held_by_other {
            return Err(StoreError::LeaseConflict(id.to_string()));
        }
        inner.leases.remove(id);
        Ok(())
    }
}

#[async_trait]
impl NegotiationStore for InMemoryNegotiationStore {
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ContractNegotiation>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .negotiations
            .values()
            .find(|n| n.correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }
}
