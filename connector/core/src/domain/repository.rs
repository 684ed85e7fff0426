// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Store Contracts (Repository Pattern)
//!
//! Persistence contracts for stateful process entities, following the DDD
//! Repository pattern: the contract lives in the domain layer, backends live
//! in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ProcessStore<E>` | any `StatefulEntity` | `InMemoryNegotiationStore`, `PostgresNegotiationStore` |
//! | `NegotiationStore` | `ContractNegotiation` | same, plus correlation lookup |
//!
//! The store is the single serialization point of the engine: every mutation
//! path goes through per-entity leasing performed atomically inside the
//! backend. `next_not_leased` MUST select and lease in one atomic step:
//! two workers polling the same due set may never receive the same entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entity::{ProcessId, StatefulEntity};
use crate::domain::negotiation::ContractNegotiation;

/// Filter/paginate spec for read APIs. The engine loop never uses this; it
/// polls through `next_not_leased` exclusively.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub state_code: Option<i32>,
    pub counter_party_id: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            state_code: None,
            counter_party_id: None,
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Expected concurrency outcome, not a fault: another worker holds a
    /// valid lease. Tick loops skip, command runners drop.
    #[error("Lease conflict for entity: {0}")]
    LeaseConflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Row not found".to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[async_trait]
pub trait ProcessStore<E: StatefulEntity>: Send + Sync {
    /// Upsert. Callers on an engine mutation path hold the lease; saving
    /// releases it; a fresh lease must be acquired for the next attempt.
    async fn save(&self, entity: &E) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &ProcessId) -> Result<Option<E>, StoreError>;

    async fn query(&self, spec: &QuerySpec) -> Result<Vec<E>, StoreError>;

    /// Atomically select up to `limit` entities whose state is in `states`,
    /// whose `state_timestamp <= due_before`, and which carry no valid lease,
    /// acquiring a lease on each as part of the same operation. Returned in
    /// non-decreasing `state_timestamp` order, ties broken by id.
    async fn next_not_leased(
        &self,
        limit: usize,
        states: &[E::State],
        due_before: DateTime<Utc>,
    ) -> Result<Vec<E>, StoreError>;

    /// Immediate single-entity lease attempt, used by the command runner and
    /// the inbound handler.
    async fn find_by_id_and_lease(&self, id: &ProcessId) -> Result<E, StoreError>;

    /// Relinquish a held lease without mutating the entity, leaving it due
    /// for the next poll. Releasing an absent lease is a no-op; releasing a
    /// lease held by another worker is a conflict.
    async fn release(&self, id: &ProcessId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait NegotiationStore: ProcessStore<ContractNegotiation> {
    /// Resolve by the counterparty-assigned process id carried on inbound
    /// messages.
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ContractNegotiation>, StoreError>;
}
