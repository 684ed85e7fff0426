// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL negotiation store.
//!
//! Select-and-lease is a single `UPDATE ... WHERE id IN (SELECT ... FOR
//! UPDATE SKIP LOCKED)` so two workers polling the same due set can never
//! claim the same row. Lease state lives in three columns on the entity row
//! (`leased_by`, `leased_at`, `lease_duration_ms`); a lease is valid while
//! `leased_at + lease_duration_ms` lies in the future. `save` upserts and
//! nulls the lease columns.
//!
//! Expected schema: `contract_negotiations(id TEXT PRIMARY KEY, state INT,
//! state_count INT, state_timestamp TIMESTAMPTZ, created_at TIMESTAMPTZ,
//! updated_at TIMESTAMPTZ, error_detail TEXT, trace_context JSONB,
//! callback_addresses JSONB, pending BOOL, correlation_id TEXT,
//! counter_party_id TEXT, counter_party_address TEXT, protocol TEXT,
//! contract_offers JSONB, contract_agreement JSONB, kind TEXT,
//! leased_by TEXT, leased_at TIMESTAMPTZ, lease_duration_ms BIGINT)`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::entity::{ProcessId, ProcessRecord, ProcessState};
use crate::domain::negotiation::{ContractNegotiation, NegotiationKind, NegotiationState};
use crate::domain::repository::{NegotiationStore, ProcessStore, QuerySpec, StoreError};

const COLUMNS: &str = "id, state, state_count, state_timestamp, created_at, updated_at, \
     error_detail, trace_context, callback_addresses, pending, correlation_id, \
     counter_party_id, counter_party_address, protocol, contract_offers, \
     contract_agreement, kind";

pub struct PostgresNegotiationStore {
    pool: PgPool,
    holder: String,
    lease_duration: Duration,
}

impl PostgresNegotiationStore {
    pub fn new(pool: PgPool, holder: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            pool,
            holder: holder.into(),
            lease_duration,
        }
    }

    fn lease_millis(&self) -> i64 {
        self.lease_duration.as_millis() as i64
    }

    fn map_row(row: &PgRow) -> Result<ContractNegotiation, StoreError> {
        let state_code: i32 = row.get("state");
        let state = NegotiationState::from_code(state_code).ok_or_else(|| {
            StoreError::Database(format!("Unknown negotiation state code: {state_code}"))
        })?;

        let kind_str: String = row.get("kind");
        let kind = match kind_str.as_str() {
            "CONSUMER" => NegotiationKind::Consumer,
            "PROVIDER" => NegotiationKind::Provider,
            other => {
                return Err(StoreError::Database(format!(
                    "Unknown negotiation kind: {other}"
                )))
            }
        };

        let trace_context: serde_json::Value = row.get("trace_context");
        let callback_addresses: serde_json::Value = row.get("callback_addresses");
        let contract_offers: serde_json::Value = row.get("contract_offers");
        let contract_agreement: Option<serde_json::Value> = row.get("contract_agreement");

        let state_count: i32 = row.get("state_count");
        let record = ProcessRecord {
            id: ProcessId(row.get("id")),
            state,
            state_count: state_count as u32,
            state_timestamp: row.get("state_timestamp"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            error_detail: row.get("error_detail"),
            trace_context: serde_json::from_value(trace_context)?,
            callback_addresses: serde_json::from_value(callback_addresses)?,
            pending: row.get("pending"),
        };

        Ok(ContractNegotiation::rehydrate(
            record,
            row.get("correlation_id"),
            row.get("counter_party_id"),
            row.get("counter_party_address"),
            row.get("protocol"),
            serde_json::from_value(contract_offers)?,
            contract_agreement.map(serde_json::from_value).transpose()?,
            kind,
        ))
    }
}

#[async_trait]
impl ProcessStore<ContractNegotiation> for PostgresNegotiationStore {
    async fn save(&self, entity: &ContractNegotiation) -> Result<(), StoreError> {
        let record = &entity.record;
        let trace_context = serde_json::to_value(&record.trace_context)?;
        let callback_addresses = serde_json::to_value(&record.callback_addresses)?;
        let contract_offers = serde_json::to_value(entity.contract_offers())?;
        let contract_agreement = entity
            .contract_agreement()
            .map(serde_json::to_value)
            .transpose()?;

        // Upsert; the DO UPDATE guard rejects a save over a valid foreign
        // lease, and a successful save always clears the lease columns.
        let result = sqlx::query(
            r#"
            INSERT INTO contract_negotiations (
                id, state, state_count, state_timestamp, created_at, updated_at,
                error_detail, trace_context, callback_addresses, pending,
                correlation_id, counter_party_id, counter_party_address, protocol,
                contract_offers, contract_agreement, kind,
                leased_by, leased_at, lease_duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, NULL, NULL, NULL)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                state_count = EXCLUDED.state_count,
                state_timestamp = EXCLUDED.state_timestamp,
                updated_at = EXCLUDED.updated_at,
                error_detail = EXCLUDED.error_detail,
                trace_context = EXCLUDED.trace_context,
                callback_addresses = EXCLUDED.callback_addresses,
                pending = EXCLUDED.pending,
                correlation_id = EXCLUDED.correlation_id,
                contract_offers = EXCLUDED.contract_offers,
                contract_agreement = EXCLUDED.contract_agreement,
                leased_by = NULL,
                leased_at = NULL,
                lease_duration_ms = NULL
            WHERE contract_negotiations.leased_by IS NULL
               OR contract_negotiations.leased_by = $18
               OR contract_negotiations.leased_at
                    + contract_negotiations.lease_duration_ms * INTERVAL '1 millisecond' <= $19
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.state.code())
        .bind(record.state_count as i32)
        .bind(record.state_timestamp)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.error_detail.as_deref())
        .bind(trace_context)
        .bind(callback_addresses)
        .bind(record.pending)
        .bind(entity.correlation_id.as_deref())
        .bind(entity.counter_party_id.as_str())
        .bind(entity.counter_party_address.as_str())
        .bind(entity.protocol.as_str())
        .bind(contract_offers)
        .bind(contract_agreement)
        .bind(entity.kind.as_str())
        .bind(self.holder.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to save negotiation: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseConflict(record.id.to_string()));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &ProcessId) -> Result<Option<ContractNegotiation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM contract_negotiations WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn query(&self, spec: &QuerySpec) -> Result<Vec<ContractNegotiation>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM contract_negotiations
            WHERE ($1::int IS NULL OR state = $1)
              AND ($2::text IS NULL OR counter_party_id = $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(spec.state_code)
        .bind(spec.counter_party_id.as_deref())
        .bind(spec.limit as i64)
        .bind(spec.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn next_not_leased(
        &self,
        limit: usize,
        states: &[NegotiationState],
        due_before: DateTime<Utc>,
    ) -> Result<Vec<ContractNegotiation>, StoreError> {
        let codes: Vec<i32> = states.iter().map(|s| s.code()).collect();
        let now = Utc::now();

        let rows = sqlx::query(&format!(
            r#"
            UPDATE contract_negotiations
            SET leased_by = $1, leased_at = $2, lease_duration_ms = $3
            WHERE id IN (
                SELECT id FROM contract_negotiations
                WHERE state = ANY($4)
                  AND state_timestamp <= $5
                  AND (leased_by IS NULL
                       OR leased_at + lease_duration_ms * INTERVAL '1 millisecond' <= $2)
                ORDER BY state_timestamp ASC, id ASC
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(self.holder.as_str())
        .bind(now)
        .bind(self.lease_millis())
        .bind(&codes)
        .bind(due_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to lease due negotiations: {e}")))?;

        let mut leased: Vec<ContractNegotiation> = rows
            .iter()
            .map(Self::map_row)
            .collect::<Result<_, _>>()?;
        // RETURNING does not guarantee the inner SELECT's ordering.
        leased.sort_by(|a, b| {
            a.record
                .state_timestamp
                .cmp(&b.record.state_timestamp)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        Ok(leased)
    }

    async fn find_by_id_and_lease(
        &self,
        id: &ProcessId,
    ) -> Result<ContractNegotiation, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            UPDATE contract_negotiations
            SET leased_by = $1, leased_at = $2, lease_duration_ms = $3
            WHERE id = $4
              AND (leased_by IS NULL
                   OR leased_at + lease_duration_ms * INTERVAL '1 millisecond' <= $2)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(self.holder.as_str())
        .bind(now)
        .bind(self.lease_millis())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to lease negotiation: {e}")))?;

        match row {
            Some(row) => Self::map_row(&row),
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM contract_negotiations WHERE id = $1)")
                        .bind(id.as_str())
                        .fetch_one(&self.pool)
                        .await
                        .map_err(|e| StoreError::Database(e.to_string()))?;
                if exists {
                    Err(StoreError::LeaseConflict(id.to_string()))
                } else {
                    Err(StoreError::NotFound(id.to_string()))
                }
            }
        }
    }

    async fn release(&self, id: &ProcessId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE contract_negotiations
            SET leased_by = NULL, leased_at = NULL, lease_duration_ms = NULL
            WHERE id = $1
              AND (leased_by IS NULL
                   OR leased_by = $2
                   OR leased_at + lease_duration_ms * INTERVAL '1 millisecond' <= $3)
            "#,
        )
        .bind(id.as_str())
        .bind(self.holder.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Zero rows: either the entity is gone (no-op) or another worker
        // holds a valid lease.
        let held_by_other: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM contract_negotiations
                WHERE id = $1 AND leased_by IS NOT NULL AND leased_by <> $2
                  AND leased_at + lease_duration_ms * INTERVAL '1 millisecond' > $3
            )
            "#,
        )
        .bind(id.as_str())
        .bind(self.holder.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if held_by_other {
            Err(StoreError::LeaseConflict(id.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NegotiationStore for PostgresNegotiationStore {
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ContractNegotiation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM contract_negotiations WHERE correlation_id = $1"
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }
}
