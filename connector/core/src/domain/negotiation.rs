// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Contract Negotiation Aggregate
//!
//! The fully worked instantiation of the stateful-process engine: a usage
//! contract negotiated between a consumer and a provider over an
//! asynchronous wire protocol. The transfer process reuses the same engine
//! with its own state set and handler table.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Negotiation state set, offers/agreement, termination path

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entity::{ProcessRecord, ProcessState, StatefulEntity};
use crate::domain::policy::Policy;

/// Closed negotiation state set. Transient `*ing` states mean "about to
/// perform one send" and resolve to the following stable state; codes are
/// stable for persistence and leave gaps for protocol evolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    Initial,
    Requesting,
    Requested,
    Offering,
    Offered,
    Accepting,
    Accepted,
    Agreeing,
    Agreed,
    Verifying,
    Verified,
    Finalizing,
    Finalized,
    Terminating,
    Terminated,
}

impl ProcessState for NegotiationState {
    fn code(&self) -> i32 {
        match self {
            NegotiationState::Initial => 50,
            NegotiationState::Requesting => 100,
            NegotiationState::Requested => 200,
            NegotiationState::Offering => 300,
            NegotiationState::Offered => 400,
            NegotiationState::Accepting => 700,
            NegotiationState::Accepted => 800,
            NegotiationState::Agreeing => 825,
            NegotiationState::Agreed => 850,
            NegotiationState::Verifying => 1050,
            NegotiationState::Verified => 1100,
            NegotiationState::Finalizing => 1150,
            NegotiationState::Finalized => 1200,
            NegotiationState::Terminating => 1300,
            NegotiationState::Terminated => 1400,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            50 => Some(NegotiationState::Initial),
            100 => Some(NegotiationState::Requesting),
            200 => Some(NegotiationState::Requested),
            300 => Some(NegotiationState::Offering),
            400 => Some(NegotiationState::Offered),
            700 => Some(NegotiationState::Accepting),
            800 => Some(NegotiationState::Accepted),
            825 => Some(NegotiationState::Agreeing),
            850 => Some(NegotiationState::Agreed),
            1050 => Some(NegotiationState::Verifying),
            1100 => Some(NegotiationState::Verified),
            1150 => Some(NegotiationState::Finalizing),
            1200 => Some(NegotiationState::Finalized),
            1300 => Some(NegotiationState::Terminating),
            1400 => Some(NegotiationState::Terminated),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            NegotiationState::Initial => "INITIAL",
            NegotiationState::Requesting => "REQUESTING",
            NegotiationState::Requested => "REQUESTED",
            NegotiationState::Offering => "OFFERING",
            NegotiationState::Offered => "OFFERED",
            NegotiationState::Accepting => "ACCEPTING",
            NegotiationState::Accepted => "ACCEPTED",
            NegotiationState::Agreeing => "AGREEING",
            NegotiationState::Agreed => "AGREED",
            NegotiationState::Verifying => "VERIFYING",
            NegotiationState::Verified => "VERIFIED",
            NegotiationState::Finalizing => "FINALIZING",
            NegotiationState::Finalized => "FINALIZED",
            NegotiationState::Terminating => "TERMINATING",
            NegotiationState::Terminated => "TERMINATED",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Finalized | NegotiationState::Terminated)
    }
}

/// Which side of the conversation this record represents; selects the
/// applicable transition handlers and message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationKind {
    Consumer,
    Provider,
}

impl NegotiationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationKind::Consumer => "CONSUMER",
            NegotiationKind::Provider => "PROVIDER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOffer {
    pub id: String,
    pub asset_id: String,
    pub policy: Policy,
}

impl ContractOffer {
    pub fn new(asset_id: impl Into<String>, policy: Policy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            asset_id: asset_id.into(),
            policy,
        }
    }
}

/// Immutable once set on the negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: String,
    pub provider_id: String,
    pub consumer_id: String,
    pub asset_id: String,
    pub policy: Policy,
    pub signing_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    pub record: ProcessRecord<NegotiationState>,
    /// Counterparty-assigned process id; inbound messages correlate on this,
    /// never on our own `record.id`.
    pub correlation_id: Option<String>,
    pub counter_party_id: String,
    pub counter_party_address: String,
    pub protocol: String,
    /// Append-only; insertion order is significant.
    contract_offers: Vec<ContractOffer>,
    contract_agreement: Option<ContractAgreement>,
    pub kind: NegotiationKind,
}

impl ContractNegotiation {
    pub fn new(
        kind: NegotiationKind,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            record: ProcessRecord::new(NegotiationState::Initial),
            correlation_id: None,
            counter_party_id: counter_party_id.into(),
            counter_party_address: counter_party_address.into(),
            protocol: protocol.into(),
            contract_offers: Vec::new(),
            contract_agreement: None,
            kind,
        }
    }

    pub fn contract_offers(&self) -> &[ContractOffer] {
        &self.contract_offers
    }

    pub fn last_offer(&self) -> Option<&ContractOffer> {
        self.contract_offers.last()
    }

    pub fn append_offer(&mut self, offer: ContractOffer) {
        self.contract_offers.push(offer);
        self.record.touch();
    }

    pub fn contract_agreement(&self) -> Option<&ContractAgreement> {
        self.contract_agreement.as_ref()
    }

    /// First write wins; a second agreement is ignored.
    pub fn set_agreement(&mut self, agreement: ContractAgreement) {
        if self.contract_agreement.is_none() {
            self.contract_agreement = Some(agreement);
            self.record.touch();
        }
    }

    /// Reconstitution from storage; not part of the engine surface.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        record: ProcessRecord<NegotiationState>,
        correlation_id: Option<String>,
        counter_party_id: String,
        counter_party_address: String,
        protocol: String,
        contract_offers: Vec<ContractOffer>,
        contract_agreement: Option<ContractAgreement>,
        kind: NegotiationKind,
    ) -> Self {
        Self {
            record,
            correlation_id,
            counter_party_id,
            counter_party_address,
            protocol,
            contract_offers,
            contract_agreement,
            kind,
        }
    }
}

impl StatefulEntity for ContractNegotiation {
    type State = NegotiationState;

    fn entity_type() -> &'static str {
        "contract.negotiation"
    }

    fn record(&self) -> &ProcessRecord<NegotiationState> {
        &self.record
    }

    fn record_mut(&mut self) -> &mut ProcessRecord<NegotiationState> {
        &mut self.record
    }

    fn begin_termination(&mut self, reason: &str) {
        if self.record.state.is_terminal() {
            return;
        }
        self.record.transition_to(NegotiationState::Terminating);
        self.record.error_detail = Some(reason.to_string());
        self.record.pending = false;
    }
}
