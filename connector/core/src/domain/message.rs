// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Negotiation Protocol Messages
//!
//! In-process representation of the messages exchanged between counterparties.
//! Wire encoding/decoding (JSON-LD, HTTP controllers) happens outside this
//! crate; the dispatcher and the inbound handler both work on these values.
//!
//! `process_id` is always the **sender's** process id; from the receiver's
//! perspective it is the correlation id that resolves the local entity.

use serde::{Deserialize, Serialize};

use crate::domain::negotiation::{ContractAgreement, ContractOffer};
use crate::domain::policy::{scopes, Policy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationEventType {
    Accepted,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NegotiationMessage {
    ContractRequest {
        process_id: String,
        correlation_id: Option<String>,
        offer: ContractOffer,
        callback_address: Option<String>,
    },
    ContractOffer {
        process_id: String,
        correlation_id: String,
        offer: ContractOffer,
    },
    ContractAgreement {
        process_id: String,
        correlation_id: String,
        agreement: ContractAgreement,
    },
    AgreementVerification {
        process_id: String,
        correlation_id: String,
    },
    NegotiationEvent {
        process_id: String,
        correlation_id: String,
        event: NegotiationEventType,
    },
    Termination {
        process_id: String,
        correlation_id: String,
        reason: Option<String>,
    },
}

impl NegotiationMessage {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationMessage::ContractRequest { .. } => "ContractRequestMessage",
            NegotiationMessage::ContractOffer { .. } => "ContractOfferMessage",
            NegotiationMessage::ContractAgreement { .. } => "ContractAgreementMessage",
            NegotiationMessage::AgreementVerification { .. } => {
                "ContractAgreementVerificationMessage"
            }
            NegotiationMessage::NegotiationEvent { .. } => "ContractNegotiationEventMessage",
            NegotiationMessage::Termination { .. } => "ContractNegotiationTerminationMessage",
        }
    }

    /// Correlation id an inbound receiver resolves the local entity with.
    /// Absent only on an initial contract request, which creates the entity
    /// instead of correlating to one.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            NegotiationMessage::ContractRequest { correlation_id, .. } => {
                correlation_id.as_deref()
            }
            NegotiationMessage::ContractOffer { process_id, .. }
            | NegotiationMessage::ContractAgreement { process_id, .. }
            | NegotiationMessage::AgreementVerification { process_id, .. }
            | NegotiationMessage::NegotiationEvent { process_id, .. }
            | NegotiationMessage::Termination { process_id, .. } => Some(process_id),
        }
    }

    pub fn policy_scope(&self) -> &'static str {
        match self {
            NegotiationMessage::ContractRequest { .. } => scopes::NEGOTIATION_REQUEST,
            NegotiationMessage::ContractOffer { .. } => scopes::NEGOTIATION_OFFER,
            NegotiationMessage::ContractAgreement { .. } => scopes::NEGOTIATION_AGREE,
            NegotiationMessage::AgreementVerification { .. } => scopes::NEGOTIATION_VERIFY,
            NegotiationMessage::NegotiationEvent { event, .. } => match event {
                NegotiationEventType::Accepted => scopes::NEGOTIATION_ACCEPT,
                NegotiationEventType::Finalized => scopes::NEGOTIATION_FINALIZE,
            },
            NegotiationMessage::Termination { .. } => scopes::NEGOTIATION_TERMINATE,
        }
    }

    /// Policy embedded in the message, where the message type carries one.
    pub fn policy(&self) -> Option<&Policy> {
        match self {
            NegotiationMessage::ContractRequest { offer, .. }
            | NegotiationMessage::ContractOffer { offer, .. } => Some(&offer.policy),
            NegotiationMessage::ContractAgreement { agreement, .. } => Some(&agreement.policy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_is_sender_process_id() {
        let message = NegotiationMessage::Termination {
            process_id: "remote-42".to_string(),
            correlation_id: "local-1".to_string(),
            reason: Some("cancelled".to_string()),
        };
        assert_eq!(message.correlation_id(), Some("remote-42"));
    }

    #[test]
    fn test_event_scope_follows_event_type() {
        let accepted = NegotiationMessage::NegotiationEvent {
            process_id: "remote-42".to_string(),
            correlation_id: "local-1".to_string(),
            event: NegotiationEventType::Accepted,
        };
        let finalized = NegotiationMessage::NegotiationEvent {
            process_id: "remote-42".to_string(),
            correlation_id: "local-1".to_string(),
            event: NegotiationEventType::Finalized,
        };
        assert_eq!(accepted.policy_scope(), scopes::NEGOTIATION_ACCEPT);
        assert_eq!(finalized.policy_scope(), scopes::NEGOTIATION_FINALIZE);
    }
}
