// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Inbound Message Handler
//!
//! Applies the counterparty's side of the conversation: resolves the target
//! negotiation by correlation id and performs an idempotent direct
//! transition under lease. The policy gate runs **before** any store access;
//! an unauthorized caller never observes whether the entity exists.
//!
//! Idempotency contract: counterparties retry with their own backoff, so a
//! duplicate of an already-applied message is acknowledged as a no-op and
//! leaves the entity (including `updated_at`) untouched. A message for a
//! state the negotiation has already moved past is an out-of-order protocol
//! violation and is rejected with a conflict.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::entity::{ProcessId, ProcessState, StatefulEntity};
use crate::domain::events::ProcessEvent;
use crate::domain::message::{NegotiationEventType, NegotiationMessage};
use crate::domain::negotiation::{ContractNegotiation, NegotiationState};
use crate::domain::policy::{ParticipantAgent, PolicyGate};
use crate::domain::repository::{NegotiationStore, StoreError};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no negotiation for correlation id '{0}'")]
    NotFound(String),

    /// Message valid but inapplicable to the current state, or the entity is
    /// momentarily leased; the counterparty may retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for InboundError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseConflict(id) => {
                InboundError::Conflict(format!("negotiation {id} is currently leased"))
            }
            other => InboundError::Store(other),
        }
    }
}

/// Acknowledgement returned to the protocol controller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Ack {
    pub negotiation_id: ProcessId,
    pub state: String,
    /// False when the message was a recognized duplicate.
    pub changed: bool,
}

/// The legal direct transition implied by a message type.
struct InboundTransition {
    target: NegotiationState,
    valid_from: &'static [NegotiationState],
    /// Termination applies from every non-terminal state.
    from_any_non_terminal: bool,
}

impl InboundTransition {
    fn for_message(message: &NegotiationMessage) -> Option<Self> {
        match message {
            // Creation of new negotiations from a contract request is the
            // API-facing collaborator's job, not a direct transition.
            NegotiationMessage::ContractRequest { .. } => None,
            NegotiationMessage::ContractOffer { .. } => Some(Self {
                target: NegotiationState::Offered,
                valid_from: &[NegotiationState::Requested],
                from_any_non_terminal: false,
            }),
            NegotiationMessage::NegotiationEvent { event, .. } => match event {
                NegotiationEventType::Accepted => Some(Self {
                    target: NegotiationState::Accepted,
                    valid_from: &[NegotiationState::Offered],
                    from_any_non_terminal: false,
                }),
                NegotiationEventType::Finalized => Some(Self {
                    target: NegotiationState::Finalized,
                    valid_from: &[NegotiationState::Verified],
                    from_any_non_terminal: false,
                }),
            },
            NegotiationMessage::ContractAgreement { .. } => Some(Self {
                target: NegotiationState::Agreed,
                valid_from: &[NegotiationState::Requested, NegotiationState::Accepted],
                from_any_non_terminal: false,
            }),
            NegotiationMessage::AgreementVerification { .. } => Some(Self {
                target: NegotiationState::Verified,
                valid_from: &[NegotiationState::Agreed],
                from_any_non_terminal: false,
            }),
            NegotiationMessage::Termination { .. } => Some(Self {
                target: NegotiationState::Terminated,
                valid_from: &[],
                from_any_non_terminal: true,
            }),
        }
    }

    fn applies_from(&self, state: NegotiationState) -> bool {
        if self.from_any_non_terminal {
            !state.is_terminal()
        } else {
            self.valid_from.contains(&state)
        }
    }
}

pub struct InboundNegotiationService {
    store: Arc<dyn NegotiationStore>,
    policy_gate: Arc<dyn PolicyGate>,
    event_bus: EventBus,
}

impl InboundNegotiationService {
    pub fn new(
        store: Arc<dyn NegotiationStore>,
        policy_gate: Arc<dyn PolicyGate>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            policy_gate,
            event_bus,
        }
    }

    pub async fn handle(
        &self,
        message: &NegotiationMessage,
        agent: &ParticipantAgent,
    ) -> Result<Ack, InboundError> {
        // Authorization precedes every store access; a rejected caller makes
        // no state change and takes no lease.
        let policy = message.policy().cloned().unwrap_or_default();
        self.policy_gate
            .evaluate(message.policy_scope(), &policy, agent)
            .await
            .map_err(|e| InboundError::Unauthorized(e.to_string()))?;

        let correlation_id = message.correlation_id().ok_or_else(|| {
            InboundError::Conflict(format!("{} carries no correlation id", message.name()))
        })?;

        let resolved = self
            .store
            .find_by_correlation_id(correlation_id)
            .await?
            .ok_or_else(|| InboundError::NotFound(correlation_id.to_string()))?;
        let mut negotiation = self.store.find_by_id_and_lease(resolved.id()).await?;

        let transition = InboundTransition::for_message(message).ok_or_else(|| {
            InboundError::Conflict(format!("{} is not a direct transition", message.name()))
        })?;

        let current = negotiation.state();
        if current == transition.target {
            // Retransmission of an already-applied message: acknowledge
            // without touching the entity.
            debug!(
                negotiation_id = %negotiation.id(),
                state = current.label(),
                message = message.name(),
                "Duplicate inbound message, acknowledging as no-op"
            );
            self.store.release(negotiation.id()).await?;
            return Ok(Ack {
                negotiation_id: negotiation.id().clone(),
                state: current.label().to_string(),
                changed: false,
            });
        }

        if !transition.applies_from(current) {
            warn!(
                negotiation_id = %negotiation.id(),
                state = current.label(),
                message = message.name(),
                "Out-of-order inbound message"
            );
            self.store.release(negotiation.id()).await?;
            return Err(InboundError::Conflict(format!(
                "{} not applicable in state {}",
                message.name(),
                current.label()
            )));
        }

        match message {
            NegotiationMessage::ContractOffer { offer, .. } => {
                negotiation.append_offer(offer.clone());
            }
            NegotiationMessage::ContractAgreement { agreement, .. } => {
                negotiation.set_agreement(agreement.clone());
            }
            NegotiationMessage::Termination { reason, .. } => {
                negotiation.record_mut().error_detail = reason.clone();
            }
            _ => {}
        }
        negotiation.record_mut().pending = false;
        negotiation.record_mut().transition_to(transition.target);

        self.store.save(&negotiation).await?;
        self.event_bus.publish(ProcessEvent::state_changed(&negotiation));

        debug!(
            negotiation_id = %negotiation.id(),
            from = current.label(),
            to = transition.target.label(),
            message = message.name(),
            "Inbound transition applied"
        );
        Ok(Ack {
            negotiation_id: negotiation.id().clone(),
            state: transition.target.label().to_string(),
            changed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::negotiation::{ContractAgreement, ContractOffer, NegotiationKind};
    use crate::domain::policy::{PermitAllGate, Policy, PolicyError};
    use crate::domain::repository::ProcessStore;
    use crate::infrastructure::repositories::InMemoryNegotiationStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct DenyAllGate;

    #[async_trait]
    impl PolicyGate for DenyAllGate {
        async fn evaluate(
            &self,
            scope: &str,
            _policy: &Policy,
            _agent: &ParticipantAgent,
        ) -> Result<(), PolicyError> {
            Err(PolicyError::Denied {
                scope: scope.to_string(),
                reason: "token rejected".to_string(),
            })
        }
    }

    fn agreement_message() -> NegotiationMessage {
        NegotiationMessage::ContractAgreement {
            process_id: "remote-1".to_string(),
            correlation_id: "local-1".to_string(),
            agreement: ContractAgreement {
                id: "agreement-1".to_string(),
                provider_id: "provider-1".to_string(),
                consumer_id: "consumer-1".to_string(),
                asset_id: "asset-1".to_string(),
                policy: Policy::default(),
                signing_date: Utc::now(),
            },
        }
    }

    async fn seeded_service(
        state: NegotiationState,
    ) -> (InboundNegotiationService, Arc<InMemoryNegotiationStore>, ContractNegotiation) {
        let store = Arc::new(InMemoryNegotiationStore::new("inbound", Duration::from_secs(30)));
        let mut negotiation = ContractNegotiation::new(
            NegotiationKind::Provider,
            "consumer-1",
            "http://consumer.example/dsp",
            "dataspace-protocol-http",
        );
        negotiation.append_offer(ContractOffer::new("asset-1", Policy::default()));
        negotiation.correlation_id = Some("remote-1".to_string());
        negotiation.record_mut().transition_to(state);
        store.save(&negotiation).await.unwrap();

        let service = InboundNegotiationService::new(
            store.clone() as Arc<dyn NegotiationStore>,
            Arc::new(PermitAllGate),
            EventBus::with_default_capacity(),
        );
        (service, store, negotiation)
    }

    #[tokio::test]
    async fn test_agreement_message_transitions_and_populates_agreement() {
        let (service, store, seeded) = seeded_service(NegotiationState::Requested).await;
        let agent = ParticipantAgent::new("did:web:consumer.example");

        let ack = service.handle(&agreement_message(), &agent).await.unwrap();
        assert!(ack.changed);
        assert_eq!(ack.state, "AGREED");

        let reloaded = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state(), NegotiationState::Agreed);
        assert_eq!(
            reloaded.contract_agreement().map(|a| a.id.as_str()),
            Some("agreement-1")
        );
        assert!(!reloaded.record.pending);
    }

    #[tokio::test]
    async fn test_duplicate_message_is_noop_and_preserves_updated_at() {
        let (service, store, seeded) = seeded_service(NegotiationState::Requested).await;
        let agent = ParticipantAgent::new("did:web:consumer.example");

        service.handle(&agreement_message(), &agent).await.unwrap();
        let after_first = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();

        let ack = service.handle(&agreement_message(), &agent).await.unwrap();
        assert!(!ack.changed);

        let after_second = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(after_second.state(), NegotiationState::Agreed);
        assert_eq!(after_second.record.updated_at, after_first.record.updated_at);

        // The no-op path released its lease.
        assert!(store.find_by_id_and_lease(&seeded.record.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_order_message_is_conflict() {
        let (service, store, seeded) = seeded_service(NegotiationState::Requested).await;
        let agent = ParticipantAgent::new("did:web:consumer.example");

        let verification = NegotiationMessage::AgreementVerification {
            process_id: "remote-1".to_string(),
            correlation_id: "local-1".to_string(),
        };
        let err = service.handle(&verification, &agent).await.unwrap_err();
        assert!(matches!(err, InboundError::Conflict(_)));

        let untouched = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(untouched.state(), NegotiationState::Requested);
    }

    #[tokio::test]
    async fn test_unauthorized_caller_touches_nothing() {
        let store = Arc::new(InMemoryNegotiationStore::new("inbound", Duration::from_secs(30)));
        let mut negotiation = ContractNegotiation::new(
            NegotiationKind::Provider,
            "consumer-1",
            "http://consumer.example/dsp",
            "dataspace-protocol-http",
        );
        negotiation.correlation_id = Some("remote-1".to_string());
        negotiation.record_mut().transition_to(NegotiationState::Requested);
        store.save(&negotiation).await.unwrap();

        let service = InboundNegotiationService::new(
            store.clone() as Arc<dyn NegotiationStore>,
            Arc::new(DenyAllGate),
            EventBus::with_default_capacity(),
        );
        let agent = ParticipantAgent::new("did:web:attacker.example");

        let err = service.handle(&agreement_message(), &agent).await.unwrap_err();
        assert!(matches!(err, InboundError::Unauthorized(_)));

        let untouched = store.find_by_id(&negotiation.record.id).await.unwrap().unwrap();
        assert_eq!(untouched.state(), NegotiationState::Requested);
        assert_eq!(untouched.record.updated_at, negotiation.record.updated_at);
        // No lease was even attempted.
        assert!(store.find_by_id_and_lease(&negotiation.record.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_not_found() {
        let store = Arc::new(InMemoryNegotiationStore::new("inbound", Duration::from_secs(30)));
        let service = InboundNegotiationService::new(
            store as Arc<dyn NegotiationStore>,
            Arc::new(PermitAllGate),
            EventBus::with_default_capacity(),
        );
        let agent = ParticipantAgent::new("did:web:consumer.example");

        let err = service.handle(&agreement_message(), &agent).await.unwrap_err();
        assert!(matches!(err, InboundError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_termination_applies_from_any_non_terminal_state() {
        let (service, store, seeded) = seeded_service(NegotiationState::Agreed).await;
        let agent = ParticipantAgent::new("did:web:consumer.example");

        let termination = NegotiationMessage::Termination {
            process_id: "remote-1".to_string(),
            correlation_id: "local-1".to_string(),
            reason: Some("counterparty withdrew".to_string()),
        };
        let ack = service.handle(&termination, &agent).await.unwrap();
        assert!(ack.changed);

        let reloaded = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state(), NegotiationState::Terminated);
        assert_eq!(
            reloaded.record.error_detail.as_deref(),
            Some("counterparty withdrew")
        );
    }

    #[tokio::test]
    async fn test_terminal_entity_rejects_inapplicable_message() {
        let (service, store, seeded) = seeded_service(NegotiationState::Terminated).await;
        let agent = ParticipantAgent::new("did:web:consumer.example");

        let err = service.handle(&agreement_message(), &agent).await.unwrap_err();
        assert!(matches!(err, InboundError::Conflict(_)));

        let untouched = store.find_by_id(&seeded.record.id).await.unwrap().unwrap();
        assert_eq!(untouched.state(), NegotiationState::Terminated);
    }

    #[tokio::test]
    async fn test_leased_entity_surfaces_conflict() {
        let (service, store, seeded) = seeded_service(NegotiationState::Requested).await;
        let other_worker = store.clone_handle("tick-worker");
        other_worker.find_by_id_and_lease(&seeded.record.id).await.unwrap();

        let agent = ParticipantAgent::new("did:web:consumer.example");
        let err = service.handle(&agreement_message(), &agent).await.unwrap_err();
        assert!(matches!(err, InboundError::Conflict(_)));
    }
}
