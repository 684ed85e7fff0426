// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Negotiation Transition Handlers
//!
//! Every transient negotiation state (and the stable-but-actionable
//! `Terminating`) means "about to perform one send". One configurable
//! handler covers them all: optional policy pre-check, optional agreement
//! creation, message build, dispatch, advance to the next stable state.
//! [`negotiation_handlers`] assembles the full table registered with the
//! process manager at startup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::application::process_manager::{TransitionError, TransitionHandler};
use crate::domain::dispatch::RemoteMessageDispatcher;
use crate::domain::entity::StatefulEntity;
use crate::domain::message::{NegotiationEventType, NegotiationMessage};
use crate::domain::negotiation::{ContractAgreement, ContractNegotiation, NegotiationKind, NegotiationState};
use crate::domain::policy::{scopes, ParticipantAgent, PolicyGate};

type MessageBuilder = fn(&ContractNegotiation) -> Result<NegotiationMessage, TransitionError>;

/// Send-one-message handler: on dispatch success the entity advances to
/// `next_state` with `pending` cleared; failures surface classified for the
/// process manager's retry machinery.
pub struct DispatchTransitionHandler {
    state: NegotiationState,
    next_state: NegotiationState,
    build: MessageBuilder,
    policy_scope: Option<&'static str>,
    creates_agreement: bool,
    participant_id: String,
    dispatcher: Arc<dyn RemoteMessageDispatcher>,
    policy_gate: Arc<dyn PolicyGate>,
}

impl DispatchTransitionHandler {
    pub fn new(
        state: NegotiationState,
        next_state: NegotiationState,
        build: MessageBuilder,
        participant_id: impl Into<String>,
        dispatcher: Arc<dyn RemoteMessageDispatcher>,
        policy_gate: Arc<dyn PolicyGate>,
    ) -> Self {
        Self {
            state,
            next_state,
            build,
            policy_scope: None,
            creates_agreement: false,
            participant_id: participant_id.into(),
            dispatcher,
            policy_gate,
        }
    }

    /// Evaluate the policy gate against the last offer before dispatching;
    /// denial is fatal.
    pub fn with_policy_scope(mut self, scope: &'static str) -> Self {
        self.policy_scope = Some(scope);
        self
    }

    /// Create the contract agreement from the last offer before building the
    /// message (provider-side `Agreeing`).
    pub fn with_agreement_creation(mut self) -> Self {
        self.creates_agreement = true;
        self
    }

    fn create_agreement(&self, negotiation: &mut ContractNegotiation) -> Result<(), TransitionError> {
        if negotiation.contract_agreement().is_some() {
            return Ok(());
        }
        let offer = negotiation
            .last_offer()
            .ok_or_else(|| TransitionError::Fatal("no contract offer to agree on".to_string()))?
            .clone();
        let (provider_id, consumer_id) = match negotiation.kind {
            NegotiationKind::Provider => {
                (self.participant_id.clone(), negotiation.counter_party_id.clone())
            }
            NegotiationKind::Consumer => {
                (negotiation.counter_party_id.clone(), self.participant_id.clone())
            }
        };
        negotiation.set_agreement(ContractAgreement {
            id: Uuid::new_v4().to_string(),
            provider_id,
            consumer_id,
            asset_id: offer.asset_id,
            policy: offer.policy,
            signing_date: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl TransitionHandler<ContractNegotiation> for DispatchTransitionHandler {
    fn state(&self) -> NegotiationState {
        self.state
    }

    async fn process(&self, negotiation: &mut ContractNegotiation) -> Result<(), TransitionError> {
        if let Some(scope) = self.policy_scope {
            let policy = negotiation
                .last_offer()
                .map(|offer| offer.policy.clone())
                .unwrap_or_default();
            let agent = ParticipantAgent::new(negotiation.counter_party_id.clone());
            self.policy_gate
                .evaluate(scope, &policy, &agent)
                .await
                .map_err(|e| TransitionError::Fatal(e.to_string()))?;
        }

        if self.creates_agreement {
            self.create_agreement(negotiation)?;
        }

        let message = (self.build)(negotiation)?;
        let response = self
            .dispatcher
            .send(&negotiation.counter_party_address, &message)
            .await?;

        if negotiation.correlation_id.is_none() {
            negotiation.correlation_id = response.remote_process_id;
        }
        negotiation.record_mut().pending = false;
        negotiation.record_mut().transition_to(self.next_state);
        Ok(())
    }
}

fn correlation(negotiation: &ContractNegotiation) -> Result<String, TransitionError> {
    negotiation
        .correlation_id
        .clone()
        .ok_or_else(|| TransitionError::Fatal("negotiation has no correlation id".to_string()))
}

fn build_contract_request(n: &ContractNegotiation) -> Result<NegotiationMessage, TransitionError> {
    let offer = n
        .last_offer()
        .cloned()
        .ok_or_else(|| TransitionError::Fatal("no contract offer to request".to_string()))?;
    Ok(NegotiationMessage::ContractRequest {
        process_id: n.id().to_string(),
        correlation_id: n.correlation_id.clone(),
        offer,
        callback_address: None,
    })
}

fn build_contract_offer(n: &ContractNegotiation) -> Result<NegotiationMessage, TransitionError> {
    let offer = n
        .last_offer()
        .cloned()
        .ok_or_else(|| TransitionError::Fatal("no contract offer to send".to_string()))?;
    Ok(NegotiationMessage::ContractOffer {
        process_id: n.id().to_string(),
        correlation_id: correlation(n)?,
        offer,
    })
}

fn build_accepted_event(n: &ContractNegotiation) -> Result<NegotiationMessage, TransitionError> {
    Ok(NegotiationMessage::NegotiationEvent {
        process_id: n.id().to_string(),
        correlation_id: correlation(n)?,
        event: NegotiationEventType::Accepted,
    })
}

fn build_contract_agreement(n: &ContractNegotiation) -> Result<NegotiationMessage, TransitionError> {
    let agreement = n
        .contract_agreement()
        .cloned()
        .ok_or_else(|| TransitionError::Fatal("no contract agreement to send".to_string()))?;
    Ok(NegotiationMessage::ContractAgreement {
        process_id: n.id().to_string(),
        correlation_id: correlation(n)?,
        agreement,
    })
}

fn build_verification(n: &ContractNegotiation) -> Result<NegotiationMessage, TransitionError> {
    Ok(NegotiationMessage::AgreementVerification {
        process_id: n.id().to_string(),
        correlation_id: correlation(n)?,
    })
}

fn build_finalized_event(n: &ContractNegotiation) -> Result<NegotiationMessage, TransitionError> {
    Ok(NegotiationMessage::NegotiationEvent {
        process_id: n.id().to_string(),
        correlation_id: correlation(n)?,
        event: NegotiationEventType::Finalized,
    })
}

fn build_termination(n: &ContractNegotiation) -> Result<NegotiationMessage, TransitionError> {
    Ok(NegotiationMessage::Termination {
        process_id: n.id().to_string(),
        correlation_id: correlation(n)?,
        reason: n.record().error_detail.clone(),
    })
}

/// The full negotiation handler table. Consumer and provider entities share
/// one table: state membership already separates the two sides, so a mixed
/// store needs only one process manager.
pub fn negotiation_handlers(
    participant_id: &str,
    dispatcher: Arc<dyn RemoteMessageDispatcher>,
    policy_gate: Arc<dyn PolicyGate>,
) -> Vec<Arc<dyn TransitionHandler<ContractNegotiation>>> {
    let handler = |state, next, build: MessageBuilder| {
        DispatchTransitionHandler::new(
            state,
            next,
            build,
            participant_id,
            Arc::clone(&dispatcher),
            Arc::clone(&policy_gate),
        )
    };

    vec![
        Arc::new(handler(
            NegotiationState::Requesting,
            NegotiationState::Requested,
            build_contract_request,
        )),
        Arc::new(handler(
            NegotiationState::Offering,
            NegotiationState::Offered,
            build_contract_offer,
        )),
        Arc::new(handler(
            NegotiationState::Accepting,
            NegotiationState::Accepted,
            build_accepted_event,
        )),
        Arc::new(
            handler(
                NegotiationState::Agreeing,
                NegotiationState::Agreed,
                build_contract_agreement,
            )
            .with_policy_scope(scopes::NEGOTIATION_AGREE)
            .with_agreement_creation(),
        ),
        Arc::new(handler(
            NegotiationState::Verifying,
            NegotiationState::Verified,
            build_verification,
        )),
        Arc::new(handler(
            NegotiationState::Finalizing,
            NegotiationState::Finalized,
            build_finalized_event,
        )),
        Arc::new(handler(
            NegotiationState::Terminating,
            NegotiationState::Terminated,
            build_termination,
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dispatch::{DispatchError, DispatchResponse};
    use crate::domain::negotiation::ContractOffer;
    use crate::domain::policy::{PermitAllGate, Policy, PolicyError};
    use tokio::sync::Mutex;

    struct MockDispatcher {
        sent: Mutex<Vec<(String, NegotiationMessage)>>,
        results: Mutex<Vec<Result<DispatchResponse, DispatchError>>>,
    }

    impl MockDispatcher {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
            }
        }

        fn with_response(self, response: DispatchResponse) -> Self {
            self.results.try_lock().unwrap().push(Ok(response));
            self
        }
    }

    #[async_trait]
    impl RemoteMessageDispatcher for MockDispatcher {
        async fn send(
            &self,
            address: &str,
            message: &NegotiationMessage,
        ) -> Result<DispatchResponse, DispatchError> {
            self.sent
                .lock()
                .await
                .push((address.to_string(), message.clone()));
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Ok(DispatchResponse::default())
            } else {
                results.remove(0)
            }
        }
    }

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
                reason: "constraint unsatisfied".to_string(),
            })
        }
    }

    fn negotiation(kind: NegotiationKind, state: NegotiationState) -> ContractNegotiation {
        let mut negotiation = ContractNegotiation::new(
            kind,
            "counterparty-1",
            "http://counterparty.example/dsp",
            "dataspace-protocol-http",
        );
        negotiation.append_offer(ContractOffer::new("asset-1", Policy::default()));
        negotiation.record_mut().transition_to(state);
        negotiation
    }

    #[tokio::test]
    async fn test_requesting_advances_and_adopts_remote_process_id() {
        let dispatcher = Arc::new(MockDispatcher::new().with_response(DispatchResponse {
            remote_process_id: Some("remote-99".to_string()),
        }));
        let handlers = negotiation_handlers("did:web:self", dispatcher.clone(), Arc::new(PermitAllGate));
        let requesting = handlers
            .iter()
            .find(|h| h.state() == NegotiationState::Requesting)
            .unwrap();

        let mut n = negotiation(NegotiationKind::Consumer, NegotiationState::Requesting);
        n.record_mut().pending = true;
        requesting.process(&mut n).await.unwrap();

        assert_eq!(n.state(), NegotiationState::Requested);
        assert_eq!(n.correlation_id.as_deref(), Some("remote-99"));
        assert!(!n.record().pending);
        assert_eq!(dispatcher.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_requesting_without_offer_is_fatal() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let handlers = negotiation_handlers("did:web:self", dispatcher.clone(), Arc::new(PermitAllGate));
        let requesting = handlers
            .iter()
            .find(|h| h.state() == NegotiationState::Requesting)
            .unwrap();

        let mut n = ContractNegotiation::new(
            NegotiationKind::Consumer,
            "counterparty-1",
            "http://counterparty.example/dsp",
            "dataspace-protocol-http",
        );
        n.record_mut().transition_to(NegotiationState::Requesting);

        let err = requesting.process(&mut n).await.unwrap_err();
        assert!(matches!(err, TransitionError::Fatal(_)));
        assert!(dispatcher.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_agreeing_creates_agreement_with_participant_ids() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let handlers =
            negotiation_handlers("did:web:provider", dispatcher.clone(), Arc::new(PermitAllGate));
        let agreeing = handlers
            .iter()
            .find(|h| h.state() == NegotiationState::Agreeing)
            .unwrap();

        let mut n = negotiation(NegotiationKind::Provider, NegotiationState::Agreeing);
        n.correlation_id = Some("remote-1".to_string());
        agreeing.process(&mut n).await.unwrap();

        assert_eq!(n.state(), NegotiationState::Agreed);
        let agreement = n.contract_agreement().unwrap();
        assert_eq!(agreement.provider_id, "did:web:provider");
        assert_eq!(agreement.consumer_id, "counterparty-1");
        assert_eq!(agreement.asset_id, "asset-1");

        let sent = dispatcher.sent.lock().await;
        assert!(matches!(
            sent[0].1,
            NegotiationMessage::ContractAgreement { .. }
        ));
    }

    #[tokio::test]
    async fn test_agreeing_policy_denial_is_fatal_and_skips_dispatch() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let handlers =
            negotiation_handlers("did:web:provider", dispatcher.clone(), Arc::new(DenyAllGate));
        let agreeing = handlers
            .iter()
            .find(|h| h.state() == NegotiationState::Agreeing)
            .unwrap();

        let mut n = negotiation(NegotiationKind::Provider, NegotiationState::Agreeing);
        n.correlation_id = Some("remote-1".to_string());

        let err = agreeing.process(&mut n).await.unwrap_err();
        assert!(matches!(err, TransitionError::Fatal(_)));
        assert_eq!(n.state(), NegotiationState::Agreeing);
        assert!(dispatcher.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminating_sends_reason_and_terminates() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let handlers = negotiation_handlers("did:web:self", dispatcher.clone(), Arc::new(PermitAllGate));
        let terminating = handlers
            .iter()
            .find(|h| h.state() == NegotiationState::Terminating)
            .unwrap();

        let mut n = negotiation(NegotiationKind::Consumer, NegotiationState::Requesting);
        n.correlation_id = Some("remote-1".to_string());
        n.begin_termination("retries exhausted");

        terminating.process(&mut n).await.unwrap();
        assert_eq!(n.state(), NegotiationState::Terminated);

        let sent = dispatcher.sent.lock().await;
        match &sent[0].1 {
            NegotiationMessage::Termination { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("retries exhausted"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_correlation_id_is_fatal() {
        let dispatcher = Arc::new(MockDispatcher::new());
        let handlers = negotiation_handlers("did:web:self", dispatcher.clone(), Arc::new(PermitAllGate));
        let verifying = handlers
            .iter()
            .find(|h| h.state() == NegotiationState::Verifying)
            .unwrap();

        let mut n = negotiation(NegotiationKind::Consumer, NegotiationState::Verifying);
        let err = verifying.process(&mut n).await.unwrap_err();
        assert!(matches!(err, TransitionError::Fatal(_)));
        assert!(dispatcher.sent.lock().await.is_empty());
    }
}
