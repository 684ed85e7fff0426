// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # HTTP Remote Message Dispatcher
//!
//! Posts negotiation messages to a counterparty endpoint and classifies the
//! outcome for the retry machinery: transport failures and 5xx/408/429
//! responses are retryable, every other rejection is fatal. A 2xx reply may
//! carry the counterparty's process id, which first-contact handlers use to
//! set the local correlation id.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::domain::dispatch::{DispatchError, DispatchResponse, RemoteMessageDispatcher};
use crate::domain::message::NegotiationMessage;

pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build dispatcher HTTP client")?;
        Ok(Self { client })
    }

    fn classify_status(status: StatusCode, body: &str) -> DispatchError {
        let detail = if body.is_empty() {
            format!("counterparty returned {status}")
        } else {
            let snippet: String = body.chars().take(200).collect();
            format!("counterparty returned {status}: {snippet}")
        };
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            DispatchError::Retryable(detail)
        } else {
            DispatchError::Fatal(detail)
        }
    }
}

#[async_trait]
impl RemoteMessageDispatcher for HttpDispatcher {
    async fn send(
        &self,
        address: &str,
        message: &NegotiationMessage,
    ) -> Result<DispatchResponse, DispatchError> {
        debug!(address, message = message.name(), "Dispatching message");

        let response = self
            .client
            .post(address)
            .json(message)
            .send()
            .await
            .map_err(|e| DispatchError::Retryable(format!("transport failure: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        // The ack body is optional and free-form; only the counterparty
        // process id is of interest here.
        let remote_process_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| {
                body.get("processId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });

        Ok(DispatchResponse { remote_process_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::negotiation::ContractOffer;
    use crate::domain::policy::Policy;

    fn request_message() -> NegotiationMessage {
        NegotiationMessage::ContractRequest {
            process_id: "local-1".to_string(),
            correlation_id: None,
            offer: ContractOffer::new("asset-1", Policy::default()),
            callback_address: None,
        }
    }

    fn dispatcher() -> HttpDispatcher {
        HttpDispatcher::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_success_extracts_remote_process_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/dsp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"processId": "remote-99"}"#)
            .create_async()
            .await;

        let result = dispatcher()
            .send(&format!("{}/dsp", server.url()), &request_message())
            .await
            .unwrap();
        assert_eq!(result.remote_process_id.as_deref(), Some("remote-99"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_body_is_still_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/dsp")
            .with_status(204)
            .create_async()
            .await;

        let result = dispatcher()
            .send(&format!("{}/dsp", server.url()), &request_message())
            .await
            .unwrap();
        assert!(result.remote_process_id.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/dsp")
            .with_status(503)
            .create_async()
            .await;

        let err = dispatcher()
            .send(&format!("{}/dsp", server.url()), &request_message())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_rejection_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/dsp")
            .with_status(400)
            .with_body("malformed offer")
            .create_async()
            .await;

        let err = dispatcher()
            .send(&format!("{}/dsp", server.url()), &request_message())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("malformed offer"));
    }

    #[tokio::test]
    async fn test_connection_failure_is_retryable() {
        let err = dispatcher()
            .send("http://127.0.0.1:1/unreachable", &request_message())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
