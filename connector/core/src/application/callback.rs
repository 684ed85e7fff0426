// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Callback Notifier - Background task for registered endpoints
//!
//! Subscribes to the event bus and POSTs each state-change event to the
//! entity's registered callback addresses whose event filter matches.
//! Delivery is fire-and-forget: failures are logged and never roll back the
//! state change that produced the event.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::ProcessEvent;
use crate::infrastructure::event_bus::{EventBus, EventBusError};

#[derive(Debug, Clone)]
pub struct CallbackNotifierConfig {
    /// Per-request timeout for callback delivery
    pub request_timeout: Duration,
}

impl Default for CallbackNotifierConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct CallbackNotifier {
    client: reqwest::Client,
    event_bus: EventBus,
    shutdown_token: CancellationToken,
}

impl CallbackNotifier {
    pub fn new(event_bus: EventBus, config: CallbackNotifierConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            event_bus,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the notifier background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!("Starting callback notifier background task");
        let mut receiver = self.event_bus.subscribe();

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping callback notifier");
                    break;
                }
                received = receiver.recv() => {
                    match received {
                        Ok(event) => self.notify(&event).await,
                        Err(EventBusError::Lagged(n)) => {
                            warn!(dropped = n, "Callback notifier lagged, events dropped");
                        }
                        Err(_) => {
                            info!("Event bus closed, stopping callback notifier");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Deliver one event to every matching callback address.
    pub async fn notify(&self, event: &ProcessEvent) {
        let event_name = event.name();
        for callback in event.callbacks() {
            if !callback.matches(&event_name) {
                continue;
            }
            match self.client.post(&callback.uri).json(event).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        uri = %callback.uri,
                        event = %event_name,
                        "Callback delivered"
                    );
                }
                Ok(response) => {
                    warn!(
                        uri = %callback.uri,
                        event = %event_name,
                        status = %response.status(),
                        "Callback endpoint rejected event"
                    );
                }
                Err(e) => {
                    warn!(
                        uri = %callback.uri,
                        event = %event_name,
                        error = %e,
                        "Callback delivery failed"
                    );
                }
            }
        }
    }
}
