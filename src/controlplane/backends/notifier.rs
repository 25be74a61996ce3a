//! Revocation Transports
//!
//! Adapters that tell clients their handle was revoked:
//! - `NullNotifier`: drops every notice
//! - `ChannelNotifier`: in-process mailboxes keyed by client identity
//! - `WebhookNotifier`: JSON POST to a client callback endpoint

use crate::domain::ports::{EvictionNotifier, Revocation};
use crate::domain::ClientIdentity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

// =============================================================================
// Null Notifier
// =============================================================================

/// Transport for servers without a client channel
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl EvictionNotifier for NullNotifier {
    async fn notify(&self, revocation: &Revocation) -> Result<()> {
        debug!(handle = %revocation.handle, "revocation dropped");
        Ok(())
    }

    fn transport(&self) -> &str {
        "null"
    }
}

// =============================================================================
// Channel Notifier
// =============================================================================

/// Delivers revocations to in-process clients, one mailbox per identity.
/// Sessions of the same uid/gid get separate mailboxes.
#[derive(Debug, Default)]
pub struct ChannelNotifier {
    mailboxes: DashMap<ClientIdentity, mpsc::UnboundedSender<Revocation>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mailbox for `client`, replacing any previous one
    pub fn subscribe(&self, client: &ClientIdentity) -> mpsc::UnboundedReceiver<Revocation> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.insert(client.clone(), tx);
        rx
    }

    pub fn unsubscribe(&self, client: &ClientIdentity) {
        self.mailboxes.remove(client);
    }
}

#[async_trait]
impl EvictionNotifier for ChannelNotifier {
    async fn notify(&self, revocation: &Revocation) -> Result<()> {
        let sender = self
            .mailboxes
            .get(&revocation.client)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Notification {
                handle: revocation.handle.to_string(),
                reason: format!("no mailbox for client {}", revocation.client),
            })?;

        sender.send(revocation.clone()).map_err(|_| Error::Notification {
            handle: revocation.handle.to_string(),
            reason: "client mailbox closed".into(),
        })
    }

    fn transport(&self) -> &str {
        "channel"
    }
}

// =============================================================================
// Webhook Notifier
// =============================================================================

/// Posts revocations to an HTTP endpoint
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("webhook client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl EvictionNotifier for WebhookNotifier {
    async fn notify(&self, revocation: &Revocation) -> Result<()> {
        let failed = |reason: String| Error::Notification {
            handle: revocation.handle.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(revocation)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("endpoint returned {}", response.status())));
        }
        Ok(())
    }

    fn transport(&self) -> &str {
        "webhook"
    }
}
