//! Backend Adapters
//!
//! Provides adapters for the service's ports:
//! - Server groups: in-memory static group table
//! - Revocation transports: null, in-process channel, HTTP webhook

pub mod notifier;
pub mod server_group;

pub use notifier::*;
pub use server_group::*;

use crate::config::NotifierConfig;
use crate::domain::ports::EvictionNotifierRef;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Factory for creating revocation transports
pub struct NotifierFactory;

impl NotifierFactory {
    /// Create the transport named by `config`
    pub fn create(config: &NotifierConfig, request_timeout: Duration) -> Result<EvictionNotifierRef> {
        match config {
            NotifierConfig::None => Ok(Arc::new(NullNotifier)),
            NotifierConfig::Webhook { url } => {
                Ok(Arc::new(WebhookNotifier::new(url.clone(), request_timeout)?))
            }
        }
    }
}
