//! Transport abstraction for the coordination protocol
//!
//! A [`Messenger`] moves [`Envelope`]s between the manager and its
//! workers without interpreting them. Two transports are provided:
//!
//! - `channel`: an in-process hub of per-address queues, used by the
//!   single-process mode and by tests
//! - `tcp`: length-prefixed binary frames over sockets, with the manager
//!   listening and workers connecting
//!
//! Both deliver envelopes from one sender to one recipient in send order.
//! Incoming traffic lands in a per-endpoint inbox, so `recv` can be
//! awaited from the owning task while other tasks send through a shared
//! handle.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Envelope;
use crate::utils;

pub mod channel;
pub mod tcp;

pub use channel::{ChannelHub, ChannelMessenger};
pub use tcp::{TcpManagerMessenger, TcpWorkerMessenger};

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Unknown messenger type '{0}'")]
    UnknownTransport(String),

    #[error("Send timed out after {0} ms")]
    BackpressureTimeout(u64),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Messenger is closed")]
    Closed,

    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

/// Which side of the coordination protocol an endpoint serves. The TCP
/// transport binds a listener for the manager and dials out for workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerRole {
    Manager,
    Worker,
}

/// Messenger selection carried in the benchmark configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Registry key: `channel` or `tcp`.
    #[serde(rename = "type")]
    pub kind: String,
    /// `host:port` for socket transports; unused by `channel`.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            kind: "channel".to_string(),
            endpoint: None,
        }
    }
}

/// Addressed, ordered envelope transport.
#[async_trait]
pub trait Messenger: Send + Sync + std::fmt::Debug {
    /// Stable transport address of this endpoint.
    fn address(&self) -> &str;

    /// Deliver an envelope to its recipients. Unknown recipients are
    /// logged and skipped, not errors: late or duplicate addressing is a
    /// protocol-layer concern.
    async fn send(&self, envelope: Envelope) -> Result<(), MessagingError>;

    /// Await the next envelope addressed to this endpoint. Returns `None`
    /// once the transport is closed. Single-consumer: only the endpoint's
    /// owning task should call this.
    async fn recv(&self) -> Option<Envelope>;

    /// Release transport resources. Further sends fail with
    /// [`MessagingError::Closed`].
    async fn close(&self) -> Result<(), MessagingError>;
}

/// Constructs messengers from configuration keys.
pub struct MessengerFactory;

impl MessengerFactory {
    /// Create the transport named by `config` for the given role.
    ///
    /// The channel transport is process-local, so it attaches to the
    /// shared `hub` instead of an endpoint; requesting it without a hub is
    /// a configuration error.
    pub async fn create(
        config: &MessengerConfig,
        role: MessengerRole,
        hub: Option<&ChannelHub>,
    ) -> Result<Box<dyn Messenger>, MessagingError> {
        match config.kind.as_str() {
            "channel" => {
                let hub = hub.ok_or_else(|| {
                    MessagingError::Generic(anyhow!(
                        "The channel messenger is process-local and requires a hub"
                    ))
                })?;
                Ok(Box::new(hub.endpoint(utils::generate_address())))
            }
            "tcp" => {
                let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                    MessagingError::Generic(anyhow!("The tcp messenger requires an endpoint"))
                })?;
                match role {
                    MessengerRole::Manager => Ok(Box::new(
                        TcpManagerMessenger::listen(endpoint, utils::generate_address()).await?,
                    )),
                    MessengerRole::Worker => Ok(Box::new(
                        TcpWorkerMessenger::connect(endpoint, utils::generate_address()).await?,
                    )),
                }
            }
            other => Err(MessagingError::UnknownTransport(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_rejects_unknown_transport() {
        let config = MessengerConfig {
            kind: "pigeon".to_string(),
            endpoint: None,
        };
        let err = MessengerFactory::create(&config, MessengerRole::Manager, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::UnknownTransport(kind) if kind == "pigeon"));
    }

    #[tokio::test]
    async fn test_factory_requires_hub_for_channel() {
        let config = MessengerConfig::default();
        let err = MessengerFactory::create(&config, MessengerRole::Worker, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Generic(_)));

        let hub = ChannelHub::new();
        let messenger = MessengerFactory::create(&config, MessengerRole::Worker, Some(&hub))
            .await
            .unwrap();
        assert!(!messenger.address().is_empty());
    }

    #[tokio::test]
    async fn test_factory_requires_endpoint_for_tcp() {
        let config = MessengerConfig {
            kind: "tcp".to_string(),
            endpoint: None,
        };
        let err = MessengerFactory::create(&config, MessengerRole::Manager, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Generic(_)));
    }
}
