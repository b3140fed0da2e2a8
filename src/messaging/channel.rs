//! In-process channel transport
//!
//! A hub of per-address unbounded queues. Every endpoint registers its
//! address and queue with the shared hub; sending resolves recipients
//! against the registry and clones the envelope into each matching queue.
//! Used by the single-process execution mode, where the manager and all
//! workers are tasks on one runtime, and by tests that need a transport
//! with no sockets underneath.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{Envelope, Recipients};

use super::{Messenger, MessagingError};

type PeerMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>;

/// Shared registry connecting channel endpoints within one process.
#[derive(Clone, Default)]
pub struct ChannelHub {
    peers: PeerMap,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint under `address`.
    pub fn endpoint(&self, address: impl Into<String>) -> ChannelMessenger {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(address.clone(), tx);
        ChannelMessenger {
            address,
            peers: Arc::clone(&self.peers),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Number of currently registered endpoints.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

/// One endpoint attached to a [`ChannelHub`].
#[derive(Debug)]
pub struct ChannelMessenger {
    address: String,
    peers: PeerMap,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

#[async_trait]
impl Messenger for ChannelMessenger {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        let peers = self.peers.lock();
        if !peers.contains_key(&self.address) {
            return Err(MessagingError::Closed);
        }

        match &envelope.recipients {
            Recipients::All => {
                for (address, tx) in peers.iter() {
                    if *address == envelope.sender {
                        continue;
                    }
                    if tx.send(envelope.clone()).is_err() {
                        warn!("Dropped {} envelope for detached peer {}", envelope.body.name(), address);
                    }
                }
            }
            Recipients::Addresses(addresses) => {
                for address in addresses {
                    match peers.get(address) {
                        Some(tx) => {
                            if tx.send(envelope.clone()).is_err() {
                                warn!(
                                    "Dropped {} envelope for detached peer {}",
                                    envelope.body.name(),
                                    address
                                );
                            }
                        }
                        None => {
                            debug!(
                                "No endpoint registered under {}, skipping {} envelope",
                                address,
                                envelope.body.name()
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        self.inbox.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.peers.lock().remove(&self.address);
        self.inbox.lock().await.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBody;

    #[tokio::test]
    async fn test_unicast_between_endpoints() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker = hub.endpoint("worker-1");

        manager
            .send(Envelope::to_one("manager", "worker-1", MessageBody::Initialize))
            .await
            .unwrap();

        let received = worker.recv().await.unwrap();
        assert_eq!(received.sender, "manager");
        assert_eq!(received.body.name(), "initialize");
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_a = hub.endpoint("worker-a");
        let worker_b = hub.endpoint("worker-b");

        manager
            .send(Envelope::broadcast("manager", MessageBody::Register))
            .await
            .unwrap();

        assert_eq!(worker_a.recv().await.unwrap().body.name(), "register");
        assert_eq!(worker_b.recv().await.unwrap().body.name(), "register");

        // The manager itself must not see its own broadcast: sending a
        // follow-up and receiving it first proves the inbox was empty.
        worker_a
            .send(Envelope::to_one("worker-a", "manager", MessageBody::Connected))
            .await
            .unwrap();
        assert_eq!(manager.recv().await.unwrap().body.name(), "connected");
    }

    #[tokio::test]
    async fn test_send_order_preserved() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker = hub.endpoint("worker");

        for index in 0..10u64 {
            manager
                .send(Envelope::to_one(
                    "manager",
                    "worker",
                    MessageBody::AssignId { worker_index: index },
                ))
                .await
                .unwrap();
        }

        for index in 0..10u64 {
            let envelope = worker.recv().await.unwrap();
            match envelope.body {
                MessageBody::AssignId { worker_index } => assert_eq!(worker_index, index),
                other => panic!("unexpected body {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_recipient_skipped() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");

        // Nothing is registered under this address; send must still
        // succeed.
        manager
            .send(Envelope::to_one("manager", "ghost", MessageBody::Exit))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_endpoint_rejects_sends() {
        let hub = ChannelHub::new();
        let endpoint = hub.endpoint("closer");
        assert_eq!(hub.peer_count(), 1);

        endpoint.close().await.unwrap();
        assert_eq!(hub.peer_count(), 0);

        let err = endpoint
            .send(Envelope::broadcast("closer", MessageBody::Exit))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Closed));
    }
}
