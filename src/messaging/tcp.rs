//! TCP socket transport
//!
//! Envelopes are bincode-serialized and framed with a 4-byte little-endian
//! length prefix. The manager side binds a listener and accepts any number
//! of worker connections; a connection's transport address is learned from
//! the first envelope it delivers, after which unicast routing by address
//! works. Until then only broadcasts reach that worker, which is exactly
//! what the registration phase of the protocol needs.
//!
//! Writes are bounded by a timeout so one stalled worker cannot wedge the
//! manager's send path indefinitely.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, Recipients};

use super::{Messenger, MessagingError};

/// Upper bound on one serialized envelope.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// How long one frame write may stall before the send fails.
pub const WRITE_TIMEOUT_MS: u64 = 5_000;

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), MessagingError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(MessagingError::FrameTooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_BYTES,
        });
    }

    let write = async {
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    match timeout(Duration::from_millis(WRITE_TIMEOUT_MS), write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MessagingError::Generic(anyhow!(
            "Failed to write frame: {}",
            e
        ))),
        Err(_) => Err(MessagingError::BackpressureTimeout(WRITE_TIMEOUT_MS)),
    }
}

/// Read one framed envelope. `Ok(None)` means the peer closed the stream
/// cleanly at a frame boundary.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, MessagingError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(MessagingError::Generic(anyhow!(
                "Failed to read frame length: {}",
                e
            )))
        }
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(MessagingError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| MessagingError::Generic(anyhow!("Failed to read frame payload: {}", e)))?;

    Envelope::from_bytes(&payload)
        .map(Some)
        .map_err(MessagingError::Generic)
}

#[derive(Debug)]
struct ManagedConn {
    address: Option<String>,
    writer: OwnedWriteHalf,
}

/// Listening side of the transport, run by the manager process.
#[derive(Debug)]
pub struct TcpManagerMessenger {
    address: String,
    local_addr: SocketAddr,
    connections: Arc<Mutex<HashMap<u64, ManagedConn>>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    accept_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl TcpManagerMessenger {
    pub async fn listen(endpoint: &str, address: String) -> Result<Self, MessagingError> {
        let listener = TcpListener::bind(endpoint)
            .await
            .map_err(|e| MessagingError::Generic(anyhow!("Failed to bind {}: {}", endpoint, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MessagingError::Generic(anyhow!("Failed to resolve local address: {}", e)))?;
        info!("Manager messenger listening on {}", local_addr);

        let connections: Arc<Mutex<HashMap<u64, ManagedConn>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let accept_connections = Arc::clone(&connections);
        let accept_task = tokio::spawn(async move {
            let next_id = AtomicU64::new(1);
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        debug!("Accepted worker connection {} from {}", id, peer);

                        let (read_half, write_half) = stream.into_split();
                        accept_connections.lock().await.insert(
                            id,
                            ManagedConn {
                                address: None,
                                writer: write_half,
                            },
                        );
                        tokio::spawn(Self::pump_connection(
                            id,
                            read_half,
                            Arc::clone(&accept_connections),
                            inbox_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accepting a worker connection failed: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self {
            address,
            local_addr,
            connections,
            inbox: Mutex::new(inbox_rx),
            accept_task,
            closed: AtomicBool::new(false),
        })
    }

    /// The socket address the listener actually bound, for `:0` binds.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn pump_connection(
        id: u64,
        mut read_half: OwnedReadHalf,
        connections: Arc<Mutex<HashMap<u64, ManagedConn>>>,
        inbox_tx: mpsc::UnboundedSender<Envelope>,
    ) {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(envelope)) => {
                    {
                        let mut conns = connections.lock().await;
                        if let Some(conn) = conns.get_mut(&id) {
                            if conn.address.is_none() {
                                debug!("Connection {} announced address {}", id, envelope.sender);
                                conn.address = Some(envelope.sender.clone());
                            }
                        }
                    }
                    if inbox_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Worker connection {} closed", id);
                    break;
                }
                Err(e) => {
                    warn!("Dropping worker connection {}: {}", id, e);
                    break;
                }
            }
        }
        connections.lock().await.remove(&id);
    }
}

#[async_trait]
impl Messenger for TcpManagerMessenger {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        let bytes = envelope.to_bytes().map_err(MessagingError::Generic)?;

        let mut conns = self.connections.lock().await;
        let mut dead = Vec::new();
        for (id, conn) in conns.iter_mut() {
            let matches = match &envelope.recipients {
                Recipients::All => true,
                Recipients::Addresses(list) => conn
                    .address
                    .as_deref()
                    .map(|addr| list.iter().any(|a| a == addr))
                    .unwrap_or(false),
            };
            if !matches {
                continue;
            }
            if let Err(e) = write_frame(&mut conn.writer, &bytes).await {
                warn!("Dropping worker connection {} on send failure: {}", id, e);
                dead.push(*id);
            }
        }
        for id in dead {
            conns.remove(&id);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        self.inbox.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        self.accept_task.abort();
        self.connections.lock().await.clear();
        self.inbox.lock().await.close();
        Ok(())
    }
}

impl Drop for TcpManagerMessenger {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Dialing side of the transport, run by each worker process.
#[derive(Debug)]
pub struct TcpWorkerMessenger {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    reader_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl TcpWorkerMessenger {
    /// Connection attempts before giving up on the manager endpoint.
    pub const CONNECT_RETRIES: u32 = 5;

    /// Delay between connection attempts.
    pub const CONNECT_RETRY_DELAY_MS: u64 = 200;

    pub async fn connect(endpoint: &str, address: String) -> Result<Self, MessagingError> {
        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(endpoint).await {
                Ok(stream) => break stream,
                Err(e) => {
                    attempt += 1;
                    if attempt >= Self::CONNECT_RETRIES {
                        return Err(MessagingError::Generic(anyhow!(
                            "Failed to connect to {} after {} attempts: {}",
                            endpoint,
                            attempt,
                            e
                        )));
                    }
                    warn!(
                        "Connection attempt {} to {} failed ({}), retrying",
                        attempt, endpoint, e
                    );
                    sleep(Duration::from_millis(Self::CONNECT_RETRY_DELAY_MS)).await;
                }
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        debug!("Worker messenger {} connected to {}", address, endpoint);

        let (mut read_half, write_half) = stream.into_split();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let my_address = address.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(envelope)) => {
                        if !envelope.recipients.includes(&my_address) {
                            debug!(
                                "Skipping {} envelope addressed elsewhere",
                                envelope.body.name()
                            );
                            continue;
                        }
                        if inbox_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Manager closed the transport");
                        break;
                    }
                    Err(e) => {
                        warn!("Worker transport read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            address,
            writer: Mutex::new(write_half),
            inbox: Mutex::new(inbox_rx),
            reader_task,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Messenger for TcpWorkerMessenger {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        let bytes = envelope.to_bytes().map_err(MessagingError::Generic)?;
        write_frame(&mut *self.writer.lock().await, &bytes).await
    }

    async fn recv(&self) -> Option<Envelope> {
        self.inbox.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        self.reader_task.abort();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Worker transport shutdown: {}", e);
        }
        self.inbox.lock().await.close();
        Ok(())
    }
}

impl Drop for TcpWorkerMessenger {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBody;

    #[tokio::test]
    async fn test_read_frame_handles_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let mut data: &[u8] = &[0xFF, 0xFF, 0xFF, 0x7F];
        let err = read_frame(&mut data).await.unwrap_err();
        assert!(matches!(err, MessagingError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_unicast_round_trip() {
        let manager = TcpManagerMessenger::listen("127.0.0.1:0", "manager".to_string())
            .await
            .unwrap();
        let endpoint = manager.local_addr().to_string();
        let worker = TcpWorkerMessenger::connect(&endpoint, "worker-1".to_string())
            .await
            .unwrap();

        // The worker's first envelope announces its address.
        worker
            .send(Envelope::to_one("worker-1", "manager", MessageBody::Connected))
            .await
            .unwrap();
        let connected = manager.recv().await.unwrap();
        assert_eq!(connected.sender, "worker-1");

        // Unicast back by announced address.
        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::AssignId { worker_index: 3 },
            ))
            .await
            .unwrap();
        let assigned = worker.recv().await.unwrap();
        match assigned.body {
            MessageBody::AssignId { worker_index } => assert_eq!(worker_index, 3),
            other => panic!("unexpected body {:?}", other),
        }

        worker.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let manager = TcpManagerMessenger::listen("127.0.0.1:0", "manager".to_string())
            .await
            .unwrap();
        let endpoint = manager.local_addr().to_string();
        let worker_a = TcpWorkerMessenger::connect(&endpoint, "worker-a".to_string())
            .await
            .unwrap();
        let worker_b = TcpWorkerMessenger::connect(&endpoint, "worker-b".to_string())
            .await
            .unwrap();

        // Give the accept loop a moment to register both connections.
        sleep(Duration::from_millis(100)).await;

        manager
            .send(Envelope::broadcast("manager", MessageBody::Register))
            .await
            .unwrap();

        assert_eq!(worker_a.recv().await.unwrap().body.name(), "register");
        assert_eq!(worker_b.recv().await.unwrap().body.name(), "register");

        worker_a.close().await.unwrap();
        worker_b.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unicast_to_unknown_address_is_skipped() {
        let manager = TcpManagerMessenger::listen("127.0.0.1:0", "manager".to_string())
            .await
            .unwrap();

        manager
            .send(Envelope::to_one("manager", "ghost", MessageBody::Exit))
            .await
            .unwrap();
        manager.close().await.unwrap();
    }
}
