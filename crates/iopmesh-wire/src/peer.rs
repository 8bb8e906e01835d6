//! PeerNode — TCP server and client for the iopmesh wire protocol.
//!
//! A [`PeerNode`] binds a local TCP listener and accepts incoming connections
//! from other agents. It also dials known peers. Each connection performs a
//! handshake to exchange identity, is registered in the [`ConnectionTable`],
//! and then enters a dispatch loop that hands every notification to the
//! [`PeerHandle`].

use crate::message::*;
use crate::registry::ConnectionTable;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for message authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Configuration for a PeerNode.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// This process's unique peer id.
    pub peer_id: String,
    /// The agent name announced in handshakes.
    pub agent_name: String,
    /// Pre-shared key for HMAC-SHA256 authentication. Empty disables it.
    pub shared_secret: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            peer_id: uuid::Uuid::new_v4().to_string(),
            agent_name: "iop_noname".to_string(),
            shared_secret: String::new(),
        }
    }
}

/// Receiver of connection lifecycle and notifications.
///
/// Methods are called from connection tasks and must not block; the kernel
/// implements them by queueing into its event loop.
pub trait PeerHandle: Send + Sync + 'static {
    /// A handshake completed and the connection is registered.
    fn peer_connected(&self, peer_id: &str, agent_name: &str, address: SocketAddr, outbound: bool);

    /// The current connection of a peer ended.
    fn peer_disconnected(&self, peer_id: &str);

    /// A notification arrived from a connected peer.
    fn notification(&self, peer_id: &str, notification: WireNotification);
}

/// A dialed connection: the remote peer id and the task driving it.
///
/// The task finishes when the connection ends.
pub struct Connection {
    pub peer_id: String,
    pub task: JoinHandle<()>,
}

/// The local network node. Listens for connections and connects to peers.
pub struct PeerNode {
    config: PeerConfig,
    table: ConnectionTable,
    handle: Arc<dyn PeerHandle>,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    start_time: Instant,
}

impl PeerNode {
    /// Create and start listening on the configured address.
    pub async fn start(
        config: PeerConfig,
        table: ConnectionTable,
        handle: Arc<dyn PeerHandle>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "wire: listening on {} (peer_id={}, agent={})",
            local_addr, config.peer_id, config.agent_name
        );
        if config.shared_secret.is_empty() {
            warn!("wire: no shared_secret configured, handshakes are unauthenticated");
        }

        let node = Arc::new(Self {
            config,
            table,
            handle,
            local_addr,
            start_time: Instant::now(),
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, node_clone).await;
        });

        Ok((node, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the peer id.
    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Get a reference to the connection table.
    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Seconds since the node started.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Nonce and HMAC proving knowledge of the shared secret.
    fn auth_fields(&self) -> (String, String) {
        let nonce = uuid::Uuid::new_v4().to_string();
        if self.config.shared_secret.is_empty() {
            return (nonce, String::new());
        }
        let data = format!("{}{}", nonce, self.config.peer_id);
        let auth_hmac = hmac_sign(&self.config.shared_secret, data.as_bytes());
        (nonce, auth_hmac)
    }

    fn verify_peer(&self, nonce: &str, peer_id: &str, auth_hmac: &str) -> bool {
        if self.config.shared_secret.is_empty() {
            return true;
        }
        let data = format!("{}{}", nonce, peer_id);
        hmac_verify(&self.config.shared_secret, data.as_bytes(), auth_hmac)
    }

    /// Connect to a remote peer and perform the handshake.
    pub async fn connect_to_peer(&self, addr: SocketAddr) -> Result<Connection, WireError> {
        info!("wire: connecting to peer at {}", addr);
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        let (nonce, auth_hmac) = self.auth_fields();
        let handshake = WireMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Request(WireRequest::Handshake {
                peer_id: self.config.peer_id.clone(),
                agent_name: self.config.agent_name.clone(),
                protocol_version: PROTOCOL_VERSION,
                nonce,
                auth_hmac,
            }),
        };
        write_message(&mut writer, &handshake).await?;

        let response = read_message(&mut reader).await?;
        let (peer_id, agent_name) = match response.kind {
            WireMessageKind::Response(WireResponse::HandshakeAck {
                peer_id,
                agent_name,
                protocol_version,
                nonce,
                auth_hmac,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                if !self.verify_peer(&nonce, &peer_id, &auth_hmac) {
                    return Err(WireError::HandshakeFailed(
                        "HMAC verification failed on HandshakeAck".into(),
                    ));
                }
                (peer_id, agent_name)
            }
            WireMessageKind::Response(WireResponse::Error { code, message }) => {
                return Err(WireError::HandshakeFailed(format!(
                    "Remote error {code}: {message}"
                )));
            }
            _ => {
                return Err(WireError::HandshakeFailed(
                    "Unexpected response to handshake".to_string(),
                ));
            }
        };

        if peer_id == self.config.peer_id {
            return Err(WireError::HandshakeFailed(
                "refusing connection to self".into(),
            ));
        }

        info!(
            "wire: handshake complete with {} ({}) at {}",
            agent_name, peer_id, addr
        );

        let task = tokio::spawn(run_connection(
            reader,
            writer,
            ConnectionContext {
                peer_id: peer_id.clone(),
                agent_name,
                address: addr,
                outbound: true,
                table: self.table.clone(),
                handle: Arc::clone(&self.handle),
                start_time: self.start_time,
            },
        ));

        Ok(Connection { peer_id, task })
    }

    /// Internal accept loop, run in a spawned task.
    async fn accept_loop(listener: TcpListener, node: Arc<PeerNode>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("wire: accepted connection from {}", addr);
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_inbound(stream, addr, &node).await {
                            debug!("wire: inbound connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("wire: accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Handle a single inbound connection: perform handshake, then run it.
    async fn handle_inbound(
        stream: TcpStream,
        addr: SocketAddr,
        node: &PeerNode,
    ) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();

        let msg = read_message(&mut reader).await?;
        let (peer_id, agent_name) = match msg.kind {
            WireMessageKind::Request(WireRequest::Handshake {
                peer_id,
                agent_name,
                protocol_version,
                nonce,
                auth_hmac,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    reject(
                        &mut writer,
                        &msg.id,
                        1,
                        format!(
                            "Protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    )
                    .await?;
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }

                if !node.verify_peer(&nonce, &peer_id, &auth_hmac) {
                    reject(&mut writer, &msg.id, 403, "HMAC authentication failed".into())
                        .await?;
                    return Err(WireError::HandshakeFailed(
                        "HMAC verification failed on incoming Handshake".into(),
                    ));
                }

                if peer_id == node.config.peer_id {
                    reject(&mut writer, &msg.id, 409, "Connection to self".into()).await?;
                    return Err(WireError::HandshakeFailed(
                        "refusing connection from self".into(),
                    ));
                }

                let (ack_nonce, ack_hmac) = node.auth_fields();
                let ack = WireMessage {
                    id: msg.id.clone(),
                    kind: WireMessageKind::Response(WireResponse::HandshakeAck {
                        peer_id: node.config.peer_id.clone(),
                        agent_name: node.config.agent_name.clone(),
                        protocol_version: PROTOCOL_VERSION,
                        nonce: ack_nonce,
                        auth_hmac: ack_hmac,
                    }),
                };
                write_message(&mut writer, &ack).await?;

                info!(
                    "wire: handshake with {} ({}) from {}",
                    agent_name, peer_id, addr
                );
                (peer_id, agent_name)
            }
            // Every connection must open with a handshake.
            _ => {
                warn!(
                    "wire: rejected unauthenticated message from {}: handshake required",
                    addr
                );
                reject(
                    &mut writer,
                    &msg.id,
                    401,
                    "Handshake required before any other message".into(),
                )
                .await?;
                return Err(WireError::HandshakeFailed(
                    "Rejected message before handshake".into(),
                ));
            }
        };

        run_connection(
            reader,
            writer,
            ConnectionContext {
                peer_id,
                agent_name,
                address: addr,
                outbound: false,
                table: node.table.clone(),
                handle: Arc::clone(&node.handle),
                start_time: node.start_time,
            },
        )
        .await;
        Ok(())
    }
}

async fn reject(
    writer: &mut OwnedWriteHalf,
    id: &str,
    code: i32,
    message: String,
) -> Result<(), WireError> {
    let err_resp = WireMessage {
        id: id.to_string(),
        kind: WireMessageKind::Response(WireResponse::Error { code, message }),
    };
    write_message(writer, &err_resp).await
}

struct ConnectionContext {
    peer_id: String,
    agent_name: String,
    address: SocketAddr,
    outbound: bool,
    table: ConnectionTable,
    handle: Arc<dyn PeerHandle>,
    start_time: Instant,
}

/// Register an established connection, drive it until it ends, then report
/// the disconnect if it was still the peer's current connection.
async fn run_connection(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    ctx: ConnectionContext,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
    let replies = tx.downgrade();
    let connection_id =
        ctx.table
            .add_connection(&ctx.peer_id, &ctx.agent_name, ctx.address, ctx.outbound, tx);
    ctx.handle
        .peer_connected(&ctx.peer_id, &ctx.agent_name, ctx.address, ctx.outbound);

    // The table holds the only strong sender; the writer drains until the
    // entry is replaced or removed.
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                debug!("wire: write failed: {}", e);
                break;
            }
        }
    });

    if let Err(e) =
        connection_loop(&mut reader, &ctx.peer_id, &replies, &*ctx.handle, ctx.start_time).await
    {
        debug!("wire: connection with {} ended: {}", ctx.peer_id, e);
    }
    writer_task.abort();

    if ctx.table.mark_disconnected(&ctx.peer_id, connection_id) {
        info!("wire: peer {} ({}) disconnected", ctx.agent_name, ctx.peer_id);
        ctx.handle.peer_disconnected(&ctx.peer_id);
    }
}

/// Read loop for an established connection.
async fn connection_loop(
    reader: &mut OwnedReadHalf,
    peer_id: &str,
    replies: &mpsc::WeakUnboundedSender<WireMessage>,
    handle: &dyn PeerHandle,
    start_time: Instant,
) -> Result<(), WireError> {
    loop {
        let msg = match read_message(reader).await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => return Ok(()),
            // The frame was consumed whole, so the stream is still in sync.
            Err(WireError::Json(e)) => {
                warn!("wire: discarding undecodable frame from {}: {}", peer_id, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        match msg.kind {
            WireMessageKind::Notification(WireNotification::ShuttingDown) => {
                info!("wire: peer {} is shutting down", peer_id);
                return Ok(());
            }
            WireMessageKind::Notification(notification) => {
                handle.notification(peer_id, notification);
            }
            WireMessageKind::Request(request) => {
                let kind = match request {
                    WireRequest::Ping => WireMessageKind::Response(WireResponse::Pong {
                        uptime_secs: start_time.elapsed().as_secs(),
                    }),
                    WireRequest::Handshake { .. } => {
                        WireMessageKind::Response(WireResponse::Error {
                            code: 400,
                            message: "Already handshaked".to_string(),
                        })
                    }
                };
                if let Some(tx) = replies.upgrade() {
                    let _ = tx.send(WireMessage { id: msg.id, kind });
                }
            }
            WireMessageKind::Response(_) => {
                warn!(
                    "wire: unexpected response message from {}: {:?}",
                    peer_id, msg.id
                );
            }
        }
    }
}

/// Write a framed message (4-byte length + JSON) to a TCP stream.
pub async fn write_message(writer: &mut OwnedWriteHalf, msg: &WireMessage) -> Result<(), WireError> {
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON) from a TCP stream.
pub async fn read_message(reader: &mut OwnedReadHalf) -> Result<WireMessage, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iopmesh_types::iop::IopValue;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Connected { peer_id: String, outbound: bool },
        Disconnected(String),
        Notification(String, WireNotification),
    }

    /// Records every callback for inspection.
    #[derive(Default)]
    struct RecordingHandle {
        seen: Mutex<Vec<Seen>>,
    }

    impl RecordingHandle {
        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PeerHandle for RecordingHandle {
        fn peer_connected(&self, peer_id: &str, _agent_name: &str, _address: SocketAddr, outbound: bool) {
            self.seen.lock().unwrap().push(Seen::Connected {
                peer_id: peer_id.to_string(),
                outbound,
            });
        }

        fn peer_disconnected(&self, peer_id: &str) {
            self.seen
                .lock()
                .unwrap()
                .push(Seen::Disconnected(peer_id.to_string()));
        }

        fn notification(&self, peer_id: &str, notification: WireNotification) {
            self.seen
                .lock()
                .unwrap()
                .push(Seen::Notification(peer_id.to_string(), notification));
        }
    }

    fn config(peer_id: &str, secret: &str) -> PeerConfig {
        PeerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            peer_id: peer_id.to_string(),
            agent_name: format!("{peer_id}-agent"),
            shared_secret: secret.to_string(),
        }
    }

    async fn start(peer_id: &str, secret: &str) -> (Arc<PeerNode>, Arc<RecordingHandle>) {
        let handle = Arc::new(RecordingHandle::default());
        let (node, _task) = PeerNode::start(config(peer_id, secret), ConnectionTable::new(), handle.clone())
            .await
            .unwrap();
        (node, handle)
    }

    #[tokio::test]
    async fn test_peer_start_and_connect() {
        let (node1, handle1) = start("node-1", "").await;
        let (node2, handle2) = start("node-2", "").await;

        let conn = node2.connect_to_peer(node1.local_addr()).await.unwrap();
        assert_eq!(conn.peer_id, "node-1");

        let entry = node2.table().get("node-1").unwrap();
        assert_eq!(entry.agent_name, "node-1-agent");
        assert!(entry.outbound);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node1.table().connected_count(), 1);
        assert!(!node1.table().get("node-2").unwrap().outbound);
        assert!(handle1.seen().contains(&Seen::Connected {
            peer_id: "node-2".into(),
            outbound: false
        }));
        assert!(handle2.seen().contains(&Seen::Connected {
            peer_id: "node-1".into(),
            outbound: true
        }));
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let (node1, handle1) = start("node-a", "secret").await;
        let (node2, _handle2) = start("node-b", "secret").await;
        node2.connect_to_peer(node1.local_addr()).await.unwrap();

        for i in 0..5 {
            assert!(node2.table().send(
                "node-a",
                WireNotification::Publish {
                    output: "count".into(),
                    value: IopValue::Integer(i),
                }
            ));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let values: Vec<i64> = handle1
            .seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Notification(peer, WireNotification::Publish { value: IopValue::Integer(i), .. })
                    if peer == "node-b" => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (node1, _h1) = start("node-x", "alpha").await;
        let (node2, _h2) = start("node-y", "beta").await;

        let err = node2.connect_to_peer(node1.local_addr()).await.err().unwrap();
        assert!(matches!(err, WireError::HandshakeFailed(_)));
        assert_eq!(node2.table().connected_count(), 0);
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (node, _h) = start("solo", "").await;
        assert!(node.connect_to_peer(node.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_message_before_handshake_rejected() {
        let (node, _h) = start("server", "secret").await;

        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let msg = WireMessage {
            id: "ping-1".to_string(),
            kind: WireMessageKind::Request(WireRequest::Ping),
        };
        write_message(&mut writer, &msg).await.unwrap();

        let response = read_message(&mut reader).await.unwrap();
        assert_eq!(response.id, "ping-1");
        match response.kind {
            WireMessageKind::Response(WireResponse::Error { code, .. }) => assert_eq!(code, 401),
            other => panic!("Expected Error(401), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_reported_once() {
        let (node1, handle1) = start("node-l", "").await;
        let (node2, _handle2) = start("node-r", "").await;
        let conn = node2.connect_to_peer(node1.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Dropping the table entry ends the writer, which closes our side.
        node2.table().remove("node-l");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let disconnects = handle1
            .seen()
            .into_iter()
            .filter(|s| *s == Seen::Disconnected("node-r".into()))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(node1.table().connected_count(), 0);
        conn.task.abort();
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let (node, handle) = start("listener", "").await;

        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let handshake = WireMessage {
            id: "hs".to_string(),
            kind: WireMessageKind::Request(WireRequest::Handshake {
                peer_id: "raw-client".to_string(),
                agent_name: "Raw".to_string(),
                protocol_version: PROTOCOL_VERSION,
                nonce: "n".to_string(),
                auth_hmac: String::new(),
            }),
        };
        write_message(&mut writer, &handshake).await.unwrap();
        let ack = read_message(&mut reader).await.unwrap();
        assert!(matches!(
            ack.kind,
            WireMessageKind::Response(WireResponse::HandshakeAck { .. })
        ));

        let garbage = br#"{"id":"x","kind":{"not":"a message"}}"#;
        writer
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        writer.write_all(garbage).await.unwrap();
        let publish = WireMessage {
            id: "pub".to_string(),
            kind: WireMessageKind::Notification(WireNotification::Publish {
                output: "temp".into(),
                value: IopValue::Double(1.0),
            }),
        };
        write_message(&mut writer, &publish).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = handle.seen();
        assert!(seen.contains(&Seen::Notification(
            "raw-client".into(),
            WireNotification::Publish {
                output: "temp".into(),
                value: IopValue::Double(1.0),
            }
        )));
        assert!(!seen.contains(&Seen::Disconnected("raw-client".into())));
        assert_eq!(node.table().connected_count(), 1);
    }

    #[test]
    fn test_peer_config_default() {
        let config = PeerConfig::default();
        assert_eq!(config.agent_name, "iop_noname");
        assert!(!config.peer_id.is_empty());
        assert!(config.shared_secret.is_empty());
    }
}
