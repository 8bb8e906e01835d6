//! Connection table — tracks live connections and their outbound queues.
//!
//! The [`ConnectionTable`] is a thread-safe map from peer id to the one
//! connection currently carrying traffic for that peer. Every connection owns
//! an unbounded queue drained by a single writer task, so frames sent to one
//! peer leave in the order they were queued.

use crate::message::{WireMessage, WireNotification};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake completed, fully connected.
    Connected,
    /// Connection lost but not removed yet (eligible for reconnect).
    Disconnected,
}

/// An entry representing the current connection to a peer.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Unique id of the peer.
    pub peer_id: String,
    /// Agent name announced in the handshake.
    pub agent_name: String,
    /// Socket address of the peer.
    pub address: SocketAddr,
    /// Whether we dialed this connection.
    pub outbound: bool,
    /// Connection state.
    pub state: ConnectionState,
    /// When the connection was established.
    pub connected_at: DateTime<Utc>,
    /// Generation of this connection; later connections replace earlier ones.
    pub connection_id: u64,
    sender: mpsc::UnboundedSender<WireMessage>,
}

/// Thread-safe table of all known connections.
#[derive(Debug, Clone)]
pub struct ConnectionTable {
    peers: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl ConnectionTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a connection after a successful handshake, replacing any
    /// previous connection to the same peer. Returns the connection id.
    pub fn add_connection(
        &self,
        peer_id: &str,
        agent_name: &str,
        address: SocketAddr,
        outbound: bool,
        sender: mpsc::UnboundedSender<WireMessage>,
    ) -> u64 {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let entry = ConnectionEntry {
            peer_id: peer_id.to_string(),
            agent_name: agent_name.to_string(),
            address,
            outbound,
            state: ConnectionState::Connected,
            connected_at: Utc::now(),
            connection_id,
            sender,
        };
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer_id.to_string(), entry);
        connection_id
    }

    /// Remove a peer entirely.
    pub fn remove(&self, peer_id: &str) -> Option<ConnectionEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(peer_id)
    }

    /// Drop every entry. Writer queues drain what is already queued, then close.
    pub fn clear(&self) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.clear();
    }

    /// Mark a connection as disconnected.
    ///
    /// Only the current connection of the peer counts: returns false when
    /// `connection_id` was already replaced or the peer is already down.
    pub fn mark_disconnected(&self, peer_id: &str, connection_id: u64) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(peer_id) {
            Some(entry)
                if entry.connection_id == connection_id
                    && entry.state == ConnectionState::Connected =>
            {
                entry.state = ConnectionState::Disconnected;
                true
            }
            _ => false,
        }
    }

    /// Get a snapshot of a specific peer.
    pub fn get(&self, peer_id: &str) -> Option<ConnectionEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(peer_id).cloned()
    }

    /// Queue a notification for one peer. Returns false if the peer is not connected.
    pub fn send(&self, peer_id: &str, notification: WireNotification) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        match peers.get(peer_id) {
            Some(entry) if entry.state == ConnectionState::Connected => entry
                .sender
                .send(WireMessage::notification(notification))
                .is_ok(),
            _ => false,
        }
    }

    /// Queue a notification for every connected peer. Returns how many accepted it.
    pub fn broadcast(&self, notification: &WireNotification) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .filter(|p| {
                p.sender
                    .send(WireMessage::notification(notification.clone()))
                    .is_ok()
            })
            .count()
    }

    /// Get all connected peers.
    pub fn connected_peers(&self) -> Vec<ConnectionEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .cloned()
            .collect()
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .count()
    }

    /// Total number of peers (including disconnected).
    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
