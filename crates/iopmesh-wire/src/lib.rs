//! iopmesh wire protocol — the transport between agents.
//!
//! Provides authenticated peer connections and ordered delivery of
//! notifications over TCP using length-prefixed JSON frames.
//!
//! ## Architecture
//!
//! - **PeerNode**: Local network endpoint that listens for and dials connections
//! - **ConnectionTable**: Tracks the current connection and writer queue per peer
//! - **WireMessage**: JSON-framed protocol messages
//! - **PeerHandle**: Trait through which connection events reach the kernel

pub mod message;
pub mod peer;
pub mod registry;

pub use message::{WireMessage, WireNotification, WireRequest, WireResponse};
pub use peer::{Connection, PeerConfig, PeerHandle, PeerNode, WireError};
pub use registry::{ConnectionEntry, ConnectionState, ConnectionTable};
