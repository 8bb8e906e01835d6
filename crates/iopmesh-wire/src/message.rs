//! Wire protocol message types.
//!
//! All communication between iopmesh peers uses JSON-framed messages
//! over TCP. Each message is prefixed with a 4-byte big-endian length header.

use iopmesh_types::iop::IopValue;
use serde::{Deserialize, Serialize};

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// Wrap a notification in an envelope with a fresh id.
    pub fn notification(notification: WireNotification) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Notification(notification),
        }
    }
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// Request from one peer to another.
    #[serde(rename = "request")]
    Request(WireRequest),
    /// Response to a request.
    #[serde(rename = "response")]
    Response(WireResponse),
    /// One-way notification (no response expected).
    #[serde(rename = "notification")]
    Notification(WireNotification),
}

/// Request messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireRequest {
    /// Handshake: exchange peer identity.
    #[serde(rename = "handshake")]
    Handshake {
        /// The peer's unique id.
        peer_id: String,
        /// The agent name the peer runs under.
        agent_name: String,
        /// Protocol version.
        protocol_version: u32,
        /// Random nonce for HMAC authentication.
        #[serde(default)]
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + peer_id). Empty when unauthenticated.
        #[serde(default)]
        auth_hmac: String,
    },
    /// Ping to check if the peer is alive.
    #[serde(rename = "ping")]
    Ping,
}

/// Response messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireResponse {
    /// Handshake acknowledgement.
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        peer_id: String,
        agent_name: String,
        protocol_version: u32,
        #[serde(default)]
        nonce: String,
        #[serde(default)]
        auth_hmac: String,
    },
    /// Pong response.
    #[serde(rename = "pong")]
    Pong {
        /// Uptime in seconds.
        uptime_secs: u64,
    },
    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },
}

/// Notification messages (one-way, no response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WireNotification {
    /// The sender's current definition, as JSON.
    #[serde(rename = "definition")]
    Definition { json: String },
    /// The sender's current mapping, as JSON.
    #[serde(rename = "mapping")]
    Mapping { json: String },
    /// The sender wants values for exactly these outputs of the receiver.
    #[serde(rename = "subscribe")]
    Subscribe { outputs: Vec<String> },
    /// The sender wants no values from the receiver.
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    /// A new value of one of the sender's outputs.
    #[serde(rename = "publish")]
    Publish { output: String, value: IopValue },
    /// Peer is shutting down.
    #[serde(rename = "shutting_down")]
    ShuttingDown,
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_length_prefix() {
        let msg = WireMessage {
            id: "msg-1".to_string(),
            kind: WireMessageKind::Request(WireRequest::Ping),
        };
        let bytes = encode_message(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_message(&bytes[4..]).unwrap();
        assert_eq!(decoded.id, "msg-1");
    }

    #[test]
    fn test_handshake_serialization() {
        let msg = WireMessage {
            id: "hs-1".to_string(),
            kind: WireMessageKind::Request(WireRequest::Handshake {
                peer_id: "peer-abc".to_string(),
                agent_name: "Sensor".to_string(),
                protocol_version: PROTOCOL_VERSION,
                nonce: "test-nonce".to_string(),
                auth_hmac: String::new(),
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("handshake"));
        assert!(json.contains("Sensor"));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, "hs-1");
    }

    #[test]
    fn test_publish_carries_typed_value() {
        let msg = WireMessage::notification(WireNotification::Publish {
            output: "temp".to_string(),
            value: IopValue::Double(21.5),
        });
        let bytes = encode_message(&msg).unwrap();
        let decoded = decode_message(&bytes[4..]).unwrap();
        match decoded.kind {
            WireMessageKind::Notification(WireNotification::Publish { output, value }) => {
                assert_eq!(output, "temp");
                assert_eq!(value, IopValue::Double(21.5));
            }
            other => panic!("Expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn test_subscribe_serialization() {
        let msg = WireMessage::notification(WireNotification::Subscribe {
            outputs: vec!["temp".to_string(), "humidity".to_string()],
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"subscribe\""));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            decoded.kind,
            WireMessageKind::Notification(WireNotification::Subscribe { ref outputs }) if outputs.len() == 2
        ));
    }

    #[test]
    fn test_error_response() {
        let msg = WireMessage {
            id: "err-1".to_string(),
            kind: WireMessageKind::Response(WireResponse::Error {
                code: 403,
                message: "HMAC authentication failed".to_string(),
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            WireMessageKind::Response(WireResponse::Error { code, .. }) => assert_eq!(code, 403),
            other => panic!("Expected Error, got {other:?}"),
        }
    }
}
