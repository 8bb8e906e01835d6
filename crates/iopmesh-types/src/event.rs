//! Engine events delivered to the host application.
//!
//! Every observable state change in the engine is reported as one
//! [`EngineEvent`], in the order it happened.

use crate::definition::{Fingerprint, IopDescriptor};
use crate::iop::{IopCategory, IopType};
use crate::mapping::{MappingEntry, MappingId};
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which ceiling of the quota guard was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// More agents on the network than allowed.
    TooManyAgents,
    /// More IOPs in the local definition than allowed.
    TooManyIops,
    /// The unlicensed time box elapsed.
    Timeout,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::TooManyAgents => write!(f, "too many agents"),
            QuotaKind::TooManyIops => write!(f, "too many IOPs"),
            QuotaKind::Timeout => write!(f, "unlicensed timeout"),
        }
    }
}

/// Why a mapping element is not contributing any subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    /// The element is disabled.
    Disabled,
    /// The local definition has no input with that name.
    UnknownInput,
    /// No live peer with a known definition carries the agent name.
    NoMatchingPeer,
    /// Matching peers exist but none exposes the output.
    OutputMissing,
    /// Matching outputs exist but none has the input's type.
    Incompatible,
    /// The element was deleted from the table.
    Removed,
}

/// A mapping element matched an output of a different type.
///
/// Non-fatal: the element stays inactive for that peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncompatibleMapping {
    pub id: MappingId,
    pub entry: MappingEntry,
    pub peer_id: PeerId,
    pub input_type: IopType,
    pub output_type: IopType,
}

/// An engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new peer appeared.
    PeerJoined {
        peer_id: PeerId,
        agent_name: String,
        address: Option<String>,
    },
    /// A dead peer came back under the same id.
    PeerRejoined {
        peer_id: PeerId,
        agent_name: String,
        reconnections: u32,
    },
    /// A peer left or was lost.
    PeerLeft { peer_id: PeerId, agent_name: String },
    /// A dead peer record was released.
    PeerPurged { peer_id: PeerId },
    /// A peer announced a structurally different definition.
    PeerDefinitionChanged {
        peer_id: PeerId,
        name: String,
        version: String,
        fingerprint: Fingerprint,
    },
    /// Outputs appeared on a peer.
    OutputsAdded {
        peer_id: PeerId,
        agent_name: String,
        outputs: Vec<IopDescriptor>,
    },
    /// Outputs disappeared from a peer (definition change or peer loss).
    OutputsRemoved {
        peer_id: PeerId,
        agent_name: String,
        outputs: Vec<IopDescriptor>,
    },
    /// A peer's own mapping gained elements.
    MappingElementsAdded {
        peer_id: PeerId,
        elements: Vec<MappingEntry>,
    },
    /// A peer's own mapping lost elements.
    MappingElementsRemoved {
        peer_id: PeerId,
        elements: Vec<MappingEntry>,
    },
    /// The local mapping table was edited.
    LocalMappingChanged {
        added: Vec<MappingEntry>,
        removed: Vec<MappingEntry>,
    },
    /// A subscription channel to a peer was opened.
    ChannelOpened { peer_id: PeerId, outputs: Vec<String> },
    /// The output set of an open channel changed.
    ChannelUpdated { peer_id: PeerId, outputs: Vec<String> },
    /// A subscription channel was torn down.
    ChannelClosed { peer_id: PeerId },
    /// A mapping element now receives values from at least one peer.
    MappingElementActivated {
        id: MappingId,
        entry: MappingEntry,
        peers: Vec<PeerId>,
    },
    /// A mapping element stopped receiving values.
    MappingElementDeactivated {
        id: MappingId,
        entry: MappingEntry,
        reason: InactiveReason,
    },
    /// Type-incompatible match, surfaced for operator visibility.
    IncompatibleMapping(IncompatibleMapping),
    /// A local IOP was destroyed.
    IopRemoved { category: IopCategory, name: String },
    /// A new local definition is active.
    DefinitionActivated {
        name: String,
        version: String,
        fingerprint: Fingerprint,
    },
    /// A quota ceiling was crossed; the engine is in degraded mode.
    QuotaExceeded { kind: QuotaKind },
}

impl EngineEvent {
    /// Short machine name of the event, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::PeerJoined { .. } => "peer_joined",
            EngineEvent::PeerRejoined { .. } => "peer_rejoined",
            EngineEvent::PeerLeft { .. } => "peer_left",
            EngineEvent::PeerPurged { .. } => "peer_purged",
            EngineEvent::PeerDefinitionChanged { .. } => "peer_definition_changed",
            EngineEvent::OutputsAdded { .. } => "outputs_added",
            EngineEvent::OutputsRemoved { .. } => "outputs_removed",
            EngineEvent::MappingElementsAdded { .. } => "mapping_elements_added",
            EngineEvent::MappingElementsRemoved { .. } => "mapping_elements_removed",
            EngineEvent::LocalMappingChanged { .. } => "local_mapping_changed",
            EngineEvent::ChannelOpened { .. } => "channel_opened",
            EngineEvent::ChannelUpdated { .. } => "channel_updated",
            EngineEvent::ChannelClosed { .. } => "channel_closed",
            EngineEvent::MappingElementActivated { .. } => "mapping_element_activated",
            EngineEvent::MappingElementDeactivated { .. } => "mapping_element_deactivated",
            EngineEvent::IncompatibleMapping(_) => "incompatible_mapping",
            EngineEvent::IopRemoved { .. } => "iop_removed",
            EngineEvent::DefinitionActivated { .. } => "definition_activated",
            EngineEvent::QuotaExceeded { .. } => "quota_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::QuotaExceeded {
            kind: QuotaKind::TooManyIops,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("quota_exceeded"));
        assert!(json.contains("too_many_iops"));
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "quota_exceeded");
    }

    #[test]
    fn test_incompatible_event_roundtrip() {
        let entry = MappingEntry::new("tempIn", "Sensor", "temp");
        let event = EngineEvent::IncompatibleMapping(IncompatibleMapping {
            id: entry.id(),
            entry,
            peer_id: PeerId::from("p1"),
            input_type: IopType::Double,
            output_type: IopType::Integer,
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
