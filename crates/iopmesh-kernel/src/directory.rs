//! Peer directory — remote agents seen on the network.
//!
//! Records are keyed by peer id. A peer that leaves is marked dead, not
//! deleted; [`PeerDirectory::purge_dead`] releases dead records.

use chrono::{DateTime, Utc};
use iopmesh_types::definition::{Definition, IopDescriptor};
use iopmesh_types::error::{IopMeshError, IopMeshResult};
use iopmesh_types::event::EngineEvent;
use iopmesh_types::mapping::{MappingDocument, MappingEntry};
use iopmesh_types::peer::PeerId;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Transport details attached to a join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMeta {
    pub address: Option<String>,
    /// We dialed the peer; such peers are redialed after loss.
    pub outbound: bool,
}

/// Lifecycle state of a peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Joined,
    DefinitionKnown,
    Active,
    Dead,
}

/// What a join did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new record was created.
    Joined,
    /// A dead record was revived.
    Rejoined,
    /// The peer was already alive; its details were refreshed.
    Refreshed,
}

/// A remote agent instance.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub agent_name: String,
    pub address: Option<String>,
    pub definition: Option<Definition>,
    pub mapping: Option<MappingDocument>,
    pub alive: bool,
    pub reconnect_eligible: bool,
    pub joined_at: DateTime<Utc>,
    pub reconnections: u32,
}

impl Peer {
    pub fn state(&self) -> PeerState {
        if !self.alive {
            PeerState::Dead
        } else if self.definition.is_none() {
            PeerState::Joined
        } else if self.mapping.is_none() {
            PeerState::DefinitionKnown
        } else {
            PeerState::Active
        }
    }

    /// Outputs of the declared definition, empty while unknown.
    pub fn outputs(&self) -> &[IopDescriptor] {
        self.definition
            .as_ref()
            .map(|d| d.outputs.as_slice())
            .unwrap_or(&[])
    }
}

/// All known peers.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<PeerId, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, revive or refresh a peer record.
    pub fn on_peer_joined(
        &mut self,
        peer_id: &PeerId,
        agent_name: &str,
        meta: PeerMeta,
    ) -> (JoinOutcome, Vec<EngineEvent>) {
        match self.peers.get_mut(peer_id) {
            Some(peer) if peer.alive => {
                peer.agent_name = agent_name.to_string();
                peer.address = meta.address;
                peer.reconnect_eligible = meta.outbound;
                debug!(peer = %peer_id, agent = agent_name, "Peer refreshed");
                (JoinOutcome::Refreshed, Vec::new())
            }
            Some(peer) => {
                peer.alive = true;
                peer.agent_name = agent_name.to_string();
                peer.address = meta.address;
                peer.reconnect_eligible = meta.outbound;
                peer.definition = None;
                peer.mapping = None;
                peer.joined_at = Utc::now();
                peer.reconnections += 1;
                info!(peer = %peer_id, agent = agent_name, reconnections = peer.reconnections, "Peer rejoined");
                let event = EngineEvent::PeerRejoined {
                    peer_id: peer_id.clone(),
                    agent_name: agent_name.to_string(),
                    reconnections: peer.reconnections,
                };
                (JoinOutcome::Rejoined, vec![event])
            }
            None => {
                let event = EngineEvent::PeerJoined {
                    peer_id: peer_id.clone(),
                    agent_name: agent_name.to_string(),
                    address: meta.address.clone(),
                };
                self.peers.insert(
                    peer_id.clone(),
                    Peer {
                        peer_id: peer_id.clone(),
                        agent_name: agent_name.to_string(),
                        address: meta.address,
                        definition: None,
                        mapping: None,
                        alive: true,
                        reconnect_eligible: meta.outbound,
                        joined_at: Utc::now(),
                        reconnections: 0,
                    },
                );
                info!(peer = %peer_id, agent = agent_name, "Peer joined");
                (JoinOutcome::Joined, vec![event])
            }
        }
    }

    /// Mark a peer dead. Emits `PeerLeft`, then `OutputsRemoved` for every
    /// output it had. Unknown or already dead peers produce nothing.
    pub fn on_peer_left(&mut self, peer_id: &PeerId) -> Vec<EngineEvent> {
        let Some(peer) = self.peers.get_mut(peer_id).filter(|p| p.alive) else {
            return Vec::new();
        };
        peer.alive = false;
        info!(peer = %peer_id, agent = %peer.agent_name, "Peer left");

        let mut events = vec![EngineEvent::PeerLeft {
            peer_id: peer_id.clone(),
            agent_name: peer.agent_name.clone(),
        }];
        let outputs = peer.outputs().to_vec();
        if !outputs.is_empty() {
            events.push(EngineEvent::OutputsRemoved {
                peer_id: peer_id.clone(),
                agent_name: peer.agent_name.clone(),
                outputs,
            });
        }
        events
    }

    /// Store a peer's definition and report output changes.
    ///
    /// A malformed payload is rejected and the previous definition kept.
    pub fn on_definition_received(
        &mut self,
        peer_id: &PeerId,
        json: &str,
    ) -> IopMeshResult<Vec<EngineEvent>> {
        let peer = self.live_mut(peer_id)?;
        let definition = Definition::from_json(json)?;

        let old_outputs = peer.outputs().to_vec();
        let mut events = Vec::new();
        let fingerprint = definition.fingerprint();
        if peer.definition.as_ref().map(|d| d.fingerprint()) != Some(fingerprint.clone()) {
            events.push(EngineEvent::PeerDefinitionChanged {
                peer_id: peer_id.clone(),
                name: definition.name.clone(),
                version: definition.version.clone(),
                fingerprint,
            });
        }

        let removed: Vec<IopDescriptor> = old_outputs
            .iter()
            .filter(|o| !definition.outputs.contains(o))
            .cloned()
            .collect();
        let added: Vec<IopDescriptor> = definition
            .outputs
            .iter()
            .filter(|o| !old_outputs.contains(o))
            .cloned()
            .collect();
        if !removed.is_empty() {
            events.push(EngineEvent::OutputsRemoved {
                peer_id: peer_id.clone(),
                agent_name: peer.agent_name.clone(),
                outputs: removed,
            });
        }
        if !added.is_empty() {
            events.push(EngineEvent::OutputsAdded {
                peer_id: peer_id.clone(),
                agent_name: peer.agent_name.clone(),
                outputs: added,
            });
        }
        debug!(peer = %peer_id, definition = %definition.name, "Peer definition stored");
        peer.definition = Some(definition);
        Ok(events)
    }

    /// Store a peer's own mapping and report element changes.
    pub fn on_mapping_received(
        &mut self,
        peer_id: &PeerId,
        json: &str,
    ) -> IopMeshResult<Vec<EngineEvent>> {
        let peer = self.live_mut(peer_id)?;
        let mapping = MappingDocument::from_json(json)?;

        let old: Vec<MappingEntry> = peer
            .mapping
            .as_ref()
            .map(|m| m.mappings.clone())
            .unwrap_or_default();
        let removed: Vec<MappingEntry> = old
            .iter()
            .filter(|e| !mapping.mappings.contains(e))
            .cloned()
            .collect();
        let added: Vec<MappingEntry> = mapping
            .mappings
            .iter()
            .filter(|e| !old.contains(e))
            .cloned()
            .collect();

        let mut events = Vec::new();
        if !removed.is_empty() {
            events.push(EngineEvent::MappingElementsRemoved {
                peer_id: peer_id.clone(),
                elements: removed,
            });
        }
        if !added.is_empty() {
            events.push(EngineEvent::MappingElementsAdded {
                peer_id: peer_id.clone(),
                elements: added,
            });
        }
        peer.mapping = Some(mapping);
        Ok(events)
    }

    /// Release every dead record.
    pub fn purge_dead(&mut self) -> Vec<PeerId> {
        let dead: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| !p.alive)
            .map(|p| p.peer_id.clone())
            .collect();
        for id in &dead {
            self.peers.remove(id);
        }
        dead
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn live_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.alive)
    }

    /// Live peers carrying `agent_name`.
    pub fn live_peers_named<'a>(&'a self, agent_name: &'a str) -> impl Iterator<Item = &'a Peer> {
        self.live_peers().filter(move |p| p.agent_name == agent_name)
    }

    pub fn live_count(&self) -> usize {
        self.live_peers().count()
    }

    /// Live peers whose declared mapping targets `agent_name`.
    pub fn peers_mapping_to(&self, agent_name: &str) -> Vec<PeerId> {
        self.live_peers()
            .filter(|p| {
                p.mapping
                    .as_ref()
                    .is_some_and(|m| m.targeting(agent_name).next().is_some())
            })
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    fn live_mut(&mut self, peer_id: &PeerId) -> IopMeshResult<&mut Peer> {
        self.peers
            .get_mut(peer_id)
            .filter(|p| p.alive)
            .ok_or_else(|| IopMeshError::UnknownPeer(peer_id.to_string()))
    }
}
