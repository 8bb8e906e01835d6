//! Network engine — subscription channels, publication and routing.
//!
//! The engine is transport agnostic: it drives a [`Transport`] and consumes
//! [`TransportEvent`]s. The TCP implementation lives in [`crate::node`];
//! [`RecordingTransport`] keeps every call in memory.

use crate::directory::PeerDirectory;
use iopmesh_types::event::EngineEvent;
use iopmesh_types::iop::IopValue;
use iopmesh_types::peer::PeerId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Raw input from the transport layer, keyed by peer id.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected {
        peer_id: PeerId,
        agent_name: String,
        address: Option<String>,
        outbound: bool,
    },
    Disconnected {
        peer_id: PeerId,
    },
    Definition {
        peer_id: PeerId,
        json: String,
    },
    Mapping {
        peer_id: PeerId,
        json: String,
    },
    /// The peer wants exactly these outputs of ours.
    Subscribe {
        peer_id: PeerId,
        outputs: Vec<String>,
    },
    Unsubscribe {
        peer_id: PeerId,
    },
    Value {
        peer_id: PeerId,
        output: String,
        value: IopValue,
    },
}

/// Local state announced to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    Definition(String),
    Mapping(String),
}

/// Outbound side of the transport. Calls never block; delivery is best effort.
pub trait Transport {
    /// Ask `peer` to send us exactly `outputs`.
    fn set_channel(&mut self, peer: &PeerId, outputs: &BTreeSet<String>);

    /// Ask `peer` to stop sending.
    fn close_channel(&mut self, peer: &PeerId);

    /// Send one output value to `peer`.
    fn send_value(&mut self, peer: &PeerId, output: &str, value: &IopValue);

    /// Announce to one peer, or to every connected peer when `target` is `None`.
    fn announce(&mut self, target: Option<&PeerId>, announcement: &Announcement);

    /// Tell every peer we are going away.
    fn shutting_down(&mut self) {}
}

/// One call made on a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    SetChannel {
        peer: PeerId,
        outputs: Vec<String>,
    },
    CloseChannel {
        peer: PeerId,
    },
    SendValue {
        peer: PeerId,
        output: String,
        value: IopValue,
    },
    Announce {
        target: Option<PeerId>,
        announcement: Announcement,
    },
    ShuttingDown,
}

/// Transport that only records what it is asked to do.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub calls: Vec<TransportCall>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the calls recorded so far.
    pub fn take(&mut self) -> Vec<TransportCall> {
        std::mem::take(&mut self.calls)
    }
}

impl Transport for RecordingTransport {
    fn set_channel(&mut self, peer: &PeerId, outputs: &BTreeSet<String>) {
        self.calls.push(TransportCall::SetChannel {
            peer: peer.clone(),
            outputs: outputs.iter().cloned().collect(),
        });
    }

    fn close_channel(&mut self, peer: &PeerId) {
        self.calls
            .push(TransportCall::CloseChannel { peer: peer.clone() });
    }

    fn send_value(&mut self, peer: &PeerId, output: &str, value: &IopValue) {
        self.calls.push(TransportCall::SendValue {
            peer: peer.clone(),
            output: output.to_string(),
            value: value.clone(),
        });
    }

    fn announce(&mut self, target: Option<&PeerId>, announcement: &Announcement) {
        self.calls.push(TransportCall::Announce {
            target: target.cloned(),
            announcement: announcement.clone(),
        });
    }

    fn shutting_down(&mut self) {
        self.calls.push(TransportCall::ShuttingDown);
    }
}

/// Channel and publication state of the local agent.
#[derive(Debug, Default)]
pub struct NetworkEngine {
    /// Our subscriptions: outputs requested from each peer.
    channels: BTreeMap<PeerId, BTreeSet<String>>,
    /// Inputs fed by each `(peer, output)`.
    routes: BTreeMap<(PeerId, String), BTreeSet<String>>,
    /// Peers' subscriptions to our outputs.
    remote: BTreeMap<PeerId, BTreeSet<String>>,
    /// Reverse index: our output -> peers whose mapping targets it.
    interested: BTreeMap<String, BTreeSet<PeerId>>,
}

impl NetworkEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the channels in line with `desired`. Closures come first.
    pub fn apply<T: Transport>(
        &mut self,
        desired: &BTreeMap<PeerId, BTreeSet<String>>,
        transport: &mut T,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        let stale: Vec<PeerId> = self
            .channels
            .keys()
            .filter(|peer| desired.get(*peer).map_or(true, |o| o.is_empty()))
            .cloned()
            .collect();
        for peer in stale {
            self.channels.remove(&peer);
            transport.close_channel(&peer);
            info!(peer = %peer, "Channel closed");
            events.push(EngineEvent::ChannelClosed { peer_id: peer });
        }

        for (peer, outputs) in desired.iter().filter(|(_, o)| !o.is_empty()) {
            match self.channels.get(peer) {
                Some(current) if current == outputs => {}
                previous => {
                    let opened = previous.is_none();
                    transport.set_channel(peer, outputs);
                    self.channels.insert(peer.clone(), outputs.clone());
                    let list: Vec<String> = outputs.iter().cloned().collect();
                    if opened {
                        info!(peer = %peer, outputs = ?list, "Channel opened");
                        events.push(EngineEvent::ChannelOpened {
                            peer_id: peer.clone(),
                            outputs: list,
                        });
                    } else {
                        debug!(peer = %peer, outputs = ?list, "Channel updated");
                        events.push(EngineEvent::ChannelUpdated {
                            peer_id: peer.clone(),
                            outputs: list,
                        });
                    }
                }
            }
        }
        events
    }

    pub fn set_routes(&mut self, routes: BTreeMap<(PeerId, String), BTreeSet<String>>) {
        self.routes = routes;
    }

    /// Inputs for an incoming value, or `None` if we have no channel for it.
    pub fn route(&self, peer: &PeerId, output: &str) -> Option<&BTreeSet<String>> {
        if !self.channels.get(peer)?.contains(output) {
            return None;
        }
        self.routes.get(&(peer.clone(), output.to_string()))
    }

    pub fn on_remote_subscribe(&mut self, peer: &PeerId, outputs: Vec<String>) {
        debug!(peer = %peer, outputs = ?outputs, "Remote subscription");
        if outputs.is_empty() {
            self.remote.remove(peer);
        } else {
            self.remote.insert(peer.clone(), outputs.into_iter().collect());
        }
    }

    pub fn on_remote_unsubscribe(&mut self, peer: &PeerId) {
        self.remote.remove(peer);
    }

    /// Drop everything a peer asked of us.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.remote.remove(peer);
    }

    /// Rebuild the reverse index from the mappings peers declared.
    pub fn rebuild_index(&mut self, local_agent: &str, directory: &PeerDirectory) {
        self.interested.clear();
        for peer_id in directory.peers_mapping_to(local_agent) {
            let Some(mapping) = directory.get(&peer_id).and_then(|p| p.mapping.as_ref()) else {
                continue;
            };
            for entry in mapping.targeting(local_agent) {
                self.interested
                    .entry(entry.output_name.clone())
                    .or_default()
                    .insert(peer_id.clone());
            }
        }
    }

    /// Peers that map to `output` and subscribed to it.
    pub fn publication_targets(&self, output: &str) -> Vec<PeerId> {
        let Some(interested) = self.interested.get(output) else {
            return Vec::new();
        };
        interested
            .iter()
            .filter(|peer| {
                self.remote
                    .get(*peer)
                    .is_some_and(|outputs| outputs.contains(output))
            })
            .cloned()
            .collect()
    }

    /// Send a value to every target. Returns how many peers it went to.
    pub fn publish<T: Transport>(
        &self,
        output: &str,
        value: &IopValue,
        transport: &mut T,
    ) -> usize {
        let targets = self.publication_targets(output);
        for peer in &targets {
            transport.send_value(peer, output, value);
        }
        if !targets.is_empty() {
            debug!(output, peers = targets.len(), "Published");
        }
        targets.len()
    }

    pub fn channel(&self, peer: &PeerId) -> Option<&BTreeSet<String>> {
        self.channels.get(peer)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Close every channel and forget all state.
    pub fn close_all<T: Transport>(&mut self, transport: &mut T) -> Vec<EngineEvent> {
        let events = self.apply(&BTreeMap::new(), transport);
        self.routes.clear();
        self.remote.clear();
        self.interested.clear();
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PeerMeta;

    fn outputs(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_apply_opens_updates_closes() {
        let mut engine = NetworkEngine::new();
        let mut transport = RecordingTransport::new();
        let peer = PeerId::from("s1");

        let mut desired = BTreeMap::new();
        desired.insert(peer.clone(), outputs(&["temp"]));
        let events = engine.apply(&desired, &mut transport);
        assert!(matches!(events[0], EngineEvent::ChannelOpened { .. }));

        // Re-applying the same set is a no-op.
        assert!(engine.apply(&desired, &mut transport).is_empty());

        desired.insert(peer.clone(), outputs(&["temp", "humidity"]));
        let events = engine.apply(&desired, &mut transport);
        assert!(matches!(events[0], EngineEvent::ChannelUpdated { .. }));

        let events = engine.apply(&BTreeMap::new(), &mut transport);
        assert!(matches!(events[0], EngineEvent::ChannelClosed { .. }));
        assert_eq!(engine.channel_count(), 0);

        let calls = transport.take();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], TransportCall::CloseChannel { peer });
    }

    #[test]
    fn test_route_requires_channel() {
        let mut engine = NetworkEngine::new();
        let mut transport = RecordingTransport::new();
        let peer = PeerId::from("s1");
        let mut routes = BTreeMap::new();
        routes.insert((peer.clone(), "temp".to_string()), outputs(&["tempIn"]));
        engine.set_routes(routes);

        assert!(engine.route(&peer, "temp").is_none());

        let mut desired = BTreeMap::new();
        desired.insert(peer.clone(), outputs(&["temp"]));
        engine.apply(&desired, &mut transport);
        assert_eq!(engine.route(&peer, "temp"), Some(&outputs(&["tempIn"])));
        assert!(engine.route(&peer, "humidity").is_none());
    }

    #[test]
    fn test_publication_needs_mapping_and_subscription() {
        let mut engine = NetworkEngine::new();
        let mut transport = RecordingTransport::new();
        let mut dir = PeerDirectory::new();
        let display = PeerId::from("d1");
        dir.on_peer_joined(&display, "Display", PeerMeta::default());
        dir.on_mapping_received(
            &display,
            r#"[{"inputName":"tempIn","agentName":"Sensor","outputName":"temp"}]"#,
        )
        .unwrap();

        engine.rebuild_index("Sensor", &dir);
        assert_eq!(
            engine.publish("temp", &IopValue::Double(1.0), &mut transport),
            0
        );

        engine.on_remote_subscribe(&display, vec!["temp".into()]);
        assert_eq!(
            engine.publish("temp", &IopValue::Double(2.0), &mut transport),
            1
        );
        assert_eq!(
            engine.publish("other", &IopValue::Double(2.0), &mut transport),
            0
        );

        engine.on_remote_unsubscribe(&display);
        assert!(engine.publication_targets("temp").is_empty());
        assert_eq!(transport.take().len(), 1);
    }
}
