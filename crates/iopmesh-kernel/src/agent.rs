//! The agent context — one local agent and everything it knows.
//!
//! [`Agent`] owns the IOP registry, the active definition, the mapping table,
//! the peer directory, the network engine and the quota guard. It is driven
//! synchronously: host calls and [`TransportEvent`]s mutate it in place, and
//! every observable change is queued as an [`EngineEvent`] for
//! [`Agent::drain_events`]. The async runtime in [`crate::node`] is the only
//! owner in a running process.

use crate::definition::DefinitionStore;
use crate::directory::{JoinOutcome, Peer, PeerDirectory, PeerMeta};
use crate::iop::{IopRegistry, ObserverFn, ObserverHandle};
use crate::mapping::{MappingTable, Resolution};
use crate::network::{Announcement, NetworkEngine, Transport, TransportEvent};
use crate::quota::{LicenseState, QuotaGuard};
use iopmesh_types::config::QuotaConfig;
use iopmesh_types::definition::{detect_variants, Definition, IopDescriptor};
use iopmesh_types::error::{IopMeshError, IopMeshResult};
use iopmesh_types::event::{EngineEvent, InactiveReason};
use iopmesh_types::iop::{IopCategory, IopType, IopValue};
use iopmesh_types::mapping::{MappingDocument, MappingEntry, MappingId};
use iopmesh_types::peer::PeerId;
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One agent on the mesh: its IOPs, definition, mapping and view of peers.
///
/// The agent is synchronous and single-owner. Transport activity comes in
/// through [`Agent::handle_transport_event`], outgoing traffic goes out
/// through `T`, and every observable change is queued as an [`EngineEvent`]
/// until [`Agent::drain_events`] collects it.
pub struct Agent<T: Transport> {
    agent_name: String,
    peer_id: PeerId,
    registry: IopRegistry,
    definitions: DefinitionStore,
    mappings: MappingTable,
    directory: PeerDirectory,
    network: NetworkEngine,
    quota: QuotaGuard,
    transport: T,
    resolution: Resolution,
    events: VecDeque<EngineEvent>,
    shut_down: bool,
}

impl<T: Transport> Agent<T> {
    /// An agent with an empty definition named `agent_name`.
    pub fn new(agent_name: &str, peer_id: PeerId, quota: QuotaConfig, transport: T) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            peer_id,
            registry: IopRegistry::new(),
            definitions: DefinitionStore::new(agent_name),
            mappings: MappingTable::new(),
            directory: PeerDirectory::new(),
            network: NetworkEngine::new(),
            quota: QuotaGuard::new(quota),
            transport,
            resolution: Resolution::default(),
            events: VecDeque::new(),
            shut_down: false,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// True once [`Agent::shutdown`] ran; mutating calls then fail.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // --- IOPs -----------------------------------------------------------

    /// Declare one IOP in the active definition.
    ///
    /// Never refused for quota reasons; crossing `max_iops` only emits
    /// `QuotaExceeded`.
    pub fn declare(
        &mut self,
        category: IopCategory,
        name: &str,
        value_type: IopType,
    ) -> IopMeshResult<()> {
        self.ensure_running()?;
        self.definitions
            .declare(category, IopDescriptor::new(name, value_type))?;
        if let Err(e) = self.registry.declare(category, name, value_type) {
            let _ = self.definitions.remove(category, name);
            return Err(e);
        }
        self.check_iop_quota();
        self.announce_definition(None);
        self.reconcile();
        Ok(())
    }

    /// Delete one IOP. Mappings relying on it are deactivated first, then
    /// its observers are told, then it is destroyed.
    pub fn remove_iop(&mut self, category: IopCategory, name: &str) -> IopMeshResult<()> {
        self.ensure_running()?;
        self.definitions.remove(category, name)?;
        self.reconcile();
        self.registry.remove(category, name)?;
        self.emit(EngineEvent::IopRemoved {
            category,
            name: name.to_string(),
        });
        self.announce_definition(None);
        Ok(())
    }

    /// Rename or re-version the active definition and re-announce it.
    pub fn set_definition_metadata(
        &mut self,
        name: &str,
        description: &str,
        version: &str,
    ) -> IopMeshResult<()> {
        self.ensure_running()?;
        self.definitions.set_metadata(name, description, version)?;
        self.announce_definition(None);
        Ok(())
    }

    /// Store a value; outputs are published unless muted.
    pub fn write(
        &mut self,
        category: IopCategory,
        name: &str,
        value: IopValue,
    ) -> IopMeshResult<()> {
        self.ensure_running()?;
        let publish = self.registry.write(category, name, value.clone())?;
        if publish {
            self.network.publish(name, &value, &mut self.transport);
        }
        Ok(())
    }

    pub fn read(&self, category: IopCategory, name: &str) -> IopMeshResult<Option<IopValue>> {
        self.registry.read(category, name)
    }

    /// Stop publishing an output. Writes still store the value.
    pub fn mute(&mut self, output: &str) -> IopMeshResult<()> {
        self.registry.mute(output)
    }

    pub fn unmute(&mut self, output: &str) -> IopMeshResult<()> {
        self.registry.unmute(output)
    }

    pub fn is_muted(&self, output: &str) -> IopMeshResult<bool> {
        self.registry.is_muted(output)
    }

    /// Suppress publication of every output while set.
    pub fn mute_agent(&mut self, muted: bool) {
        self.registry.set_agent_muted(muted);
    }

    /// Register a callback run on every write to the IOP.
    pub fn observe(
        &mut self,
        category: IopCategory,
        name: &str,
        observer: ObserverFn,
    ) -> IopMeshResult<ObserverHandle> {
        self.registry.observe(category, name, observer)
    }

    pub fn unobserve(&mut self, handle: &ObserverHandle) -> bool {
        self.registry.unobserve(handle)
    }

    // --- Definition -----------------------------------------------------

    /// Replace the active definition.
    ///
    /// Values of IOPs whose name and type survive are kept. Removed IOPs
    /// have their mappings deactivated and their observers notified before
    /// they are destroyed.
    pub fn activate_definition(&mut self, next: Definition) -> IopMeshResult<()> {
        self.ensure_running()?;
        let diff = self.definitions.diff(&next);
        self.definitions.replace(next)?;
        self.reconcile();

        for (category, iop) in &diff.removed {
            if self.registry.remove(*category, &iop.name).is_ok() {
                self.emit(EngineEvent::IopRemoved {
                    category: *category,
                    name: iop.name.clone(),
                });
            }
        }
        for (category, iop) in &diff.added {
            if let Err(e) = self.registry.declare(*category, &iop.name, iop.value_type) {
                warn!(error = %e, "IOP registry out of sync with definition");
            }
        }
        self.check_iop_quota();

        let active = self.definitions.active();
        info!(
            definition = %active.name,
            version = %active.version,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Definition activated"
        );
        let event = EngineEvent::DefinitionActivated {
            name: active.name.clone(),
            version: active.version.clone(),
            fingerprint: active.fingerprint(),
        };
        self.emit(event);
        self.announce_definition(None);
        Ok(())
    }

    /// Parse and activate a definition. A malformed payload changes nothing.
    pub fn load_definition(&mut self, json: &str) -> IopMeshResult<()> {
        let definition = DefinitionStore::load(json)?;
        self.activate_definition(definition)
    }

    /// Deep copy of the active definition.
    pub fn definition(&self) -> IopMeshResult<Definition> {
        self.definitions.active().try_copy()
    }

    // --- Mapping --------------------------------------------------------

    /// Add `input <- agent.output`. Re-adding a known triple is a no-op
    /// returning the same id.
    pub fn add_mapping_element(
        &mut self,
        input_name: &str,
        agent_name: &str,
        output_name: &str,
    ) -> IopMeshResult<MappingId> {
        self.ensure_running()?;
        let (element, created) = self
            .mappings
            .add(MappingEntry::new(input_name, agent_name, output_name))?;
        if created {
            if self
                .definitions
                .active()
                .find(IopCategory::Input, input_name)
                .is_none()
            {
                warn!(input = input_name, "Mapping element names an unknown input");
            }
            self.emit(EngineEvent::LocalMappingChanged {
                added: vec![element.entry.clone()],
                removed: Vec::new(),
            });
            self.announce_mapping(None);
            self.reconcile();
        }
        Ok(element.id)
    }

    /// Drop an element and stop any subscription it alone required.
    pub fn remove_mapping_element(&mut self, id: MappingId) -> IopMeshResult<()> {
        self.ensure_running()?;
        let element = self.mappings.remove(id)?;
        self.emit(EngineEvent::LocalMappingChanged {
            added: Vec::new(),
            removed: vec![element.entry],
        });
        self.announce_mapping(None);
        self.reconcile();
        Ok(())
    }

    /// Disabled elements stay in the table but never subscribe.
    pub fn set_mapping_enabled(&mut self, id: MappingId, enabled: bool) -> IopMeshResult<()> {
        self.ensure_running()?;
        if self.mappings.set_enabled(id, enabled)? {
            self.reconcile();
        }
        Ok(())
    }

    /// Replace the whole local mapping from JSON. Elements kept across the
    /// load keep their enabled flag.
    pub fn load_mapping(&mut self, json: &str) -> IopMeshResult<()> {
        self.ensure_running()?;
        let doc = MappingDocument::from_json(json)?;
        let (added, removed) = self.mappings.load(doc);
        if !added.is_empty() || !removed.is_empty() {
            self.emit(EngineEvent::LocalMappingChanged { added, removed });
        }
        self.announce_mapping(None);
        self.reconcile();
        Ok(())
    }

    pub fn mapping(&self) -> MappingDocument {
        self.mappings.to_document()
    }

    pub fn mapping_table(&self) -> &MappingTable {
        &self.mappings
    }

    /// The last resolution, kept current by every change.
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    // --- Peers ----------------------------------------------------------

    pub fn peers(&self) -> Vec<Peer> {
        self.directory.peers().cloned().collect()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.directory.get(peer_id)
    }

    /// Forget every peer that has left. Returns the purged ids.
    pub fn purge_dead_peers(&mut self) -> Vec<PeerId> {
        let purged = self.directory.purge_dead();
        for peer_id in &purged {
            self.emit(EngineEvent::PeerPurged {
                peer_id: peer_id.clone(),
            });
        }
        purged
    }

    /// `(name, version)` cohorts among live peers' definitions that differ
    /// in structure.
    pub fn peer_definition_variants(&self) -> BTreeSet<(String, String)> {
        detect_variants(
            self.directory
                .live_peers()
                .filter_map(|p| p.definition.as_ref()),
        )
    }

    /// Outputs currently subscribed from a peer.
    pub fn channel(&self, peer_id: &PeerId) -> Option<&BTreeSet<String>> {
        self.network.channel(peer_id)
    }

    // --- Quota ----------------------------------------------------------

    pub fn license_state(&self) -> LicenseState {
        self.quota.state()
    }

    /// Arm the unlicensed time box; [`Agent::tick`] fires it.
    pub fn start_unlicensed_timer(&mut self, duration: Duration, now: Instant) {
        self.quota.start_unlicensed_timer(duration, now);
    }

    pub fn license_found(&mut self) {
        self.quota.license_found();
    }

    /// When the next [`Agent::tick`] has work to do, if ever.
    pub fn quota_deadline(&self) -> Option<Instant> {
        self.quota.deadline()
    }

    /// Run time-based checks.
    pub fn tick(&mut self, now: Instant) {
        if let Some(event) = self.quota.poll_timer(now) {
            self.emit(event);
        }
    }

    // --- Transport ------------------------------------------------------

    /// Apply one event from the transport layer.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.shut_down {
            return;
        }
        match event {
            TransportEvent::Connected {
                peer_id,
                agent_name,
                address,
                outbound,
            } => self.peer_joined(peer_id, &agent_name, PeerMeta { address, outbound }),
            TransportEvent::Disconnected { peer_id } => self.peer_left(&peer_id),
            TransportEvent::Definition { peer_id, json } => {
                match self.directory.on_definition_received(&peer_id, &json) {
                    Ok(events) => {
                        self.emit_all(events);
                        self.reconcile();
                    }
                    Err(e) => warn!(peer = %peer_id, error = %e, "Rejected peer definition"),
                }
            }
            TransportEvent::Mapping { peer_id, json } => {
                match self.directory.on_mapping_received(&peer_id, &json) {
                    Ok(events) => {
                        self.emit_all(events);
                        self.network.rebuild_index(&self.agent_name, &self.directory);
                    }
                    Err(e) => warn!(peer = %peer_id, error = %e, "Rejected peer mapping"),
                }
            }
            TransportEvent::Subscribe { peer_id, outputs } => {
                if self.directory.get(&peer_id).is_some_and(|p| p.alive) {
                    self.network.on_remote_subscribe(&peer_id, outputs);
                }
            }
            TransportEvent::Unsubscribe { peer_id } => self.network.on_remote_unsubscribe(&peer_id),
            TransportEvent::Value {
                peer_id,
                output,
                value,
            } => self.route_value(&peer_id, &output, value),
        }
    }

    fn peer_joined(&mut self, peer_id: PeerId, agent_name: &str, meta: PeerMeta) {
        let previous_name = self.directory.get(&peer_id).map(|p| p.agent_name.clone());
        let (outcome, events) = self.directory.on_peer_joined(&peer_id, agent_name, meta);
        self.emit_all(events);
        let renamed = previous_name.as_deref().is_some_and(|name| name != agent_name);
        if outcome != JoinOutcome::Refreshed {
            let count = self.directory.live_count() + 1;
            if let Some(event) = self.quota.check_agent_count(count) {
                self.emit(event);
            }
        }
        match outcome {
            JoinOutcome::Rejoined => {
                self.network.forget_peer(&peer_id);
                self.network.rebuild_index(&self.agent_name, &self.directory);
                self.reconcile();
            }
            // Mapping elements name agents, so a new name re-targets them.
            JoinOutcome::Refreshed if renamed => {
                info!(peer = %peer_id, agent = agent_name, "Peer renamed");
                self.network.rebuild_index(&self.agent_name, &self.directory);
                self.reconcile();
            }
            _ => {}
        }
        self.announce_definition(Some(&peer_id));
        self.announce_mapping(Some(&peer_id));
    }

    fn peer_left(&mut self, peer_id: &PeerId) {
        let events = self.directory.on_peer_left(peer_id);
        if events.is_empty() {
            return;
        }
        self.emit_all(events);
        self.network.forget_peer(peer_id);
        self.network.rebuild_index(&self.agent_name, &self.directory);
        self.reconcile();
    }

    fn route_value(&mut self, peer_id: &PeerId, output: &str, value: IopValue) {
        let Some(inputs) = self.network.route(peer_id, output).cloned() else {
            debug!(peer = %peer_id, output, "Dropping value outside any channel");
            return;
        };
        for input in inputs {
            if let Err(e) = self.registry.write(IopCategory::Input, &input, value.clone()) {
                warn!(peer = %peer_id, output, input = %input, error = %e, "Dropping incoming value");
            }
        }
    }

    // --- Lifecycle ------------------------------------------------------

    /// Close every channel, tell peers we are leaving and forget them.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        let events = self.network.close_all(&mut self.transport);
        self.emit_all(events);
        self.transport.shutting_down();
        self.directory.clear();
        self.reconcile();
        self.shut_down = true;
        info!(agent = %self.agent_name, "Agent shut down");
    }

    /// Take every queued event, oldest first.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    // --- Internals ------------------------------------------------------

    fn ensure_running(&self) -> IopMeshResult<()> {
        if self.shut_down {
            return Err(IopMeshError::ShuttingDown);
        }
        Ok(())
    }

    fn emit(&mut self, event: EngineEvent) {
        debug!(event = event.kind(), "Engine event");
        self.events.push_back(event);
    }

    fn emit_all(&mut self, events: Vec<EngineEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn check_iop_quota(&mut self) {
        if let Some(event) = self.quota.check_iop_count(self.registry.count()) {
            self.emit(event);
        }
    }

    fn announce_definition(&mut self, target: Option<&PeerId>) {
        match self.definitions.active().to_json() {
            Ok(json) => self
                .transport
                .announce(target, &Announcement::Definition(json)),
            Err(e) => warn!(error = %e, "Cannot serialize definition"),
        }
    }

    fn announce_mapping(&mut self, target: Option<&PeerId>) {
        match self.mappings.to_document().to_json() {
            Ok(json) => self.transport.announce(target, &Announcement::Mapping(json)),
            Err(e) => warn!(error = %e, "Cannot serialize mapping"),
        }
    }

    /// Re-resolve the mapping and apply the result: channel changes first,
    /// then element state changes, then new incompatibility warnings.
    fn reconcile(&mut self) {
        let next = self
            .mappings
            .resolve(self.definitions.active(), &self.directory);
        let channel_events = self.network.apply(&next.desired, &mut self.transport);
        self.emit_all(channel_events);
        self.network.set_routes(next.routes.clone());

        let prev = std::mem::take(&mut self.resolution);
        for (id, peers) in &next.active {
            if prev.active.get(id) == Some(peers) {
                continue;
            }
            if let Some(entry) = next.entries.get(id) {
                info!(mapping = %entry, peers = peers.len(), "Mapping element active");
                self.emit(EngineEvent::MappingElementActivated {
                    id: *id,
                    entry: entry.clone(),
                    peers: peers.iter().cloned().collect(),
                });
            }
        }
        for id in prev.active.keys() {
            if next.active.contains_key(id) {
                continue;
            }
            let reason = next
                .inactive
                .get(id)
                .copied()
                .unwrap_or(InactiveReason::Removed);
            if let Some(entry) = prev.entries.get(id) {
                info!(mapping = %entry, ?reason, "Mapping element inactive");
                self.emit(EngineEvent::MappingElementDeactivated {
                    id: *id,
                    entry: entry.clone(),
                    reason,
                });
            }
        }
        for warning in &next.warnings {
            if !prev.warnings.contains(warning) {
                warn!(
                    mapping = %warning.entry,
                    peer = %warning.peer_id,
                    input_type = %warning.input_type,
                    output_type = %warning.output_type,
                    "Incompatible mapping"
                );
                self.emit(EngineEvent::IncompatibleMapping(warning.clone()));
            }
        }
        self.resolution = next;
    }
}
