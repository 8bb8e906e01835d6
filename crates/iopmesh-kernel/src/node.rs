//! Agent node — runs one [`Agent`] over the TCP wire protocol.
//!
//! The agent lives inside a single event-loop task. Host calls arrive as
//! boxed commands and answer over oneshot channels, transport callbacks
//! arrive as [`TransportEvent`]s, and every queued [`EngineEvent`] is
//! flushed to the [`EventBus`] after each step.

use crate::agent::Agent;
use crate::directory::Peer;
use crate::error::{KernelError, KernelResult};
use crate::event_bus::{EventBus, EventRecord};
use crate::iop::{ObserverFn, ObserverHandle};
use crate::mapping::Resolution;
use crate::network::{Announcement, Transport, TransportEvent};
use crate::quota::LicenseState;
use iopmesh_types::config::EngineConfig;
use iopmesh_types::definition::Definition;
use iopmesh_types::error::IopMeshError;
use iopmesh_types::event::EngineEvent;
use iopmesh_types::iop::{IopCategory, IopType, IopValue};
use iopmesh_types::mapping::{MappingDocument, MappingId};
use iopmesh_types::peer::PeerId;
use iopmesh_wire::{ConnectionTable, PeerConfig, PeerHandle, PeerNode, WireNotification};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Command = Box<dyn FnOnce(&mut Agent<WireTransport>) + Send>;

/// [`Transport`] over the connection table of a [`PeerNode`].
pub struct WireTransport {
    table: ConnectionTable,
}

impl WireTransport {
    pub fn new(table: ConnectionTable) -> Self {
        Self { table }
    }

    fn send(&self, peer: &PeerId, notification: WireNotification) {
        if !self.table.send(peer.as_str(), notification) {
            debug!(peer = %peer, "Peer not connected, dropping notification");
        }
    }
}

impl Transport for WireTransport {
    fn set_channel(&mut self, peer: &PeerId, outputs: &BTreeSet<String>) {
        self.send(
            peer,
            WireNotification::Subscribe {
                outputs: outputs.iter().cloned().collect(),
            },
        );
    }

    fn close_channel(&mut self, peer: &PeerId) {
        self.send(peer, WireNotification::Unsubscribe);
    }

    fn send_value(&mut self, peer: &PeerId, output: &str, value: &IopValue) {
        self.send(
            peer,
            WireNotification::Publish {
                output: output.to_string(),
                value: value.clone(),
            },
        );
    }

    fn announce(&mut self, target: Option<&PeerId>, announcement: &Announcement) {
        let notification = match announcement {
            Announcement::Definition(json) => WireNotification::Definition { json: json.clone() },
            Announcement::Mapping(json) => WireNotification::Mapping { json: json.clone() },
        };
        match target {
            Some(peer) => self.send(peer, notification),
            None => {
                self.table.broadcast(&notification);
            }
        }
    }

    fn shutting_down(&mut self) {
        let notified = self.table.broadcast(&WireNotification::ShuttingDown);
        debug!(peers = notified, "Sent shutdown notice");
        self.table.clear();
    }
}

/// Forwards wire callbacks into the event loop.
struct KernelPeerHandle {
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl KernelPeerHandle {
    fn forward(&self, event: TransportEvent) {
        // The loop is gone once the agent shut down.
        let _ = self.events.send(event);
    }
}

impl PeerHandle for KernelPeerHandle {
    fn peer_connected(&self, peer_id: &str, agent_name: &str, address: SocketAddr, outbound: bool) {
        self.forward(TransportEvent::Connected {
            peer_id: PeerId::from(peer_id),
            agent_name: agent_name.to_string(),
            address: Some(address.to_string()),
            outbound,
        });
    }

    fn peer_disconnected(&self, peer_id: &str) {
        self.forward(TransportEvent::Disconnected {
            peer_id: PeerId::from(peer_id),
        });
    }

    fn notification(&self, peer_id: &str, notification: WireNotification) {
        let peer_id = PeerId::from(peer_id);
        let event = match notification {
            WireNotification::Definition { json } => TransportEvent::Definition { peer_id, json },
            WireNotification::Mapping { json } => TransportEvent::Mapping { peer_id, json },
            WireNotification::Subscribe { outputs } => TransportEvent::Subscribe { peer_id, outputs },
            WireNotification::Unsubscribe => TransportEvent::Unsubscribe { peer_id },
            WireNotification::Publish { output, value } => TransportEvent::Value {
                peer_id,
                output,
                value,
            },
            // The connection ends right after; the disconnect is reported then.
            WireNotification::ShuttingDown => return,
        };
        self.forward(event);
    }
}

/// Handle to a running agent. Cheap to clone; all clones drive the same agent.
#[derive(Clone)]
pub struct AgentNode {
    commands: mpsc::UnboundedSender<Command>,
    node: Arc<PeerNode>,
    bus: Arc<EventBus>,
    stopped: watch::Receiver<bool>,
    peer_id: PeerId,
    agent_name: String,
    reconnect_interval: Duration,
}

impl AgentNode {
    /// Boot an agent: load its definition and mapping, start listening and
    /// dial the bootstrap peers.
    pub async fn start(config: EngineConfig) -> KernelResult<Self> {
        let peer_id = if config.peer_id.trim().is_empty() {
            PeerId::random()
        } else {
            PeerId::from(config.peer_id.as_str())
        };
        let table = ConnectionTable::new();
        let mut agent = Agent::new(
            &config.agent_name,
            peer_id.clone(),
            config.quota.clone(),
            WireTransport::new(table.clone()),
        );

        if let Some(path) = &config.definition_path {
            let json = read_boot_file(path, "definition")?;
            agent.load_definition(&json).map_err(|e| {
                KernelError::BootFailed(format!("invalid definition {}: {e}", path.display()))
            })?;
        }
        if let Some(path) = &config.mapping_path {
            let json = read_boot_file(path, "mapping")?;
            agent.load_mapping(&json).map_err(|e| {
                KernelError::BootFailed(format!("invalid mapping {}: {e}", path.display()))
            })?;
        }
        if config.quota.unlicensed_timeout_secs > 0 {
            agent.start_unlicensed_timer(
                Duration::from_secs(config.quota.unlicensed_timeout_secs),
                Instant::now(),
            );
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer_config = PeerConfig {
            listen_addr: config.listen_addr,
            peer_id: peer_id.to_string(),
            agent_name: config.agent_name.clone(),
            shared_secret: config.shared_secret.clone(),
        };
        let (node, accept_task) =
            PeerNode::start(peer_config, table, Arc::new(KernelPeerHandle { events: events_tx }))
                .await?;

        let bus = Arc::new(EventBus::new(config.event_history));
        for event in agent.drain_events() {
            bus.publish(event).await;
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_event_loop(
            agent,
            commands_rx,
            events_rx,
            Arc::clone(&bus),
            stop_tx,
            accept_task,
        ));

        info!(
            agent = %config.agent_name,
            peer = %peer_id,
            addr = %node.local_addr(),
            "Agent started"
        );

        let handle = Self {
            commands: commands_tx,
            node,
            bus,
            stopped: stop_rx,
            peer_id,
            agent_name: config.agent_name,
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs.max(1)),
        };
        for addr in config.bootstrap_peers {
            handle.dial(addr);
        }
        Ok(handle)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    pub fn is_running(&self) -> bool {
        !*self.stopped.borrow()
    }

    /// Run `f` on the agent inside the event loop.
    async fn call<R, F>(&self, f: F) -> KernelResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Agent<WireTransport>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Box::new(move |agent| {
                let _ = tx.send(f(agent));
            }))
            .map_err(|_| IopMeshError::ShuttingDown)?;
        rx.await.map_err(|_| IopMeshError::ShuttingDown.into())
    }

    // --- Network --------------------------------------------------------

    /// Connect once to a peer. Returns its peer id.
    pub async fn connect(&self, addr: SocketAddr) -> KernelResult<PeerId> {
        let connection = self.node.connect_to_peer(addr).await?;
        Ok(PeerId::from(connection.peer_id))
    }

    /// Keep a connection to `addr` up until shutdown, redialing after
    /// failures and disconnects.
    pub fn dial(&self, addr: SocketAddr) -> JoinHandle<()> {
        tokio::spawn(dial_loop(
            Arc::clone(&self.node),
            addr,
            self.reconnect_interval,
            self.stopped.clone(),
        ))
    }

    // --- IOPs -----------------------------------------------------------

    pub async fn declare(
        &self,
        category: IopCategory,
        name: &str,
        value_type: IopType,
    ) -> KernelResult<()> {
        let name = name.to_string();
        Ok(self
            .call(move |a| a.declare(category, &name, value_type))
            .await??)
    }

    pub async fn remove_iop(&self, category: IopCategory, name: &str) -> KernelResult<()> {
        let name = name.to_string();
        Ok(self.call(move |a| a.remove_iop(category, &name)).await??)
    }

    pub async fn write(
        &self,
        category: IopCategory,
        name: &str,
        value: IopValue,
    ) -> KernelResult<()> {
        let name = name.to_string();
        Ok(self.call(move |a| a.write(category, &name, value)).await??)
    }

    pub async fn read(&self, category: IopCategory, name: &str) -> KernelResult<Option<IopValue>> {
        let name = name.to_string();
        Ok(self.call(move |a| a.read(category, &name)).await??)
    }

    pub async fn mute(&self, output: &str) -> KernelResult<()> {
        let output = output.to_string();
        Ok(self.call(move |a| a.mute(&output)).await??)
    }

    pub async fn unmute(&self, output: &str) -> KernelResult<()> {
        let output = output.to_string();
        Ok(self.call(move |a| a.unmute(&output)).await??)
    }

    pub async fn mute_agent(&self, muted: bool) -> KernelResult<()> {
        self.call(move |a| a.mute_agent(muted)).await
    }

    /// Register an observer. It runs on the event-loop task and must not block.
    pub async fn observe(
        &self,
        category: IopCategory,
        name: &str,
        observer: ObserverFn,
    ) -> KernelResult<ObserverHandle> {
        let name = name.to_string();
        Ok(self
            .call(move |a| a.observe(category, &name, observer))
            .await??)
    }

    pub async fn unobserve(&self, handle: ObserverHandle) -> KernelResult<bool> {
        self.call(move |a| a.unobserve(&handle)).await
    }

    // --- Definition -----------------------------------------------------

    pub async fn activate_definition(&self, definition: Definition) -> KernelResult<()> {
        Ok(self
            .call(move |a| a.activate_definition(definition))
            .await??)
    }

    pub async fn load_definition(&self, json: &str) -> KernelResult<()> {
        let json = json.to_string();
        Ok(self.call(move |a| a.load_definition(&json)).await??)
    }

    pub async fn set_definition_metadata(
        &self,
        name: &str,
        description: &str,
        version: &str,
    ) -> KernelResult<()> {
        let (name, description, version) =
            (name.to_string(), description.to_string(), version.to_string());
        Ok(self
            .call(move |a| a.set_definition_metadata(&name, &description, &version))
            .await??)
    }

    pub async fn definition(&self) -> KernelResult<Definition> {
        Ok(self.call(|a| a.definition()).await??)
    }

    // --- Mapping --------------------------------------------------------

    pub async fn add_mapping_element(
        &self,
        input_name: &str,
        agent_name: &str,
        output_name: &str,
    ) -> KernelResult<MappingId> {
        let (input, agent, output) = (
            input_name.to_string(),
            agent_name.to_string(),
            output_name.to_string(),
        );
        Ok(self
            .call(move |a| a.add_mapping_element(&input, &agent, &output))
            .await??)
    }

    pub async fn remove_mapping_element(&self, id: MappingId) -> KernelResult<()> {
        Ok(self.call(move |a| a.remove_mapping_element(id)).await??)
    }

    pub async fn set_mapping_enabled(&self, id: MappingId, enabled: bool) -> KernelResult<()> {
        Ok(self
            .call(move |a| a.set_mapping_enabled(id, enabled))
            .await??)
    }

    pub async fn load_mapping(&self, json: &str) -> KernelResult<()> {
        let json = json.to_string();
        Ok(self.call(move |a| a.load_mapping(&json)).await??)
    }

    pub async fn mapping(&self) -> KernelResult<MappingDocument> {
        self.call(|a| a.mapping()).await
    }

    pub async fn resolution(&self) -> KernelResult<Resolution> {
        self.call(|a| a.resolution().clone()).await
    }

    // --- Peers ----------------------------------------------------------

    pub async fn peers(&self) -> KernelResult<Vec<Peer>> {
        self.call(|a| a.peers()).await
    }

    pub async fn purge_dead_peers(&self) -> KernelResult<Vec<PeerId>> {
        self.call(|a| a.purge_dead_peers()).await
    }

    pub async fn peer_definition_variants(&self) -> KernelResult<BTreeSet<(String, String)>> {
        self.call(|a| a.peer_definition_variants()).await
    }

    // --- Quota ----------------------------------------------------------

    pub async fn license_state(&self) -> KernelResult<LicenseState> {
        self.call(|a| a.license_state()).await
    }

    pub async fn license_found(&self) -> KernelResult<()> {
        self.call(|a| a.license_found()).await
    }

    // --- Events ---------------------------------------------------------

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.bus.subscribe()
    }

    pub async fn event_history(&self, limit: usize) -> Vec<EventRecord> {
        self.bus.history(limit).await
    }

    /// Leave the network and stop the event loop. Waits until the agent is down.
    pub async fn shutdown(&self) {
        if self.call(|a| a.shutdown()).await.is_err() {
            debug!(agent = %self.agent_name, "Agent already stopped");
        }
        let mut stopped = self.stopped.clone();
        while !*stopped.borrow_and_update() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
    }
}

fn read_boot_file(path: &Path, what: &str) -> KernelResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        KernelError::BootFailed(format!("cannot read {what} {}: {e}", path.display()))
    })
}

async fn run_event_loop(
    mut agent: Agent<WireTransport>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    bus: Arc<EventBus>,
    stop: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
) {
    loop {
        let deadline = agent.quota_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command(&mut agent),
                // Every handle is gone.
                None => agent.shutdown(),
            },
            Some(event) = transport_events.recv() => agent.handle_transport_event(event),
            _ = sleep_until(deadline) => agent.tick(Instant::now()),
        }
        flush_events(&mut agent, &bus).await;
        if agent.is_shut_down() {
            break;
        }
    }

    accept_task.abort();
    let _ = stop.send(true);
    info!(agent = %agent.agent_name(), "Event loop stopped");
}

async fn flush_events(agent: &mut Agent<WireTransport>, bus: &EventBus) {
    for event in agent.drain_events() {
        if let EngineEvent::QuotaExceeded { kind } = &event {
            warn!(%kind, "Running in degraded mode");
        }
        bus.publish(event).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn dial_loop(
    node: Arc<PeerNode>,
    addr: SocketAddr,
    interval: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    while !*stopped.borrow() {
        match node.connect_to_peer(addr).await {
            Ok(connection) => {
                info!(%addr, peer = %connection.peer_id, "Bootstrap peer connected");
                tokio::select! {
                    _ = connection.task => {
                        info!(%addr, "Bootstrap connection ended");
                    }
                    _ = stopped.changed() => break,
                }
            }
            Err(e) => warn!(%addr, error = %e, "Bootstrap dial failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopped.changed() => break,
        }
    }
    debug!(%addr, "Dial loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_peer_handle_maps_notifications() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = KernelPeerHandle { events: tx };
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        handle.peer_connected("p1", "Sensor", addr, true);
        handle.notification(
            "p1",
            WireNotification::Publish {
                output: "temp".into(),
                value: IopValue::Double(1.5),
            },
        );
        handle.notification("p1", WireNotification::ShuttingDown);
        handle.peer_disconnected("p1");

        assert_eq!(
            recorded(&mut rx),
            vec![
                TransportEvent::Connected {
                    peer_id: PeerId::from("p1"),
                    agent_name: "Sensor".into(),
                    address: Some("127.0.0.1:4000".into()),
                    outbound: true,
                },
                TransportEvent::Value {
                    peer_id: PeerId::from("p1"),
                    output: "temp".into(),
                    value: IopValue::Double(1.5),
                },
                TransportEvent::Disconnected {
                    peer_id: PeerId::from("p1"),
                },
            ]
        );
    }

    #[test]
    fn test_wire_transport_without_peers_is_silent() {
        let mut transport = WireTransport::new(ConnectionTable::new());
        transport.set_channel(&PeerId::from("ghost"), &BTreeSet::from(["temp".to_string()]));
        transport.announce(None, &Announcement::Mapping("{}".into()));
        transport.shutting_down();
    }

    #[tokio::test]
    async fn test_boot_fails_on_missing_definition() {
        let config = EngineConfig {
            definition_path: Some("/nonexistent/iopmesh/definition.json".into()),
            ..Default::default()
        };
        match AgentNode::start(config).await {
            Err(KernelError::BootFailed(msg)) => assert!(msg.contains("definition")),
            other => panic!("expected boot failure, got {:?}", other.err()),
        }
    }
}
