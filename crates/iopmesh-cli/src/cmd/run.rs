//! `iopmesh run` — boot an agent and stream its events.

use crate::cli::RunArgs;
use crate::ui;
use iopmesh_kernel::config::load_config;
use iopmesh_kernel::event_bus::EventRecord;
use iopmesh_kernel::AgentNode;
use iopmesh_types::config::EngineConfig;
use iopmesh_types::event::EngineEvent;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

pub fn cmd_run(config_path: Option<PathBuf>, args: RunArgs) {
    let config = apply_run_args(load_config(config_path.as_deref()), &args);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| ui::fail(&format!("Cannot start async runtime: {e}")));
    runtime.block_on(run_agent(config, args.json));
}

/// Command-line flags win over the config file.
pub(crate) fn apply_run_args(mut config: EngineConfig, args: &RunArgs) -> EngineConfig {
    if let Some(name) = &args.name {
        config.agent_name = name.clone();
    }
    if let Some(addr) = args.listen {
        config.listen_addr = addr;
    }
    if let Some(path) = &args.definition {
        config.definition_path = Some(path.clone());
    }
    if let Some(path) = &args.mapping {
        config.mapping_path = Some(path.clone());
    }
    if let Some(secret) = &args.secret {
        config.shared_secret = secret.clone();
    }
    for addr in &args.connect {
        if !config.bootstrap_peers.contains(addr) {
            config.bootstrap_peers.push(*addr);
        }
    }
    config
}

async fn run_agent(config: EngineConfig, json: bool) {
    let agent_name = config.agent_name.clone();
    let node = match AgentNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            ui::error_with_fix(
                &format!("Failed to start agent '{agent_name}': {e}"),
                "check --definition / --mapping or the paths in iopmesh.toml",
            );
            std::process::exit(1);
        }
    };

    if !json {
        ui::section(&format!("Agent {agent_name} running"));
        ui::kv("Peer id", node.peer_id().as_str());
        ui::kv_ok("Listening", &node.local_addr().to_string());
        ui::hint("Press Ctrl+C to leave the network");
        ui::blank();
    }

    // Subscribe before reading history so nothing falls in between.
    let mut events = node.subscribe_events();
    let mut last_seq = 0;
    for record in node.event_history(usize::MAX).await {
        last_seq = record.seq;
        print_record(&record, json);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            received = events.recv() => match received {
                Ok(record) if record.seq <= last_seq => {}
                Ok(record) => print_record(&record, json),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    node.shutdown().await;
    if !json {
        ui::blank();
        ui::check_ok("Agent left the network");
    }
}

fn print_record(record: &EventRecord, json: bool) {
    if json {
        match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Cannot serialize event"),
        }
    } else {
        println!(
            "  {} {:<28} {}",
            record.timestamp.format("%H:%M:%S%.3f"),
            record.event.kind(),
            describe(&record.event)
        );
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One-line human summary of an event.
pub(crate) fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::PeerJoined {
            peer_id,
            agent_name,
            address,
        } => format!(
            "{agent_name} ({peer_id}) at {}",
            address.as_deref().unwrap_or("?")
        ),
        EngineEvent::PeerRejoined {
            peer_id,
            agent_name,
            reconnections,
        } => format!("{agent_name} ({peer_id}), reconnection #{reconnections}"),
        EngineEvent::PeerLeft {
            peer_id,
            agent_name,
        } => format!("{agent_name} ({peer_id})"),
        EngineEvent::PeerPurged { peer_id } => peer_id.to_string(),
        EngineEvent::PeerDefinitionChanged {
            peer_id,
            name,
            version,
            fingerprint,
        } => format!("{peer_id}: {name} {version} [{fingerprint}]"),
        EngineEvent::OutputsAdded {
            agent_name,
            outputs,
            ..
        }
        | EngineEvent::OutputsRemoved {
            agent_name,
            outputs,
            ..
        } => {
            let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
            format!("{agent_name}: {}", names.join(", "))
        }
        EngineEvent::MappingElementsAdded { peer_id, elements }
        | EngineEvent::MappingElementsRemoved { peer_id, elements } => {
            format!("{peer_id}: {}", join(elements))
        }
        EngineEvent::LocalMappingChanged { added, removed } => {
            format!("+{} -{}", added.len(), removed.len())
        }
        EngineEvent::ChannelOpened { peer_id, outputs }
        | EngineEvent::ChannelUpdated { peer_id, outputs } => {
            format!("{peer_id}: {}", outputs.join(", "))
        }
        EngineEvent::ChannelClosed { peer_id } => peer_id.to_string(),
        EngineEvent::MappingElementActivated { entry, peers, .. } => {
            format!("{entry} from {}", join(peers))
        }
        EngineEvent::MappingElementDeactivated { entry, reason, .. } => {
            format!("{entry} ({reason:?})")
        }
        EngineEvent::IncompatibleMapping(warning) => format!(
            "{} on {}: {} cannot feed {}",
            warning.entry, warning.peer_id, warning.output_type, warning.input_type
        ),
        EngineEvent::IopRemoved { category, name } => format!("{category} {name}"),
        EngineEvent::DefinitionActivated {
            name,
            version,
            fingerprint,
        } => format!("{name} {version} [{fingerprint}]"),
        EngineEvent::QuotaExceeded { kind } => kind.to_string(),
    }
}
