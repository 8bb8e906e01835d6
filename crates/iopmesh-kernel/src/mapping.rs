//! Mapping table — local mapping elements and their resolution against the
//! peer directory.
//!
//! Resolution is a pure function of the table, the local definition and the
//! directory: running it twice on unchanged inputs yields the same
//! [`Resolution`], whatever order the inputs were built in.

use crate::directory::PeerDirectory;
use iopmesh_types::definition::Definition;
use iopmesh_types::error::{IopMeshError, IopMeshResult};
use iopmesh_types::event::{InactiveReason, IncompatibleMapping};
use iopmesh_types::iop::IopCategory;
use iopmesh_types::mapping::{MappingDocument, MappingEntry, MappingId};
use iopmesh_types::peer::PeerId;
use std::collections::{BTreeMap, BTreeSet};

/// One element of the local mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingElement {
    pub id: MappingId,
    pub entry: MappingEntry,
    pub enabled: bool,
}

/// Result of resolving the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Outputs to subscribe to, per peer. Peers with nothing to subscribe
    /// to are absent.
    pub desired: BTreeMap<PeerId, BTreeSet<String>>,
    /// Active elements and the peers feeding them.
    pub active: BTreeMap<MappingId, BTreeSet<PeerId>>,
    /// Why each other element is inactive.
    pub inactive: BTreeMap<MappingId, InactiveReason>,
    /// Type-incompatible matches found on the way.
    pub warnings: Vec<IncompatibleMapping>,
    /// Local inputs fed by each `(peer, output)`.
    pub routes: BTreeMap<(PeerId, String), BTreeSet<String>>,
    /// Every element that took part, by id.
    pub entries: BTreeMap<MappingId, MappingEntry>,
}

impl Resolution {
    pub fn is_active(&self, id: MappingId) -> bool {
        self.active.contains_key(&id)
    }

    /// Peers feeding an element, empty when inactive.
    pub fn peers_for(&self, id: MappingId) -> Vec<PeerId> {
        self.active
            .get(&id)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Local inputs a value of `output` from `peer` must be written to.
    pub fn inputs_for(&self, peer: &PeerId, output: &str) -> Option<&BTreeSet<String>> {
        self.routes.get(&(peer.clone(), output.to_string()))
    }
}

/// The local mapping: a set of elements keyed by content id.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    elements: BTreeMap<MappingId, MappingElement>,
    name: String,
    description: String,
    version: String,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element. Adding an existing triple returns the existing
    /// element and `false`.
    pub fn add(&mut self, entry: MappingEntry) -> IopMeshResult<(MappingElement, bool)> {
        entry.validate()?;
        let id = entry.id();
        if let Some(existing) = self.elements.get(&id) {
            return Ok((existing.clone(), false));
        }
        let element = MappingElement {
            id,
            entry,
            enabled: true,
        };
        self.elements.insert(id, element.clone());
        Ok((element, true))
    }

    pub fn remove(&mut self, id: MappingId) -> IopMeshResult<MappingElement> {
        self.elements
            .remove(&id)
            .ok_or(IopMeshError::UnknownMappingElement(id.0))
    }

    /// Enable or disable an element. Returns whether the flag changed.
    pub fn set_enabled(&mut self, id: MappingId, enabled: bool) -> IopMeshResult<bool> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or(IopMeshError::UnknownMappingElement(id.0))?;
        let changed = element.enabled != enabled;
        element.enabled = enabled;
        Ok(changed)
    }

    pub fn get(&self, id: MappingId) -> Option<&MappingElement> {
        self.elements.get(&id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &MappingElement> {
        self.elements.values()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Replace the whole table. Returns the entries added and removed.
    ///
    /// Elements present before and after keep their `enabled` flag; new
    /// elements start enabled.
    pub fn load(&mut self, doc: MappingDocument) -> (Vec<MappingEntry>, Vec<MappingEntry>) {
        let next: BTreeMap<MappingId, MappingEntry> =
            doc.mappings.into_iter().map(|e| (e.id(), e)).collect();
        let removed = self
            .elements
            .iter()
            .filter(|(id, _)| !next.contains_key(id))
            .map(|(_, el)| el.entry.clone())
            .collect();
        let added = next
            .iter()
            .filter(|(id, _)| !self.elements.contains_key(id))
            .map(|(_, e)| e.clone())
            .collect();

        self.elements = next
            .into_iter()
            .map(|(id, entry)| {
                let enabled = self.elements.get(&id).map_or(true, |el| el.enabled);
                (id, MappingElement { id, entry, enabled })
            })
            .collect();
        self.name = doc.name;
        self.description = doc.description;
        self.version = doc.version;
        (added, removed)
    }

    /// The table as an announceable document.
    pub fn to_document(&self) -> MappingDocument {
        MappingDocument {
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            mappings: self.elements.values().map(|e| e.entry.clone()).collect(),
        }
    }

    /// Compute the desired subscriptions and per-element state.
    pub fn resolve(&self, local: &Definition, peers: &PeerDirectory) -> Resolution {
        let mut res = Resolution::default();

        for element in self.elements.values() {
            let id = element.id;
            let entry = &element.entry;
            res.entries.insert(id, entry.clone());

            if !element.enabled {
                res.inactive.insert(id, InactiveReason::Disabled);
                continue;
            }
            let Some(input) = local.find(IopCategory::Input, &entry.input_name) else {
                res.inactive.insert(id, InactiveReason::UnknownInput);
                continue;
            };

            let mut matched_any = false;
            let mut incompatible = false;
            let mut feeding = BTreeSet::new();
            for peer in peers.live_peers_named(&entry.agent_name) {
                let Some(definition) = &peer.definition else {
                    continue;
                };
                matched_any = true;
                let Some(output) = definition.output(&entry.output_name) else {
                    continue;
                };
                if output.value_type != input.value_type {
                    incompatible = true;
                    res.warnings.push(IncompatibleMapping {
                        id,
                        entry: entry.clone(),
                        peer_id: peer.peer_id.clone(),
                        input_type: input.value_type,
                        output_type: output.value_type,
                    });
                    continue;
                }
                feeding.insert(peer.peer_id.clone());
                res.desired
                    .entry(peer.peer_id.clone())
                    .or_default()
                    .insert(entry.output_name.clone());
                res.routes
                    .entry((peer.peer_id.clone(), entry.output_name.clone()))
                    .or_default()
                    .insert(entry.input_name.clone());
            }

            if !feeding.is_empty() {
                res.active.insert(id, feeding);
            } else {
                let reason = if !matched_any {
                    InactiveReason::NoMatchingPeer
                } else if incompatible {
                    InactiveReason::Incompatible
                } else {
                    InactiveReason::OutputMissing
                };
                res.inactive.insert(id, reason);
            }
        }
        res
    }
}
