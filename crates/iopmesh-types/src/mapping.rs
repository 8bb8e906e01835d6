//! Mapping documents: which local input listens to which remote output.

use crate::error::{IopMeshError, IopMeshResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Stable identifier of a mapping element, derived from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingId(pub u64);

impl MappingId {
    /// Id of the `(input, agent, output)` triple.
    pub fn for_triple(input_name: &str, agent_name: &str, output_name: &str) -> Self {
        let mut hash = DJB2_SEED;
        for part in [input_name, agent_name, output_name] {
            hash = djb2_extend(hash, part.as_bytes());
            hash = djb2_extend(hash, &[0]);
        }
        MappingId(hash)
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

const DJB2_SEED: u64 = 5381;

fn djb2_extend(mut hash: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(u64::from(*b));
    }
    hash
}

/// One mapping rule: `input_name <- agent_name.output_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    /// Local input receiving the values.
    pub input_name: String,
    /// Remote agent name; binds to every live peer carrying it.
    pub agent_name: String,
    /// Output name on the remote agent.
    pub output_name: String,
}

impl MappingEntry {
    /// Create an entry.
    pub fn new(
        input_name: impl Into<String>,
        agent_name: impl Into<String>,
        output_name: impl Into<String>,
    ) -> Self {
        Self {
            input_name: input_name.into(),
            agent_name: agent_name.into(),
            output_name: output_name.into(),
        }
    }

    /// Content-derived id.
    pub fn id(&self) -> MappingId {
        MappingId::for_triple(&self.input_name, &self.agent_name, &self.output_name)
    }

    /// Reject empty fields.
    pub fn validate(&self) -> IopMeshResult<()> {
        if self.input_name.is_empty() || self.agent_name.is_empty() || self.output_name.is_empty()
        {
            return Err(IopMeshError::InvalidInput(format!(
                "mapping element has an empty field: {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for MappingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <- {}.{}",
            self.input_name, self.agent_name, self.output_name
        )
    }
}

/// A full mapping as announced by an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MappingJson {
    Bare(Vec<MappingEntry>),
    Document(MappingDocument),
}

impl MappingDocument {
    /// Build an anonymous document from entries.
    pub fn from_entries(mappings: Vec<MappingEntry>) -> Self {
        Self {
            mappings,
            ..Default::default()
        }
    }

    /// Parse either a bare array of triples or a document object.
    ///
    /// Repeated triples collapse to one entry.
    pub fn from_json(json: &str) -> IopMeshResult<Self> {
        let parsed: MappingJson = serde_json::from_str(json)
            .map_err(|e| IopMeshError::Parse(format!("mapping: {e}")))?;
        let mut doc = match parsed {
            MappingJson::Bare(mappings) => Self::from_entries(mappings),
            MappingJson::Document(doc) => doc,
        };
        for entry in &doc.mappings {
            entry
                .validate()
                .map_err(|e| IopMeshError::Parse(e.to_string()))?;
        }
        let mut seen = HashSet::new();
        doc.mappings.retain(|e| seen.insert(e.id()));
        Ok(doc)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> IopMeshResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Entries targeting the given agent name.
    pub fn targeting<'a>(&'a self, agent_name: &'a str) -> impl Iterator<Item = &'a MappingEntry> {
        self.mappings.iter().filter(move |e| e.agent_name == agent_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_content_derived() {
        let a = MappingEntry::new("tempIn", "Sensor", "temp");
        let b = MappingEntry::new("tempIn", "Sensor", "temp");
        let c = MappingEntry::new("tempIn", "Sensor", "humidity");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_id_field_boundaries() {
        let a = MappingId::for_triple("a.b", "c", "d");
        let b = MappingId::for_triple("a", "b.c", "d");
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_bare_array() {
        let json = r#"[
            {"inputName": "tempIn", "agentName": "Sensor", "outputName": "temp"},
            {"inputName": "tempIn", "agentName": "Sensor", "outputName": "temp"}
        ]"#;
        let doc = MappingDocument::from_json(json).unwrap();
        assert_eq!(doc.mappings.len(), 1);
        assert_eq!(doc.mappings[0].agent_name, "Sensor");
    }

    #[test]
    fn test_parse_document() {
        let json = r#"{
            "name": "display-map",
            "version": "1",
            "mappings": [{"inputName": "x", "agentName": "A", "outputName": "y"}]
        }"#;
        let doc = MappingDocument::from_json(json).unwrap();
        assert_eq!(doc.name, "display-map");
        assert_eq!(doc.targeting("A").count(), 1);
        assert_eq!(doc.targeting("B").count(), 0);
    }

    #[test]
    fn test_parse_rejects_empty_fields() {
        let json = r#"[{"inputName": "", "agentName": "A", "outputName": "y"}]"#;
        assert!(matches!(
            MappingDocument::from_json(json),
            Err(IopMeshError::Parse(_))
        ));
        assert!(MappingDocument::from_json("42").is_err());
    }
}
