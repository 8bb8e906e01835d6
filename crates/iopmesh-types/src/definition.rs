//! Agent definitions — the named, versioned description of an IOP set.
//!
//! A [`Definition`] is what an agent announces to its peers. Two definitions
//! that share `name` and `version` but differ structurally are *variants* of
//! each other; [`Definition::fingerprint`] is the structural identity used to
//! tell them apart.

use crate::error::{IopMeshError, IopMeshResult};
use crate::iop::{IopCategory, IopType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Name and declared type of one IOP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IopDescriptor {
    /// Name, unique within its category.
    pub name: String,
    /// Declared value type.
    #[serde(rename = "type")]
    pub value_type: IopType,
}

impl IopDescriptor {
    /// Create a descriptor.
    pub fn new(name: impl Into<String>, value_type: IopType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// Hex-encoded SHA-256 over the structural content of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named, versioned bundle of parameters, inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Agent name.
    pub name: String,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
    /// Version string.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub parameters: Vec<IopDescriptor>,
    #[serde(default)]
    pub inputs: Vec<IopDescriptor>,
    #[serde(default)]
    pub outputs: Vec<IopDescriptor>,
}

impl Definition {
    /// Create an empty definition.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: version.into(),
            parameters: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Parse a definition from JSON.
    ///
    /// Accepts either the bare definition object or one wrapped as
    /// `{"definition": {...}}`. Names must be non-empty and unique per category.
    pub fn from_json(json: &str) -> IopMeshResult<Self> {
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        if let Some(inner) = value.get_mut("definition") {
            value = inner.take();
        }
        let def: Definition = serde_json::from_value(value)?;
        def.validate()?;
        Ok(def)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> IopMeshResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check name rules: non-empty agent name, non-empty and unique IOP names.
    pub fn validate(&self) -> IopMeshResult<()> {
        if self.name.trim().is_empty() {
            return Err(IopMeshError::Parse("definition has no name".into()));
        }
        for category in IopCategory::ALL {
            let mut seen = HashSet::new();
            for iop in self.iops(category) {
                if iop.name.trim().is_empty() {
                    return Err(IopMeshError::Parse(format!(
                        "{category} with empty name in definition '{}'",
                        self.name
                    )));
                }
                if !seen.insert(iop.name.as_str()) {
                    return Err(IopMeshError::Parse(format!(
                        "duplicate {category} '{}' in definition '{}'",
                        iop.name, self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The IOPs of one category, in declaration order.
    pub fn iops(&self, category: IopCategory) -> &[IopDescriptor] {
        match category {
            IopCategory::Parameter => &self.parameters,
            IopCategory::Input => &self.inputs,
            IopCategory::Output => &self.outputs,
        }
    }

    fn iops_mut(&mut self, category: IopCategory) -> &mut Vec<IopDescriptor> {
        match category {
            IopCategory::Parameter => &mut self.parameters,
            IopCategory::Input => &mut self.inputs,
            IopCategory::Output => &mut self.outputs,
        }
    }

    /// Look up an IOP by category and name.
    pub fn find(&self, category: IopCategory, name: &str) -> Option<&IopDescriptor> {
        self.iops(category).iter().find(|d| d.name == name)
    }

    /// Look up an output by name.
    pub fn output(&self, name: &str) -> Option<&IopDescriptor> {
        self.find(IopCategory::Output, name)
    }

    /// Append an IOP, rejecting a name already used in that category.
    pub fn add(&mut self, category: IopCategory, iop: IopDescriptor) -> IopMeshResult<()> {
        if self.find(category, &iop.name).is_some() {
            return Err(IopMeshError::DuplicateName {
                category,
                name: iop.name,
            });
        }
        self.iops_mut(category).push(iop);
        Ok(())
    }

    /// Remove an IOP, returning it if it existed.
    pub fn remove(&mut self, category: IopCategory, name: &str) -> Option<IopDescriptor> {
        let iops = self.iops_mut(category);
        let pos = iops.iter().position(|d| d.name == name)?;
        Some(iops.remove(pos))
    }

    /// Total number of IOPs over all categories.
    pub fn iop_count(&self) -> usize {
        self.parameters.len() + self.inputs.len() + self.outputs.len()
    }

    /// Output names mapped to their declared types.
    pub fn output_types(&self) -> BTreeMap<String, IopType> {
        self.outputs
            .iter()
            .map(|d| (d.name.clone(), d.value_type))
            .collect()
    }

    /// Structural hash over name, version and every category's IOP set.
    ///
    /// IOPs are hashed in name order, so declaration order does not matter.
    /// The description is not part of the structure. Every string is
    /// length-prefixed, so names containing separators cannot collide.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, &self.name);
        hash_field(&mut hasher, &self.version);
        for category in IopCategory::ALL {
            let mut iops: Vec<&IopDescriptor> = self.iops(category).iter().collect();
            iops.sort_by(|a, b| a.name.cmp(&b.name));
            hash_field(&mut hasher, &category.to_string());
            hasher.update((iops.len() as u64).to_be_bytes());
            for iop in iops {
                hash_field(&mut hasher, &iop.name);
                hash_field(&mut hasher, iop.value_type.as_str());
            }
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Same name and version, different structure.
    pub fn is_variant_of(&self, other: &Definition) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.fingerprint() != other.fingerprint()
    }

    /// Deep copy with fallible allocation.
    pub fn try_copy(&self) -> IopMeshResult<Definition> {
        Ok(Definition {
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            parameters: try_clone_vec(&self.parameters)?,
            inputs: try_clone_vec(&self.inputs)?,
            outputs: try_clone_vec(&self.outputs)?,
        })
    }
}

fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field.as_bytes());
}

fn try_clone_vec(src: &[IopDescriptor]) -> IopMeshResult<Vec<IopDescriptor>> {
    let mut out = Vec::new();
    out.try_reserve_exact(src.len())
        .map_err(|e| IopMeshError::Allocation(format!("definition copy: {e}")))?;
    out.extend(src.iter().cloned());
    Ok(out)
}

/// Find every `(name, version)` cohort containing at least two definitions
/// with different fingerprints. The whole cohort is flagged.
pub fn detect_variants<'a, I>(definitions: I) -> BTreeSet<(String, String)>
where
    I: IntoIterator<Item = &'a Definition>,
{
    let mut cohorts: BTreeMap<(String, String), BTreeSet<Fingerprint>> = BTreeMap::new();
    for def in definitions {
        cohorts
            .entry((def.name.clone(), def.version.clone()))
            .or_default()
            .insert(def.fingerprint());
    }
    cohorts
        .into_iter()
        .filter(|(_, prints)| prints.len() > 1)
        .map(|(key, _)| key)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(version: &str) -> Definition {
        let mut def = Definition::new("Sensor", version);
        def.add(IopCategory::Output, IopDescriptor::new("temp", IopType::Double))
            .unwrap();
        def.add(IopCategory::Parameter, IopDescriptor::new("rate", IopType::Integer))
            .unwrap();
        def
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "name": "Sensor",
            "description": "temperature probe",
            "version": "1.0",
            "outputs": [{"name": "temp", "type": "DOUBLE"}],
            "inputs": [{"name": "reset", "type": "IMPULSION"}]
        }"#;
        let def = Definition::from_json(json).unwrap();
        assert_eq!(def.name, "Sensor");
        assert_eq!(def.output("temp").unwrap().value_type, IopType::Double);
        assert!(def.parameters.is_empty());
        assert_eq!(def.iop_count(), 2);
    }

    #[test]
    fn test_from_wrapped_json() {
        let json = r#"{"definition": {"name": "Display", "version": "2"}}"#;
        let def = Definition::from_json(json).unwrap();
        assert_eq!(def.name, "Display");
        assert_eq!(def.version, "2");
    }

    #[test]
    fn test_duplicate_in_json_is_parse_error() {
        let json = r#"{"name": "X", "inputs": [
            {"name": "a", "type": "INTEGER"},
            {"name": "a", "type": "DOUBLE"}
        ]}"#;
        assert!(matches!(
            Definition::from_json(json),
            Err(IopMeshError::Parse(_))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            Definition::from_json("{not json"),
            Err(IopMeshError::Parse(_))
        ));
        assert!(Definition::from_json(r#"{"name": "X", "outputs": [{"name": "o", "type": "FLOAT"}]}"#).is_err());
    }

    #[test]
    fn test_add_duplicate_name() {
        let mut def = sensor("1");
        let err = def
            .add(IopCategory::Output, IopDescriptor::new("temp", IopType::Integer))
            .unwrap_err();
        assert!(matches!(err, IopMeshError::DuplicateName { .. }));
        // Same name in another category is fine
        def.add(IopCategory::Input, IopDescriptor::new("temp", IopType::Double))
            .unwrap();
    }

    #[test]
    fn test_fingerprint_equal_for_identical_sets() {
        let a = sensor("1");
        let mut b = Definition::new("Sensor", "1");
        b.description = "different text".into();
        b.add(IopCategory::Parameter, IopDescriptor::new("rate", IopType::Integer))
            .unwrap();
        b.add(IopCategory::Output, IopDescriptor::new("temp", IopType::Double))
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(!a.is_variant_of(&b));
    }

    #[test]
    fn test_fingerprint_differs_and_flags_variants() {
        let a = sensor("1");
        let mut b = sensor("1");
        b.add(IopCategory::Output, IopDescriptor::new("humidity", IopType::Double))
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(a.is_variant_of(&b));
        assert!(b.is_variant_of(&a));

        // Type change alone is structural
        let mut c = Definition::new("Sensor", "1");
        c.add(IopCategory::Output, IopDescriptor::new("temp", IopType::Integer))
            .unwrap();
        c.add(IopCategory::Parameter, IopDescriptor::new("rate", IopType::Integer))
            .unwrap();
        assert!(a.is_variant_of(&c));
    }

    #[test]
    fn test_separators_in_names_do_not_collide() {
        let mut split = Definition::new("Sensor", "1");
        split
            .add(IopCategory::Output, IopDescriptor::new("a", IopType::Integer))
            .unwrap();
        split
            .add(IopCategory::Output, IopDescriptor::new("b", IopType::Integer))
            .unwrap();
        let mut joined = Definition::new("Sensor", "1");
        joined
            .add(
                IopCategory::Output,
                IopDescriptor::new("a:INTEGER\nb", IopType::Integer),
            )
            .unwrap();

        assert_ne!(split.fingerprint(), joined.fingerprint());
        assert!(split.is_variant_of(&joined));
        assert_eq!(
            detect_variants([&split, &joined]),
            BTreeSet::from([("Sensor".to_string(), "1".to_string())])
        );
    }

    #[test]
    fn test_category_is_structural() {
        let mut a = Definition::new("A", "1");
        a.add(IopCategory::Input, IopDescriptor::new("x", IopType::Bool))
            .unwrap();
        let mut b = Definition::new("A", "1");
        b.add(IopCategory::Output, IopDescriptor::new("x", IopType::Bool))
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_detect_variants_flags_cohort() {
        let a = sensor("1");
        let b = sensor("1");
        let mut c = sensor("1");
        c.remove(IopCategory::Parameter, "rate");
        let d = sensor("2");

        let flagged = detect_variants([&a, &b, &d]);
        assert!(flagged.is_empty());

        let flagged = detect_variants([&a, &b, &c, &d]);
        assert_eq!(flagged.len(), 1);
        assert!(flagged.contains(&("Sensor".to_string(), "1".to_string())));
    }

    #[test]
    fn test_try_copy_is_deep_and_equal() {
        let a = sensor("1");
        let mut copy = a.try_copy().unwrap();
        assert_eq!(a, copy);
        copy.remove(IopCategory::Output, "temp");
        assert!(a.output("temp").is_some());
    }
}
