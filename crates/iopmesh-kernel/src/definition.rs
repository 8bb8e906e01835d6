//! Definition store — the single active definition of the local agent.

use iopmesh_types::definition::{Definition, Fingerprint, IopDescriptor};
use iopmesh_types::error::{IopMeshError, IopMeshResult};
use iopmesh_types::iop::IopCategory;

/// IOP-level difference between the active definition and a replacement.
///
/// An IOP whose type changed appears in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionDiff {
    pub added: Vec<(IopCategory, IopDescriptor)>,
    pub removed: Vec<(IopCategory, IopDescriptor)>,
}

impl DefinitionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Holds the active definition and applies programmatic edits to it.
#[derive(Debug, Clone)]
pub struct DefinitionStore {
    active: Definition,
}

impl DefinitionStore {
    /// Start with an empty definition named after the agent.
    pub fn new(agent_name: &str) -> Self {
        Self {
            active: Definition::new(agent_name, ""),
        }
    }

    /// Parse a definition without activating it.
    pub fn load(json: &str) -> IopMeshResult<Definition> {
        Definition::from_json(json)
    }

    pub fn active(&self) -> &Definition {
        &self.active
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.active.fingerprint()
    }

    /// What replacing the active definition with `next` would change.
    pub fn diff(&self, next: &Definition) -> DefinitionDiff {
        let mut diff = DefinitionDiff::default();
        for category in IopCategory::ALL {
            for old in self.active.iops(category) {
                if next.find(category, &old.name) != Some(old) {
                    diff.removed.push((category, old.clone()));
                }
            }
            for new in next.iops(category) {
                if self.active.find(category, &new.name) != Some(new) {
                    diff.added.push((category, new.clone()));
                }
            }
        }
        diff
    }

    /// Swap in a validated definition, returning the previous one.
    pub fn replace(&mut self, next: Definition) -> IopMeshResult<Definition> {
        next.validate()?;
        Ok(std::mem::replace(&mut self.active, next))
    }

    /// Add one IOP to the active definition.
    pub fn declare(&mut self, category: IopCategory, iop: IopDescriptor) -> IopMeshResult<()> {
        self.active.add(category, iop)
    }

    /// Remove one IOP from the active definition.
    pub fn remove(&mut self, category: IopCategory, name: &str) -> IopMeshResult<IopDescriptor> {
        self.active
            .remove(category, name)
            .ok_or_else(|| IopMeshError::UnknownIop {
                category,
                name: name.to_string(),
            })
    }

    /// Rename, redescribe or re-version the active definition.
    pub fn set_metadata(
        &mut self,
        name: &str,
        description: &str,
        version: &str,
    ) -> IopMeshResult<()> {
        if name.trim().is_empty() {
            return Err(IopMeshError::InvalidInput(
                "definition name must not be empty".into(),
            ));
        }
        self.active.name = name.to_string();
        self.active.description = description.to_string();
        self.active.version = version.to_string();
        Ok(())
    }
}
