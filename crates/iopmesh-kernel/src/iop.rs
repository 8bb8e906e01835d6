//! IOP registry — current values, mute flags and observer chains of the
//! local agent's inputs, outputs and parameters.
//!
//! The registry never talks to the network. [`IopRegistry::write`] reports
//! whether the accepted value should be published and leaves publication to
//! the caller.

use iopmesh_types::definition::IopDescriptor;
use iopmesh_types::error::{IopMeshError, IopMeshResult};
use iopmesh_types::iop::{IopCategory, IopType, IopValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What an observer is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum IopChange {
    /// A value was accepted. Fired on every write, also for repeated values.
    Written {
        category: IopCategory,
        name: String,
        value: IopValue,
    },
    /// The IOP is about to be destroyed. Last notification for this IOP.
    Removed { category: IopCategory, name: String },
}

/// Callback registered on one IOP.
pub type ObserverFn = Arc<dyn Fn(&IopChange) + Send + Sync>;

/// Cancelable registration returned by [`IopRegistry::observe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    id: u64,
    category: IopCategory,
    name: String,
}

impl ObserverHandle {
    /// Category of the observed IOP.
    pub fn category(&self) -> IopCategory {
        self.category
    }

    /// Name of the observed IOP.
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Iop {
    value_type: IopType,
    value: Option<IopValue>,
    muted: bool,
    observers: Vec<(u64, ObserverFn)>,
}

impl fmt::Debug for Iop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iop")
            .field("value_type", &self.value_type)
            .field("value", &self.value)
            .field("muted", &self.muted)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Owned table of IOPs keyed by category and name.
#[derive(Debug, Default)]
pub struct IopRegistry {
    iops: BTreeMap<(IopCategory, String), Iop>,
    next_observer: u64,
    agent_muted: bool,
}

impl IopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unset IOP.
    pub fn declare(
        &mut self,
        category: IopCategory,
        name: &str,
        value_type: IopType,
    ) -> IopMeshResult<()> {
        let key = (category, name.to_string());
        if self.iops.contains_key(&key) {
            return Err(IopMeshError::DuplicateName {
                category,
                name: name.to_string(),
            });
        }
        self.iops.insert(
            key,
            Iop {
                value_type,
                value: None,
                muted: false,
                observers: Vec::new(),
            },
        );
        debug!(%category, iop = name, value_type = %value_type, "IOP declared");
        Ok(())
    }

    /// Store a value and run the IOP's observers in registration order.
    ///
    /// Returns true when the value should be published: the IOP is an
    /// output and neither it nor the whole agent is muted. On a type
    /// mismatch the stored value is left untouched and no observer runs.
    pub fn write(
        &mut self,
        category: IopCategory,
        name: &str,
        value: IopValue,
    ) -> IopMeshResult<bool> {
        let agent_muted = self.agent_muted;
        let iop = self.get_mut(category, name)?;
        if !value.is_compatible_with(iop.value_type) {
            return Err(IopMeshError::TypeMismatch {
                category,
                name: name.to_string(),
                expected: iop.value_type,
                actual: value.value_type(),
            });
        }
        iop.value = Some(value.clone());
        let publish = category == IopCategory::Output && !iop.muted && !agent_muted;
        let observers: Vec<ObserverFn> = iop.observers.iter().map(|(_, f)| f.clone()).collect();

        let change = IopChange::Written {
            category,
            name: name.to_string(),
            value,
        };
        for observer in observers {
            observer(&change);
        }
        Ok(publish)
    }

    /// Current value, `None` while unset.
    pub fn read(&self, category: IopCategory, name: &str) -> IopMeshResult<Option<IopValue>> {
        Ok(self.get(category, name)?.value.clone())
    }

    /// Suppress publication of an output. The stored value is kept.
    pub fn mute(&mut self, name: &str) -> IopMeshResult<()> {
        self.get_mut(IopCategory::Output, name)?.muted = true;
        Ok(())
    }

    /// Resume publication of an output from the next write on.
    pub fn unmute(&mut self, name: &str) -> IopMeshResult<()> {
        self.get_mut(IopCategory::Output, name)?.muted = false;
        Ok(())
    }

    pub fn is_muted(&self, name: &str) -> IopMeshResult<bool> {
        Ok(self.get(IopCategory::Output, name)?.muted)
    }

    /// Mute or unmute every output at once, independently of per-output flags.
    pub fn set_agent_muted(&mut self, muted: bool) {
        self.agent_muted = muted;
    }

    pub fn is_agent_muted(&self) -> bool {
        self.agent_muted
    }

    /// Append an observer to the IOP's chain.
    pub fn observe(
        &mut self,
        category: IopCategory,
        name: &str,
        observer: ObserverFn,
    ) -> IopMeshResult<ObserverHandle> {
        let id = self.next_observer;
        let iop = self.get_mut(category, name)?;
        iop.observers.push((id, observer));
        self.next_observer += 1;
        Ok(ObserverHandle {
            id,
            category,
            name: name.to_string(),
        })
    }

    /// Cancel an observer. Returns false if it was already gone.
    pub fn unobserve(&mut self, handle: &ObserverHandle) -> bool {
        match self
            .iops
            .get_mut(&(handle.category, handle.name.clone()))
        {
            Some(iop) => {
                let before = iop.observers.len();
                iop.observers.retain(|(id, _)| *id != handle.id);
                iop.observers.len() != before
            }
            None => false,
        }
    }

    /// Destroy an IOP, telling its observers first.
    pub fn remove(&mut self, category: IopCategory, name: &str) -> IopMeshResult<IopDescriptor> {
        let key = (category, name.to_string());
        let Some(iop) = self.iops.get(&key) else {
            return Err(IopMeshError::UnknownIop {
                category,
                name: name.to_string(),
            });
        };
        let change = IopChange::Removed {
            category,
            name: name.to_string(),
        };
        for (_, observer) in &iop.observers {
            observer(&change);
        }
        let value_type = iop.value_type;
        self.iops.remove(&key);
        debug!(%category, iop = name, "IOP removed");
        Ok(IopDescriptor::new(name, value_type))
    }

    pub fn contains(&self, category: IopCategory, name: &str) -> bool {
        self.iops.contains_key(&(category, name.to_string()))
    }

    /// Declared type of an IOP.
    pub fn value_type(&self, category: IopCategory, name: &str) -> Option<IopType> {
        self.iops
            .get(&(category, name.to_string()))
            .map(|iop| iop.value_type)
    }

    /// Total IOP count over all categories.
    pub fn count(&self) -> usize {
        self.iops.len()
    }

    fn get(&self, category: IopCategory, name: &str) -> IopMeshResult<&Iop> {
        self.iops
            .get(&(category, name.to_string()))
            .ok_or_else(|| IopMeshError::UnknownIop {
                category,
                name: name.to_string(),
            })
    }

    fn get_mut(&mut self, category: IopCategory, name: &str) -> IopMeshResult<&mut Iop> {
        self.iops
            .get_mut(&(category, name.to_string()))
            .ok_or_else(|| IopMeshError::UnknownIop {
                category,
                name: name.to_string(),
            })
    }
}
