//! Shared error types for the iopmesh system.

use crate::iop::{IopCategory, IopType};
use thiserror::Error;

/// Top-level error type for the iopmesh system.
#[derive(Error, Debug)]
pub enum IopMeshError {
    /// An IOP with this name already exists in the category.
    #[error("Duplicate {category} name: {name}")]
    DuplicateName {
        /// Category the name collides in.
        category: IopCategory,
        /// The colliding name.
        name: String,
    },

    /// A value does not match the declared type of its IOP.
    #[error("Type mismatch on {category} '{name}': declared {expected}, got {actual}")]
    TypeMismatch {
        /// Category of the IOP.
        category: IopCategory,
        /// Name of the IOP.
        name: String,
        /// Declared type.
        expected: IopType,
        /// Type of the rejected value.
        actual: IopType,
    },

    /// The requested IOP does not exist.
    #[error("Unknown {category}: {name}")]
    UnknownIop {
        /// Category that was searched.
        category: IopCategory,
        /// Name that was not found.
        name: String,
    },

    /// The peer id is not known to the directory (or no longer alive).
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// No mapping element carries this id.
    #[error("Unknown mapping element: {0}")]
    UnknownMappingElement(u64),

    /// A definition or mapping payload could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A required allocation failed.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Invalid argument from the host application.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A network error occurred.
    #[error("Network error: {0}")]
    Network(String),

    /// The engine is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for IopMeshError {
    fn from(e: serde_json::Error) -> Self {
        IopMeshError::Parse(e.to_string())
    }
}

/// Alias for Result with IopMeshError.
pub type IopMeshResult<T> = Result<T, IopMeshError>;
