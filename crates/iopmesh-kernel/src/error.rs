//! Kernel-specific error types.

use iopmesh_types::error::IopMeshError;
use iopmesh_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping IopMeshError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped IopMeshError.
    #[error(transparent)]
    Mesh(#[from] IopMeshError),

    /// The transport failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
