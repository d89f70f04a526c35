use std::fmt::{self, Debug};
use std::sync::Arc;

use tracing::debug;

use crate::cpu::CpuBackend;
use crate::error::{GraphError, Result};
use crate::storage::BackendBuffer;

/// Compute devices a model can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Cpu,
    Metal,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => f.write_str("cpu"),
            BackendKind::Metal => f.write_str("metal"),
        }
    }
}

/// Trait for pluggable compute backends (CPU, Metal, etc.).
///
/// A backend owns the memory model weights are uploaded to. Graphs are built
/// against the weights but never executed here, so the trait only covers
/// identification and buffer allocation.
pub trait ComputeBackend: Send + Sync + Debug {
    /// Returns the name of this backend (e.g., "cpu", "metal").
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Required byte alignment of tensors placed in this backend's buffers.
    fn alignment(&self) -> usize;

    /// Allocate a zeroed buffer of `size` bytes.
    fn alloc_buffer(&self, size: usize) -> Result<BackendBuffer>;
}

/// Create the compute backend for `kind`.
///
/// Fails with [`GraphError::BackendUnavailable`] when the device is not
/// compiled in or not present on this machine.
pub fn select_backend(kind: BackendKind) -> Result<Arc<dyn ComputeBackend>> {
    let backend: Arc<dyn ComputeBackend> = match kind {
        BackendKind::Cpu => Arc::new(CpuBackend::new()),
        #[cfg(feature = "metal")]
        BackendKind::Metal => match crate::metal::MetalBackend::new() {
            Some(b) => Arc::new(b),
            None => {
                return Err(GraphError::BackendUnavailable(
                    "no metal device found".to_string(),
                ))
            }
        },
        #[cfg(not(feature = "metal"))]
        BackendKind::Metal => {
            return Err(GraphError::BackendUnavailable(
                "metal support not compiled in".to_string(),
            ))
        }
    };
    debug!(backend = backend.name(), "selected compute backend");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_cpu() {
        let b = select_backend(BackendKind::Cpu).unwrap();
        assert_eq!(b.kind(), BackendKind::Cpu);
        assert_eq!(b.name(), "cpu");
    }

    #[cfg(not(feature = "metal"))]
    #[test]
    fn test_select_metal_unavailable() {
        let err = select_backend(BackendKind::Metal).unwrap_err();
        assert!(matches!(err, GraphError::BackendUnavailable(_)));
    }
}
