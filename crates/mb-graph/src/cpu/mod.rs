use crate::backend::{BackendKind, ComputeBackend};
use crate::error::Result;
use crate::storage::BackendBuffer;

/// Tensor alignment used by host memory buffers.
pub const CPU_BUFFER_ALIGNMENT: usize = 32;

/// Host-memory backend. Always available.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn alignment(&self) -> usize {
        CPU_BUFFER_ALIGNMENT
    }

    fn alloc_buffer(&self, size: usize) -> Result<BackendBuffer> {
        BackendBuffer::zeroed(self.name(), size, self.alignment())
    }
}
