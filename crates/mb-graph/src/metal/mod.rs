// Metal device detection (macOS only).
//
// Weights stay in host memory: on unified-memory machines a Metal buffer
// created with shared storage maps the same pages, so binding only needs to
// know a device exists.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal::MTLDevice;

use crate::backend::{BackendKind, ComputeBackend};
use crate::error::Result;
use crate::storage::BackendBuffer;

/// Metal buffers require page-friendly alignment for shared storage.
const METAL_BUFFER_ALIGNMENT: usize = 256;

pub struct MetalBackend {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
}

impl std::fmt::Debug for MetalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetalBackend").finish_non_exhaustive()
    }
}

// SAFETY: MTLDevice objects are documented as thread-safe.
unsafe impl Send for MetalBackend {}
unsafe impl Sync for MetalBackend {}

impl MetalBackend {
    /// Returns `None` if the system has no Metal device.
    pub fn new() -> Option<Self> {
        #[allow(unused_unsafe)]
        let device = unsafe { objc2_metal::MTLCreateSystemDefaultDevice() }?;
        Some(MetalBackend { device })
    }

    pub fn device(&self) -> &ProtocolObject<dyn MTLDevice> {
        &self.device
    }
}

impl ComputeBackend for MetalBackend {
    fn name(&self) -> &str {
        "metal"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Metal
    }

    fn alignment(&self) -> usize {
        METAL_BUFFER_ALIGNMENT
    }

    fn alloc_buffer(&self, size: usize) -> Result<BackendBuffer> {
        BackendBuffer::zeroed(self.name(), size, self.alignment())
    }
}
