use std::ptr;

use mb_graph::ComputeGraph;
use mb_model::{Gpt2, Magika, ModelHandle, Yolo};

/// Status codes returned by all FFI functions. Every failure is negative.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbStatus {
    Ok = 0,
    ErrorInvalidArgument = -1,
    ErrorModelLoad = -2,
    ErrorBackendUnavailable = -3,
    ErrorAlreadyInitialized = -4,
    ErrorNotInitialized = -5,
    ErrorGraph = -6,
    ErrorInternal = -7,
}

/// Summary of a computation graph, filled by the `*_graph` functions.
///
/// Extents are innermost first; unused dimensions are 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbGraphDesc {
    pub n_nodes: u32,
    pub n_leafs: u32,
    pub n_inputs: u32,
    pub n_outputs: u32,
    /// Arena bytes charged while building the graph.
    pub mem_used: u64,
    /// Extents of the first graph input.
    pub input_ne: [i64; 4],
    /// Extents of the first graph output.
    pub output_ne: [i64; 4],
}

fn extents(ne: [usize; 4]) -> [i64; 4] {
    ne.map(|n| n as i64)
}

impl MbGraphDesc {
    pub fn describe(graph: &ComputeGraph<'_>) -> Self {
        let mut desc = MbGraphDesc {
            n_nodes: graph.n_nodes() as u32,
            n_leafs: graph.n_leafs() as u32,
            n_inputs: graph.inputs().count() as u32,
            n_outputs: graph.outputs().count() as u32,
            mem_used: graph.mem_used() as u64,
            input_ne: [1; 4],
            output_ne: [1; 4],
        };
        if let Some(input) = graph.inputs().next() {
            desc.input_ne = extents(input.shape().ne());
        }
        if let Some(output) = graph.outputs().next() {
            desc.output_ne = extents(output.shape().ne());
        }
        desc
    }
}

/// Loaded GPT-2 state. Opaque to C.
pub struct MbGpt2ModelBuf {
    pub(crate) handle: ModelHandle<Gpt2>,
}

/// Loaded Magika state. Opaque to C.
pub struct MbMagikaModelBuf {
    pub(crate) handle: ModelHandle<Magika>,
}

/// Loaded YOLO state. Opaque to C.
pub struct MbYoloModelBuf {
    pub(crate) handle: ModelHandle<Yolo>,
}

/// GPT-2 handle. A zero-initialized handle is empty.
#[repr(C)]
#[derive(Debug)]
pub struct MbGpt2Model {
    pub buf: *mut MbGpt2ModelBuf,
}

/// Magika handle. A zero-initialized handle is empty.
#[repr(C)]
#[derive(Debug)]
pub struct MbMagikaModel {
    pub buf: *mut MbMagikaModelBuf,
}

/// YOLO handle. A zero-initialized handle is empty.
#[repr(C)]
#[derive(Debug)]
pub struct MbYoloModel {
    pub buf: *mut MbYoloModelBuf,
}

impl Default for MbGpt2Model {
    fn default() -> Self {
        MbGpt2Model {
            buf: ptr::null_mut(),
        }
    }
}

impl Default for MbMagikaModel {
    fn default() -> Self {
        MbMagikaModel {
            buf: ptr::null_mut(),
        }
    }
}

impl Default for MbYoloModel {
    fn default() -> Self {
        MbYoloModel {
            buf: ptr::null_mut(),
        }
    }
}
