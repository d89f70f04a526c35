use thiserror::Error;

use crate::shape::Shape;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("graph context out of memory: need {needed} bytes, context holds {mem_size}")]
    OutOfMemory { needed: usize, mem_size: usize },
    #[error("graph context of {mem_size} bytes cannot hold a graph of {graph_size} nodes")]
    ContextTooSmall { mem_size: usize, graph_size: usize },
    #[error("graph is full: more than {size} nodes")]
    GraphFull { size: usize },
    #[error("{op}: incompatible shapes {a} and {b}")]
    ShapeMismatch { op: &'static str, a: Shape, b: Shape },
    #[error("{op}: tensor with shape {shape} is not contiguous")]
    NotContiguous { op: &'static str, shape: Shape },
    #[error("view of {len} bytes at offset {offset} exceeds source of {size} bytes")]
    ViewOutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("tensor of shape {shape} and type {dtype} exceeds the address space")]
    TensorTooLarge { shape: Shape, dtype: String },
    #[error("invalid permutation {0:?}")]
    InvalidPermutation([usize; 4]),
    #[error("unknown weight tensor: {0}")]
    UnknownWeight(String),
    #[error("duplicate weight tensor: {0}")]
    DuplicateWeight(String),
    #[error("node {0} does not belong to this graph context")]
    InvalidNode(usize),
    #[error("{op}: unsupported dtype {dtype}")]
    UnsupportedDType { op: &'static str, dtype: String },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("{backend}: failed to allocate buffer of {size} bytes")]
    BufferAllocation { backend: String, size: usize },
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
