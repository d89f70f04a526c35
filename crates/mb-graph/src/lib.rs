//! `mb-graph` - tensor metadata and computation-graph construction for model-bind.
//!
//! This crate provides:
//! - Data types and shapes in the ggml layout (innermost dimension first)
//! - A `ComputeBackend` trait with a CPU backend and an optional Metal backend
//! - A `WeightStore` holding named model tensors in backend buffers
//! - A fixed-size `GraphContext` arena and the `GraphBuilder` that records
//!   operations into it and orders them into a `ComputeGraph`
//!
//! Graphs describe computation only; nothing here evaluates them.

pub mod backend;
pub mod context;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod graph;
#[cfg(feature = "metal")]
pub mod metal;
pub mod op;
pub mod shape;
pub mod storage;
pub mod tensor;
pub mod weights;

// Re-export primary types at the crate root for convenience.
pub use backend::{select_backend, BackendKind, ComputeBackend};
pub use context::{ContextParams, GraphContext, DEFAULT_GRAPH_SIZE};
pub use cpu::CpuBackend;
pub use dtype::DType;
pub use error::{GraphError, Result};
pub use graph::{ComputeGraph, GraphBuilder};
pub use op::{Op, PoolOp};
pub use shape::Shape;
pub use storage::BackendBuffer;
pub use tensor::{NodeId, TensorNode, TensorSource};
pub use weights::{TensorLayout, WeightId, WeightStore, WeightTensor};
