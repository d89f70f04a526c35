use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::op::Op;
use crate::shape::{Shape, MAX_DIMS};
use crate::weights::WeightId;

/// Index of a node within a [`GraphContext`](crate::GraphContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Where a node's data comes from at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorSource {
    /// Produced by the node's op.
    Computed,
    /// Filled by the caller before execution.
    Input,
    /// A model weight held in the graph's weight store.
    Weight(WeightId),
}

/// Metadata of one tensor in a computation graph.
///
/// Nodes never carry payload: extents, strides and provenance only.
#[derive(Debug, Clone)]
pub struct TensorNode {
    pub(crate) id: NodeId,
    pub(crate) op: Op,
    pub(crate) dtype: DType,
    pub(crate) shape: Shape,
    pub(crate) nb: [usize; MAX_DIMS],
    pub(crate) src: [Option<NodeId>; 2],
    pub(crate) view_src: Option<NodeId>,
    pub(crate) view_offset: usize,
    pub(crate) source: TensorSource,
    pub(crate) name: Option<&'static str>,
    pub(crate) output: bool,
}

impl TensorNode {
    /// Fails with [`GraphError::TensorTooLarge`] when the byte size of
    /// `shape` overflows.
    pub(crate) fn new(op: Op, dtype: DType, shape: Shape, source: TensorSource) -> Result<Self> {
        let nb = shape
            .checked_strides(dtype)
            .ok_or_else(|| GraphError::TensorTooLarge {
                shape,
                dtype: dtype.to_string(),
            })?;
        Ok(TensorNode {
            id: NodeId(usize::MAX),
            op,
            dtype,
            shape,
            nb,
            src: [None, None],
            view_src: None,
            view_offset: 0,
            source,
            name: None,
            output: false,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Byte strides, innermost first.
    pub fn nb(&self) -> [usize; MAX_DIMS] {
        self.nb
    }

    pub fn src(&self, i: usize) -> Option<NodeId> {
        self.src.get(i).copied().flatten()
    }

    pub fn sources(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.src.iter().flatten().copied()
    }

    /// The node whose memory this one aliases, with the byte offset into it.
    pub fn view_of(&self) -> Option<(NodeId, usize)> {
        self.view_src.map(|v| (v, self.view_offset))
    }

    pub fn source(&self) -> TensorSource {
        self.source
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn is_input(&self) -> bool {
        self.source == TensorSource::Input
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn is_contiguous(&self) -> bool {
        self.nb == self.shape.strides(self.dtype)
    }

    /// Bytes spanned by the tensor given its strides.
    pub fn nbytes(&self) -> usize {
        let ne = self.shape.ne();
        let blck = self.dtype.block_size();
        let mut bytes = ne[0] / blck * self.nb[0];
        for i in 1..MAX_DIMS {
            bytes += ne[i].saturating_sub(1) * self.nb[i];
        }
        bytes
    }
}
