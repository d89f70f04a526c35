//! Fixed-size arena for graph metadata.
//!
//! A [`GraphContext`] is sized once from a byte budget and holds tensor nodes
//! plus the bookkeeping of one graph. Building a graph charges
//! [`tensor_overhead`] per node and [`graph_overhead`] once; [`GraphContext::reset`]
//! rewinds the arena without releasing its storage, so rebuilding the same
//! graph reuses the same memory.

use std::mem::size_of;

use crate::error::{GraphError, Result};
use crate::tensor::{NodeId, TensorNode};

/// Node capacity of a graph when none is requested.
pub const DEFAULT_GRAPH_SIZE: usize = 2048;

/// Bookkeeping bytes charged per arena object.
pub const OBJECT_OVERHEAD: usize = 32;

/// Bytes the arena charges for one tensor node.
pub fn tensor_overhead() -> usize {
    OBJECT_OVERHEAD + size_of::<TensorNode>()
}

/// Bytes the arena charges for the structure of a graph of `size` nodes:
/// node and leaf lists plus the visited table used while ordering.
pub fn graph_overhead(size: usize) -> usize {
    let lists = 2 * size * size_of::<NodeId>();
    let visited = 2 * size * size_of::<bool>();
    OBJECT_OVERHEAD + lists + visited
}

/// Sizing of a [`GraphContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Total metadata budget in bytes.
    pub mem_size: usize,
    /// Maximum nodes (and leafs) a graph in this context may hold.
    pub graph_size: usize,
}

impl ContextParams {
    /// Budget for exactly one graph of `graph_size` nodes.
    pub fn for_graph(graph_size: usize) -> Self {
        ContextParams {
            mem_size: tensor_overhead() * graph_size + graph_overhead(graph_size),
            graph_size,
        }
    }
}

impl Default for ContextParams {
    fn default() -> Self {
        Self::for_graph(DEFAULT_GRAPH_SIZE)
    }
}

/// Metadata arena for building computation graphs.
#[derive(Debug, Clone)]
pub struct GraphContext {
    params: ContextParams,
    tensor_capacity: usize,
    used: usize,
    high_water: usize,
    pub(crate) tensors: Vec<TensorNode>,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) leafs: Vec<NodeId>,
    pub(crate) visited: Vec<bool>,
    pub(crate) stack: Vec<(NodeId, bool)>,
    graph_started: bool,
}

impl GraphContext {
    /// Reserve all arena storage up front.
    pub fn new(params: ContextParams) -> Result<Self> {
        let structure = graph_overhead(params.graph_size);
        if params.mem_size < structure {
            return Err(GraphError::ContextTooSmall {
                mem_size: params.mem_size,
                graph_size: params.graph_size,
            });
        }
        let tensor_capacity = (params.mem_size - structure) / tensor_overhead();
        Ok(GraphContext {
            params,
            tensor_capacity,
            used: 0,
            high_water: 0,
            tensors: Vec::with_capacity(tensor_capacity),
            nodes: Vec::with_capacity(params.graph_size),
            leafs: Vec::with_capacity(params.graph_size),
            visited: Vec::with_capacity(tensor_capacity),
            stack: Vec::with_capacity(params.graph_size),
            graph_started: false,
        })
    }

    pub fn params(&self) -> ContextParams {
        self.params
    }

    /// Rewind the arena. Storage is kept for the next graph.
    pub fn reset(&mut self) {
        self.tensors.clear();
        self.nodes.clear();
        self.leafs.clear();
        self.visited.clear();
        self.stack.clear();
        self.used = 0;
        self.graph_started = false;
    }

    /// Bytes charged since the last reset.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Largest `used_bytes` ever reached.
    pub fn high_water_mark(&self) -> usize {
        self.high_water
    }

    /// Number of tensor nodes the arena can hold.
    pub fn tensor_capacity(&self) -> usize {
        self.tensor_capacity
    }

    /// Bytes of backing storage actually reserved by the arena.
    pub fn reserved_bytes(&self) -> usize {
        self.tensors.capacity() * size_of::<TensorNode>()
            + (self.nodes.capacity() + self.leafs.capacity()) * size_of::<NodeId>()
            + self.visited.capacity() * size_of::<bool>()
            + self.stack.capacity() * size_of::<(NodeId, bool)>()
    }

    pub fn n_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensor(&self, id: NodeId) -> Option<&TensorNode> {
        self.tensors.get(id.0)
    }

    fn charge(&mut self, bytes: usize) -> Result<()> {
        let needed = self.used + bytes;
        if needed > self.params.mem_size {
            return Err(GraphError::OutOfMemory {
                needed,
                mem_size: self.params.mem_size,
            });
        }
        self.used = needed;
        self.high_water = self.high_water.max(self.used);
        Ok(())
    }

    pub(crate) fn push_tensor(&mut self, mut node: TensorNode) -> Result<NodeId> {
        if self.tensors.len() == self.tensor_capacity {
            return Err(GraphError::OutOfMemory {
                needed: self.used + tensor_overhead(),
                mem_size: self.params.mem_size,
            });
        }
        self.charge(tensor_overhead())?;
        let id = NodeId(self.tensors.len());
        node.id = id;
        self.tensors.push(node);
        Ok(id)
    }

    /// Charge the graph structure once per build.
    pub(crate) fn begin_graph(&mut self) -> Result<()> {
        if !self.graph_started {
            self.charge(graph_overhead(self.params.graph_size))?;
            self.graph_started = true;
        }
        Ok(())
    }

    /// Append `root` and everything it depends on to the node and leaf lists,
    /// sources before users.
    pub(crate) fn expand(&mut self, root: NodeId) -> Result<()> {
        if root.0 >= self.tensors.len() {
            return Err(GraphError::InvalidNode(root.0));
        }
        self.visited.resize(self.tensors.len(), false);
        self.stack.clear();
        self.stack.push((root, false));

        while let Some((id, expanded)) = self.stack.pop() {
            if expanded {
                let list = if self.tensors[id.0].op.is_leaf() {
                    &mut self.leafs
                } else {
                    &mut self.nodes
                };
                if list.len() == self.params.graph_size {
                    return Err(GraphError::GraphFull {
                        size: self.params.graph_size,
                    });
                }
                list.push(id);
                continue;
            }
            if self.visited[id.0] {
                continue;
            }
            self.visited[id.0] = true;
            self.stack.push((id, true));
            // Reverse so the first source is ordered first.
            for src in self.tensors[id.0].src.iter().rev().flatten() {
                if !self.visited[src.0] {
                    self.stack.push((*src, false));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::op::Op;
    use crate::shape::Shape;
    use crate::tensor::TensorSource;

    fn leaf() -> TensorNode {
        TensorNode::new(Op::None, DType::F32, Shape::new(&[4]), TensorSource::Input).unwrap()
    }

    #[test]
    fn test_default_sizing() {
        let ctx = GraphContext::new(ContextParams::default()).unwrap();
        assert_eq!(ctx.tensor_capacity(), DEFAULT_GRAPH_SIZE);
        assert_eq!(ctx.used_bytes(), 0);
    }

    #[test]
    fn test_too_small() {
        let params = ContextParams {
            mem_size: 16,
            graph_size: 8,
        };
        assert!(matches!(
            GraphContext::new(params),
            Err(GraphError::ContextTooSmall { .. })
        ));
    }

    #[test]
    fn test_out_of_memory() {
        let mut ctx = GraphContext::new(ContextParams::for_graph(2)).unwrap();
        ctx.push_tensor(leaf()).unwrap();
        ctx.push_tensor(leaf()).unwrap();
        assert!(matches!(
            ctx.push_tensor(leaf()),
            Err(GraphError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_reset_keeps_storage() {
        let mut ctx = GraphContext::new(ContextParams::for_graph(4)).unwrap();
        let reserved = ctx.reserved_bytes();
        ctx.push_tensor(leaf()).unwrap();
        ctx.push_tensor(leaf()).unwrap();
        let used = ctx.used_bytes();
        assert_eq!(used, 2 * tensor_overhead());

        ctx.reset();
        assert_eq!(ctx.used_bytes(), 0);
        assert_eq!(ctx.n_tensors(), 0);
        assert_eq!(ctx.high_water_mark(), used);
        assert_eq!(ctx.reserved_bytes(), reserved);
    }

    #[test]
    fn test_expand_orders_sources_first() {
        let mut ctx = GraphContext::new(ContextParams::for_graph(8)).unwrap();
        let a = ctx.push_tensor(leaf()).unwrap();
        let b = ctx.push_tensor(leaf()).unwrap();
        let mut add = TensorNode::new(Op::Add, DType::F32, Shape::new(&[4]), TensorSource::Computed).unwrap();
        add.src = [Some(a), Some(b)];
        let c = ctx.push_tensor(add).unwrap();
        let mut sq = TensorNode::new(Op::Sqrt, DType::F32, Shape::new(&[4]), TensorSource::Computed).unwrap();
        sq.src = [Some(c), None];
        let d = ctx.push_tensor(sq).unwrap();

        ctx.expand(d).unwrap();
        assert_eq!(ctx.leafs, vec![a, b]);
        assert_eq!(ctx.nodes, vec![c, d]);

        // Expanding again adds nothing.
        ctx.expand(d).unwrap();
        assert_eq!(ctx.nodes.len(), 2);
    }
}
