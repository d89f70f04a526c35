use std::borrow::Cow;

use crate::context::{ContextParams, GraphContext};
use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::op::{Op, PoolOp};
use crate::shape::Shape;
use crate::tensor::{NodeId, TensorNode, TensorSource};
use crate::weights::{WeightStore, WeightTensor};

enum ContextSlot<'a> {
    Owned(GraphContext),
    Borrowed(&'a mut GraphContext),
}

impl ContextSlot<'_> {
    fn get(&self) -> &GraphContext {
        match self {
            ContextSlot::Owned(c) => c,
            ContextSlot::Borrowed(c) => c,
        }
    }

    fn get_mut(&mut self) -> &mut GraphContext {
        match self {
            ContextSlot::Owned(c) => c,
            ContextSlot::Borrowed(c) => c,
        }
    }
}

/// Records tensor operations into a [`GraphContext`] and orders them into a
/// [`ComputeGraph`].
///
/// Every op checks its operands' shapes and computes the result extent; no
/// data is touched. Weights are referenced by id from the builder's
/// [`WeightStore`].
pub struct GraphBuilder<'a> {
    ctx: ContextSlot<'a>,
    weights: &'a WeightStore,
}

impl<'a> GraphBuilder<'a> {
    /// Build into a fresh context owned by the resulting graph.
    pub fn new(params: ContextParams, weights: &'a WeightStore) -> Result<Self> {
        Ok(GraphBuilder {
            ctx: ContextSlot::Owned(GraphContext::new(params)?),
            weights,
        })
    }

    /// Build into an existing arena. The arena is reset first; the resulting
    /// graph borrows it.
    pub fn in_context(ctx: &'a mut GraphContext, weights: &'a WeightStore) -> Self {
        ctx.reset();
        GraphBuilder {
            ctx: ContextSlot::Borrowed(ctx),
            weights,
        }
    }

    pub fn weights(&self) -> &'a WeightStore {
        self.weights
    }

    pub fn node(&self, id: NodeId) -> Result<&TensorNode> {
        self.ctx
            .get()
            .tensor(id)
            .ok_or(GraphError::InvalidNode(id.0))
    }

    pub fn shape(&self, id: NodeId) -> Result<Shape> {
        Ok(self.node(id)?.shape)
    }

    fn push(&mut self, node: TensorNode) -> Result<NodeId> {
        self.ctx.get_mut().push_tensor(node)
    }

    fn computed(&mut self, op: Op, shape: Shape, src: [Option<NodeId>; 2]) -> Result<NodeId> {
        let mut node = TensorNode::new(op, DType::F32, shape, TensorSource::Computed)?;
        node.src = src;
        self.push(node)
    }

    fn unary(&mut self, op: Op, a: NodeId) -> Result<NodeId> {
        let shape = self.shape(a)?;
        self.computed(op, shape, [Some(a), None])
    }

    fn binary(&mut self, op: Op, a: NodeId, b: NodeId) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let sb = self.shape(b)?;
        if !sb.can_repeat_onto(&sa) {
            return Err(GraphError::ShapeMismatch {
                op: op.name(),
                a: sa,
                b: sb,
            });
        }
        self.computed(op, sa, [Some(a), Some(b)])
    }

    /// A node aliasing `a`'s memory at `offset` bytes with the given extent
    /// and strides.
    fn view_node(
        &mut self,
        op: Op,
        a: NodeId,
        shape: Shape,
        nb: [usize; 4],
        offset: usize,
        src1: Option<NodeId>,
    ) -> Result<NodeId> {
        let parent = self.node(a)?;
        let (root, base) = match parent.view_src {
            Some(root) => (root, parent.view_offset),
            None => (a, 0),
        };
        let mut node = TensorNode::new(op, parent.dtype, shape, TensorSource::Computed)?;
        node.nb = nb;
        node.src = [Some(a), src1];
        node.view_src = Some(root);
        node.view_offset = base + offset;
        self.push(node)
    }

    /// A caller-filled graph input.
    pub fn input(&mut self, name: &'static str, dtype: DType, shape: Shape) -> Result<NodeId> {
        let mut node = TensorNode::new(Op::None, dtype, shape, TensorSource::Input)?;
        node.name = Some(name);
        self.push(node)
    }

    /// A scratch tensor with no producer, e.g. the destination of a copy.
    pub fn new_tensor(&mut self, dtype: DType, shape: Shape) -> Result<NodeId> {
        self.push(TensorNode::new(Op::None, dtype, shape, TensorSource::Computed)?)
    }

    /// A leaf referencing the weight stored under `name`.
    pub fn weight(&mut self, name: &str) -> Result<NodeId> {
        let id = self
            .weights
            .id(name)
            .ok_or_else(|| GraphError::UnknownWeight(name.to_string()))?;
        let (dtype, shape) = match self.weights.get(id) {
            Some(t) => (t.dtype(), *t.shape()),
            None => return Err(GraphError::UnknownWeight(name.to_string())),
        };
        self.push(TensorNode::new(Op::None, dtype, shape, TensorSource::Weight(id))?)
    }

    pub fn set_name(&mut self, id: NodeId, name: &'static str) -> Result<()> {
        let node = self
            .ctx
            .get_mut()
            .tensors
            .get_mut(id.0)
            .ok_or(GraphError::InvalidNode(id.0))?;
        node.name = Some(name);
        Ok(())
    }

    /// Rows of `a` selected by the I32 indices in `b`.
    pub fn get_rows(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let ib = self.node(b)?;
        if ib.dtype != DType::I32 {
            return Err(GraphError::UnsupportedDType {
                op: "GET_ROWS",
                dtype: ib.dtype.to_string(),
            });
        }
        let sb = ib.shape;
        let shape = Shape::new(&[sa.dim(0), sb.dim(0), sb.dim(1), sb.dim(2)]);
        self.computed(Op::GetRows, shape, [Some(a), Some(b)])
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Op::Add, a, b)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Op::Sub, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Op::Mul, a, b)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Op::Div, a, b)
    }

    pub fn sqrt(&mut self, a: NodeId) -> Result<NodeId> {
        self.unary(Op::Sqrt, a)
    }

    pub fn scale(&mut self, a: NodeId, s: f32) -> Result<NodeId> {
        self.unary(Op::Scale(s), a)
    }

    /// Normalize each row to zero mean and unit variance.
    pub fn norm(&mut self, a: NodeId, eps: f32) -> Result<NodeId> {
        self.unary(Op::Norm { eps }, a)
    }

    pub fn gelu(&mut self, a: NodeId) -> Result<NodeId> {
        self.unary(Op::Gelu, a)
    }

    pub fn leaky_relu(&mut self, a: NodeId, slope: f32) -> Result<NodeId> {
        self.unary(Op::LeakyRelu { slope }, a)
    }

    pub fn soft_max(&mut self, a: NodeId) -> Result<NodeId> {
        self.unary(Op::SoftMax, a)
    }

    /// Set every element above the diagonal shifted by `n_past` to -inf.
    pub fn diag_mask_inf(&mut self, a: NodeId, n_past: usize) -> Result<NodeId> {
        self.unary(Op::DiagMaskInf { n_past }, a)
    }

    /// `a` is `[k, m]`, `b` is `[k, n, ...]`; the result is `[m, n, ...]`.
    pub fn mul_mat(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let sb = self.shape(b)?;
        if sa.dim(0) != sb.dim(0) || sb.dim(2) % sa.dim(2) != 0 || sb.dim(3) % sa.dim(3) != 0 {
            return Err(GraphError::ShapeMismatch {
                op: "MUL_MAT",
                a: sa,
                b: sb,
            });
        }
        let shape = Shape::new(&[sa.dim(1), sb.dim(1), sb.dim(2), sb.dim(3)]);
        self.computed(Op::MulMat, shape, [Some(a), Some(b)])
    }

    pub fn view_1d(&mut self, a: NodeId, ne0: usize, offset: usize) -> Result<NodeId> {
        let dtype = self.node(a)?.dtype;
        let shape = Shape::new(&[ne0]);
        let nb = shape
            .checked_strides(dtype)
            .ok_or_else(|| GraphError::TensorTooLarge {
                shape,
                dtype: dtype.to_string(),
            })?;
        self.checked_view(a, shape, nb, offset)
    }

    pub fn view_2d(
        &mut self,
        a: NodeId,
        ne0: usize,
        ne1: usize,
        nb1: usize,
        offset: usize,
    ) -> Result<NodeId> {
        let dtype = self.node(a)?.dtype;
        let shape = Shape::new(&[ne0, ne1]);
        let nb2 = nb1.checked_mul(ne1).ok_or_else(|| GraphError::TensorTooLarge {
            shape,
            dtype: dtype.to_string(),
        })?;
        let nb = [dtype.type_size(), nb1, nb2, nb2];
        self.checked_view(a, shape, nb, offset)
    }

    fn checked_view(
        &mut self,
        a: NodeId,
        shape: Shape,
        nb: [usize; 4],
        offset: usize,
    ) -> Result<NodeId> {
        let parent = self.node(a)?;
        let size = parent.nbytes();
        let dtype = parent.dtype;
        let ne = shape.ne();
        // Bytes spanned by the view, as in `TensorNode::nbytes`.
        let len = (ne[0] / dtype.block_size())
            .checked_mul(nb[0])
            .and_then(|first| {
                (1..4).try_fold(first, |acc, i| {
                    ne[i].saturating_sub(1).checked_mul(nb[i])?.checked_add(acc)
                })
            });
        match len.and_then(|len| offset.checked_add(len).map(|end| (len, end))) {
            Some((_, end)) if end <= size => {}
            Some((len, _)) => return Err(GraphError::ViewOutOfBounds { offset, len, size }),
            None => {
                return Err(GraphError::TensorTooLarge {
                    shape,
                    dtype: dtype.to_string(),
                })
            }
        }
        self.view_node(Op::View, a, shape, nb, offset, None)
    }

    /// Reinterpret a contiguous tensor with a new extent of equal size.
    pub fn reshape(&mut self, a: NodeId, shape: Shape) -> Result<NodeId> {
        let parent = self.node(a)?;
        if !parent.is_contiguous() {
            return Err(GraphError::NotContiguous {
                op: "RESHAPE",
                shape: parent.shape,
            });
        }
        if parent.shape.numel() != shape.numel() {
            return Err(GraphError::ShapeMismatch {
                op: "RESHAPE",
                a: parent.shape,
                b: shape,
            });
        }
        let nb = shape.strides(parent.dtype);
        self.view_node(Op::Reshape, a, shape, nb, 0, None)
    }

    pub fn reshape_2d(&mut self, a: NodeId, ne0: usize, ne1: usize) -> Result<NodeId> {
        self.reshape(a, Shape::new(&[ne0, ne1]))
    }

    pub fn reshape_3d(&mut self, a: NodeId, ne0: usize, ne1: usize, ne2: usize) -> Result<NodeId> {
        self.reshape(a, Shape::new(&[ne0, ne1, ne2]))
    }

    /// Move source dimension `i` to position `axes[i]`.
    pub fn permute(&mut self, a: NodeId, axes: [usize; 4]) -> Result<NodeId> {
        self.permute_as(Op::Permute(axes), a, axes)
    }

    /// Swap the two innermost dimensions.
    pub fn transpose(&mut self, a: NodeId) -> Result<NodeId> {
        self.permute_as(Op::Transpose, a, [1, 0, 2, 3])
    }

    fn permute_as(&mut self, op: Op, a: NodeId, axes: [usize; 4]) -> Result<NodeId> {
        let mut seen = [false; 4];
        for &ax in &axes {
            if ax >= 4 || seen[ax] {
                return Err(GraphError::InvalidPermutation(axes));
            }
            seen[ax] = true;
        }
        let parent = self.node(a)?;
        let src_ne = parent.shape.ne();
        let src_nb = parent.nb;
        let mut ne = [1; 4];
        let mut nb = [0; 4];
        for i in 0..4 {
            ne[axes[i]] = src_ne[i];
            nb[axes[i]] = src_nb[i];
        }
        self.view_node(op, a, Shape::from_ne(ne), nb, 0, None)
    }

    /// Contiguous copy of a possibly strided tensor.
    pub fn cont(&mut self, a: NodeId) -> Result<NodeId> {
        self.unary(Op::Cont, a)
    }

    /// Copy `a` into `b`; the result aliases `b`.
    pub fn cpy(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let dst = self.node(b)?;
        if sa.numel() != dst.shape.numel() {
            return Err(GraphError::ShapeMismatch {
                op: "CPY",
                a: sa,
                b: dst.shape,
            });
        }
        let (shape, nb) = (dst.shape, dst.nb);
        let id = self.view_node(Op::Cpy, b, shape, nb, 0, None)?;
        // Sources are (value, destination).
        let node = &mut self.ctx.get_mut().tensors[id.0];
        node.src = [Some(a), Some(b)];
        Ok(id)
    }

    /// 2-d convolution of `input` `[W, H, C, N]` with `kernel` `[KW, KH, C, OC]`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv_2d(
        &mut self,
        kernel: NodeId,
        input: NodeId,
        s0: usize,
        s1: usize,
        p0: usize,
        p1: usize,
        d0: usize,
        d1: usize,
    ) -> Result<NodeId> {
        let sk = self.shape(kernel)?;
        let si = self.shape(input)?;
        let mismatch = || GraphError::ShapeMismatch {
            op: "CONV_2D",
            a: sk,
            b: si,
        };
        if sk.dim(2) != si.dim(2) || s0 == 0 || s1 == 0 {
            return Err(mismatch());
        }
        let ow = conv_output_size(si.dim(0), sk.dim(0), s0, p0, d0).ok_or_else(mismatch)?;
        let oh = conv_output_size(si.dim(1), sk.dim(1), s1, p1, d1).ok_or_else(mismatch)?;
        let shape = Shape::new(&[ow, oh, sk.dim(3), si.dim(3)]);
        let op = Op::Conv2d {
            s0,
            s1,
            p0,
            p1,
            d0,
            d1,
        };
        self.computed(op, shape, [Some(kernel), Some(input)])
    }

    pub fn pool_1d(
        &mut self,
        a: NodeId,
        op: PoolOp,
        k0: usize,
        s0: usize,
        p0: usize,
    ) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let ow = pool_output_size(sa.dim(0), k0, s0, p0 as f32).ok_or(GraphError::ShapeMismatch {
            op: "POOL_1D",
            a: sa,
            b: Shape::new(&[k0]),
        })?;
        let shape = Shape::new(&[ow, sa.dim(1), sa.dim(2), sa.dim(3)]);
        self.computed(Op::Pool1d { op, k0, s0, p0 }, shape, [Some(a), None])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pool_2d(
        &mut self,
        a: NodeId,
        op: PoolOp,
        k0: usize,
        k1: usize,
        s0: usize,
        s1: usize,
        p0: f32,
        p1: f32,
    ) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let mismatch = || GraphError::ShapeMismatch {
            op: "POOL_2D",
            a: sa,
            b: Shape::new(&[k0, k1]),
        };
        let ow = pool_output_size(sa.dim(0), k0, s0, p0).ok_or_else(mismatch)?;
        let oh = pool_output_size(sa.dim(1), k1, s1, p1).ok_or_else(mismatch)?;
        let shape = Shape::new(&[ow, oh, sa.dim(2), sa.dim(3)]);
        let op = Op::Pool2d {
            op,
            k0,
            k1,
            s0,
            s1,
            p0,
            p1,
        };
        self.computed(op, shape, [Some(a), None])
    }

    /// Nearest-neighbour upscale of the two innermost dimensions.
    pub fn upscale(&mut self, a: NodeId, factor: usize) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let ne = sa.ne();
        let (Some(w), Some(h)) = (ne[0].checked_mul(factor), ne[1].checked_mul(factor)) else {
            return Err(GraphError::TensorTooLarge {
                shape: sa,
                dtype: DType::F32.to_string(),
            });
        };
        let shape = Shape::new(&[w, h, ne[2], ne[3]]);
        self.computed(Op::Upscale { factor }, shape, [Some(a), None])
    }

    /// Join `a` and `b` along `dim`; all other extents must match.
    pub fn concat(&mut self, a: NodeId, b: NodeId, dim: usize) -> Result<NodeId> {
        let sa = self.shape(a)?;
        let sb = self.shape(b)?;
        let compatible = dim < 4 && (0..4).all(|i| i == dim || sa.dim(i) == sb.dim(i));
        if !compatible {
            return Err(GraphError::ShapeMismatch {
                op: "CONCAT",
                a: sa,
                b: sb,
            });
        }
        let mut ne = sa.ne();
        ne[dim] += sb.dim(dim);
        self.computed(Op::Concat { dim }, Shape::from_ne(ne), [Some(a), Some(b)])
    }

    /// Add `id` and its dependencies to the graph without marking it as an
    /// output, e.g. for side-effecting copies into a cache.
    pub fn expand(&mut self, id: NodeId) -> Result<()> {
        let ctx = self.ctx.get_mut();
        ctx.begin_graph()?;
        ctx.expand(id)
    }

    /// Mark `outputs`, order everything they depend on and hand out the graph.
    pub fn build(mut self, outputs: &[NodeId]) -> Result<ComputeGraph<'a>> {
        for &out in outputs {
            let node = self
                .ctx
                .get_mut()
                .tensors
                .get_mut(out.0)
                .ok_or(GraphError::InvalidNode(out.0))?;
            node.output = true;
            self.expand(out)?;
        }
        let ctx = match self.ctx {
            ContextSlot::Owned(c) => Cow::Owned(c),
            ContextSlot::Borrowed(c) => Cow::Borrowed(&*c),
        };
        Ok(ComputeGraph {
            ctx,
            weights: self.weights,
        })
    }
}

fn conv_output_size(ins: usize, ks: usize, s: usize, p: usize, d: usize) -> Option<usize> {
    let span = d.checked_mul(ks.checked_sub(1)?)?.checked_add(1)?;
    let padded = p.checked_mul(2)?.checked_add(ins)?;
    let room = padded.checked_sub(span)?;
    Some(room / s + 1)
}

fn pool_output_size(ins: usize, ks: usize, s: usize, p: f32) -> Option<usize> {
    if s == 0 {
        return None;
    }
    let room = ins as f32 + 2.0 * p - ks as f32;
    if room < 0.0 {
        return None;
    }
    Some((room / s as f32) as usize + 1)
}

/// An ordered computation graph over a model's weights.
///
/// Either owns its metadata arena or borrows one from a longer-lived
/// container; in both cases it borrows the weight store, so it cannot outlive
/// the model it was built from.
pub struct ComputeGraph<'a> {
    ctx: Cow<'a, GraphContext>,
    weights: &'a WeightStore,
}

impl<'a> ComputeGraph<'a> {
    /// Number of computed nodes.
    pub fn n_nodes(&self) -> usize {
        self.ctx.nodes.len()
    }

    /// Number of leafs (inputs, weights, scratch destinations).
    pub fn n_leafs(&self) -> usize {
        self.ctx.leafs.len()
    }

    /// Computed nodes in execution order.
    pub fn nodes(&self) -> impl Iterator<Item = &TensorNode> + '_ {
        self.ctx.nodes.iter().map(|id| &self.ctx.tensors[id.0])
    }

    pub fn leafs(&self) -> impl Iterator<Item = &TensorNode> + '_ {
        self.ctx.leafs.iter().map(|id| &self.ctx.tensors[id.0])
    }

    pub fn inputs(&self) -> impl Iterator<Item = &TensorNode> + '_ {
        self.leafs().filter(|n| n.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &TensorNode> + '_ {
        self.nodes().filter(|n| n.is_output())
    }

    pub fn node(&self, id: NodeId) -> Option<&TensorNode> {
        self.ctx.tensor(id)
    }

    /// First node or leaf with the given name.
    pub fn find(&self, name: &str) -> Option<&TensorNode> {
        self.leafs()
            .chain(self.nodes())
            .find(|n| n.name() == Some(name))
    }

    pub fn weights(&self) -> &'a WeightStore {
        self.weights
    }

    /// The weight a leaf refers to, if any.
    pub fn weight_of(&self, node: &TensorNode) -> Option<&'a WeightTensor> {
        match node.source() {
            TensorSource::Weight(id) => self.weights.get(id),
            _ => None,
        }
    }

    pub fn context(&self) -> &GraphContext {
        &self.ctx
    }

    /// Metadata bytes charged in the arena for this graph.
    pub fn mem_used(&self) -> usize {
        self.ctx.used_bytes()
    }

    /// True when the graph lives in a borrowed, reusable arena.
    pub fn is_arena_backed(&self) -> bool {
        matches!(self.ctx, Cow::Borrowed(_))
    }
}
