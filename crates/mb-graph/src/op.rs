/// Reduction used by pooling ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    Max,
    Avg,
}

/// The operation producing a tensor node, with its parameters.
///
/// `None` marks leafs: graph inputs and weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    None,
    GetRows,
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
    Scale(f32),
    Norm { eps: f32 },
    MulMat,
    View,
    Reshape,
    Permute([usize; 4]),
    Transpose,
    Cont,
    Cpy,
    DiagMaskInf { n_past: usize },
    SoftMax,
    Gelu,
    LeakyRelu { slope: f32 },
    Conv2d {
        s0: usize,
        s1: usize,
        p0: usize,
        p1: usize,
        d0: usize,
        d1: usize,
    },
    Pool1d {
        op: PoolOp,
        k0: usize,
        s0: usize,
        p0: usize,
    },
    Pool2d {
        op: PoolOp,
        k0: usize,
        k1: usize,
        s0: usize,
        s1: usize,
        p0: f32,
        p1: f32,
    },
    Upscale { factor: usize },
    Concat { dim: usize },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "NONE",
            Op::GetRows => "GET_ROWS",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Sqrt => "SQRT",
            Op::Scale(_) => "SCALE",
            Op::Norm { .. } => "NORM",
            Op::MulMat => "MUL_MAT",
            Op::View => "VIEW",
            Op::Reshape => "RESHAPE",
            Op::Permute(_) => "PERMUTE",
            Op::Transpose => "TRANSPOSE",
            Op::Cont => "CONT",
            Op::Cpy => "CPY",
            Op::DiagMaskInf { .. } => "DIAG_MASK_INF",
            Op::SoftMax => "SOFT_MAX",
            Op::Gelu => "GELU",
            Op::LeakyRelu { .. } => "LEAKY_RELU",
            Op::Conv2d { .. } => "CONV_2D",
            Op::Pool1d { .. } => "POOL_1D",
            Op::Pool2d { .. } => "POOL_2D",
            Op::Upscale { .. } => "UPSCALE",
            Op::Concat { .. } => "CONCAT",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::None)
    }

    /// Ops whose result aliases the memory of another node.
    pub fn is_view(&self) -> bool {
        matches!(
            self,
            Op::View | Op::Reshape | Op::Permute(_) | Op::Transpose | Op::Cpy
        )
    }
}
