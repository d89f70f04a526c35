use mb_graph::{ComputeGraph, ContextParams, DType, GraphBuilder, NodeId, PoolOp, Shape};

use super::*;
use crate::error::Result;

/// Files classified per graph.
pub const MAGIKA_BATCH: usize = 1;

fn dense(b: &mut GraphBuilder<'_>, x: NodeId, w: &str, bias: &str) -> Result<NodeId> {
    let w = b.weight(w)?;
    let bias = b.weight(bias)?;
    let x = b.mul_mat(w, x)?;
    let x = b.add(x, bias)?;
    Ok(b.gelu(x)?)
}

fn layer_norm(b: &mut GraphBuilder<'_>, x: NodeId, eps: f32, g: &str, beta: &str) -> Result<NodeId> {
    let g = b.weight(g)?;
    let beta = b.weight(beta)?;
    let x = b.norm(x, eps)?;
    let x = b.mul(x, g)?;
    Ok(b.add(x, beta)?)
}

/// Build the classification graph for one file.
///
/// Input `input` is the one-hot encoded byte windows, `[257, 1536, 1]` for
/// the published model; output `target_label_probs` is `[n_label, 1]`.
pub fn build_graph(model: &MagikaModel) -> Result<ComputeGraph<'_>> {
    let hp = &model.hparams;
    let dims = model.dims;
    let n_files = MAGIKA_BATCH;
    let eps = hp.f_norm_eps;

    let mut b = GraphBuilder::new(ContextParams::default(), &model.weights)?;
    let input = b.input(
        "input",
        DType::F32,
        Shape::new(&[hp.n_vocab(), hp.n_tokens(), n_files]),
    )?;

    // [dense, n_tokens, n_files]
    let cur = dense(&mut b, input, DENSE_W, DENSE_B)?;

    // [seq, dense_1_in, n_files]
    let cur = b.reshape_3d(cur, dims.dense_1_in, dims.seq, n_files)?;
    let cur = b.transpose(cur)?;
    let cur = b.cont(cur)?;
    let cur = layer_norm(&mut b, cur, eps, LN_GAMMA, LN_BETA)?;

    // [dense_1, seq, n_files]
    let cur = b.transpose(cur)?;
    let cur = b.cont(cur)?;
    let cur = dense(&mut b, cur, DENSE_1_W, DENSE_1_B)?;
    let cur = dense(&mut b, cur, DENSE_2_W, DENSE_2_B)?;

    // Global max pooling over positions: [dense_2, n_files]
    let cur = b.transpose(cur)?;
    let cur = b.cont(cur)?;
    let cur = b.pool_1d(cur, PoolOp::Max, dims.seq, dims.seq, 0)?;
    let cur = b.reshape_2d(cur, dims.dense_2, n_files)?;
    let cur = layer_norm(&mut b, cur, eps, LN_1_GAMMA, LN_1_BETA)?;

    let w = b.weight(TARGET_LABEL_W)?;
    let bias = b.weight(TARGET_LABEL_B)?;
    let cur = b.mul_mat(w, cur)?;
    let cur = b.add(cur, bias)?;
    let probs = b.soft_max(cur)?;
    b.set_name(probs, "target_label_probs")?;

    Ok(b.build(&[probs])?)
}
