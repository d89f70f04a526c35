use mb_graph::{ComputeGraph, DType, GraphBuilder, GraphContext, NodeId, PoolOp, Shape};

use super::{ConvLayer, YoloModel};
use crate::error::Result;

const LEAKY_SLOPE: f32 = 0.1;

/// Convolution, batch normalization and activation of one layer.
fn apply_conv(b: &mut GraphBuilder<'_>, input: NodeId, layer: &ConvLayer) -> Result<NodeId> {
    let w = b.weight(&layer.weights())?;
    let p = layer.padding;
    let mut cur = b.conv_2d(w, input, 1, 1, p, p, 1, 1)?;
    if layer.batch_normalize {
        let mean = b.weight(&layer.rolling_mean())?;
        let var = b.weight(&layer.rolling_variance())?;
        let scales = b.weight(&layer.scales())?;
        cur = b.sub(cur, mean)?;
        let std = b.sqrt(var)?;
        cur = b.div(cur, std)?;
        cur = b.mul(cur, scales)?;
    }
    let biases = b.weight(&layer.biases())?;
    cur = b.add(cur, biases)?;
    if layer.activate {
        cur = b.leaky_relu(cur, LEAKY_SLOPE)?;
    }
    Ok(cur)
}

fn max_pool(b: &mut GraphBuilder<'_>, x: NodeId, stride: usize, pad: f32) -> Result<NodeId> {
    Ok(b.pool_2d(x, PoolOp::Max, 2, 2, stride, stride, pad, pad)?)
}

/// Build the detection graph inside `arena`, which is reset first.
///
/// Two outputs: the coarse head at 1/32 of the input resolution and the
/// fine head at 1/16.
pub fn build_graph<'a>(arena: &'a mut GraphContext, model: &'a YoloModel) -> Result<ComputeGraph<'a>> {
    let l = &model.layers;
    let mut b = GraphBuilder::in_context(arena, &model.weights);

    let input = b.input(
        "input",
        DType::F32,
        Shape::new(&[model.width, model.height, 3, 1]),
    )?;

    let mut cur = input;
    for layer in &l[..4] {
        cur = apply_conv(&mut b, cur, layer)?;
        cur = max_pool(&mut b, cur, 2, 0.0)?;
    }
    let route_fine = apply_conv(&mut b, cur, &l[4])?;
    cur = max_pool(&mut b, route_fine, 2, 0.0)?;
    cur = apply_conv(&mut b, cur, &l[5])?;
    // Stride 1 with half a pixel of padding keeps the extent.
    cur = max_pool(&mut b, cur, 1, 0.5)?;
    cur = apply_conv(&mut b, cur, &l[6])?;
    let route_coarse = apply_conv(&mut b, cur, &l[7])?;
    cur = apply_conv(&mut b, route_coarse, &l[8])?;
    let head_coarse = apply_conv(&mut b, cur, &l[9])?;
    b.set_name(head_coarse, "yolo_coarse")?;

    cur = apply_conv(&mut b, route_coarse, &l[10])?;
    cur = b.upscale(cur, 2)?;
    cur = b.concat(cur, route_fine, 2)?;
    cur = apply_conv(&mut b, cur, &l[11])?;
    let head_fine = apply_conv(&mut b, cur, &l[12])?;
    b.set_name(head_fine, "yolo_fine")?;

    Ok(b.build(&[head_coarse, head_fine])?)
}
