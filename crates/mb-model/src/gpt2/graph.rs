use mb_graph::{ComputeGraph, ContextParams, DType, GraphBuilder, NodeId, Shape};

use super::{layer_tensor, Gpt2Model, LM_HEAD, LN_F_B, LN_F_G, MEMORY_K, MEMORY_V, WPE, WTE};
use crate::error::{ModelError, Result};

/// Node capacity of a GPT-2 graph.
pub const GPT2_MAX_NODES: usize = 4096;

const NORM_EPS: f32 = 1e-5;

/// Per-call parameters of the GPT-2 graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpt2GraphParams {
    /// Tokens already held in the key/value memory.
    pub n_past: usize,
    /// Tokens processed by this graph.
    pub n_tokens: usize,
}

/// `x * g + b` with weights looked up by name.
fn affine(b: &mut GraphBuilder<'_>, x: NodeId, g: &str, bias: &str) -> Result<NodeId> {
    let g = b.weight(g)?;
    let bias = b.weight(bias)?;
    let x = b.mul(x, g)?;
    Ok(b.add(x, bias)?)
}

/// `w · x + bias`.
fn linear(b: &mut GraphBuilder<'_>, x: NodeId, w: &str, bias: &str) -> Result<NodeId> {
    let w = b.weight(w)?;
    let bias = b.weight(bias)?;
    let x = b.mul_mat(w, x)?;
    Ok(b.add(x, bias)?)
}

/// Build the forward graph for `n_tokens` new tokens after `n_past` cached
/// ones. The output `logits` is `[n_vocab, n_tokens]`.
pub fn build_graph<'a>(model: &'a Gpt2Model, params: &Gpt2GraphParams) -> Result<ComputeGraph<'a>> {
    let hp = &model.hparams;
    let n_past = params.n_past;
    let n = params.n_tokens;
    if n == 0 {
        return Err(ModelError::InvalidGraphParams(
            "n_tokens must be at least 1".to_string(),
        ));
    }
    let n_kv = n_past
        .checked_add(n)
        .filter(|&total| total <= model.n_ctx)
        .ok_or_else(|| {
            ModelError::InvalidGraphParams(format!(
                "n_past {} + n_tokens {} exceeds n_ctx {}",
                n_past, n, model.n_ctx
            ))
        })?;

    let n_embd = hp.n_embd;
    let n_head = hp.n_head;
    let head_dim = hp.head_dim();
    let n_ctx = model.n_ctx;
    let elsize = DType::F32.type_size();

    let mut b = GraphBuilder::new(ContextParams::for_graph(GPT2_MAX_NODES), &model.weights)?;

    let embd = b.input("embd", DType::I32, Shape::new(&[n]))?;
    let position = b.input("position", DType::I32, Shape::new(&[n]))?;
    let memory_k = b.weight(MEMORY_K)?;
    let memory_v = b.weight(MEMORY_V)?;

    let wte = b.weight(WTE)?;
    let wpe = b.weight(WPE)?;
    let tok = b.get_rows(wte, embd)?;
    let pos = b.get_rows(wpe, position)?;
    let mut inp_l = b.add(tok, pos)?;

    for il in 0..hp.n_layer {
        let w = |suffix: &str| layer_tensor(il, suffix);
        // Byte offset of position `p` of this layer in the key/value memory.
        let mem_offset = |p: usize| elsize * n_embd * (il * n_ctx + p);

        let cur = b.norm(inp_l, NORM_EPS)?;
        let cur = affine(&mut b, cur, &w("ln_1/g"), &w("ln_1/b"))?;

        // Fused QKV projection: [3 * n_embd, n].
        let cur = linear(&mut b, cur, &w("attn/c_attn/w"), &w("attn/c_attn/b"))?;
        let nb1 = b.node(cur)?.nb()[1];
        let q_cur = b.view_2d(cur, n_embd, n, nb1, 0)?;
        let k_cur = b.view_2d(cur, n_embd, n, nb1, elsize * n_embd)?;
        let v_cur = b.view_2d(cur, n_embd, n, nb1, 2 * elsize * n_embd)?;

        // Store this batch's keys and values at n_past.
        let k = b.view_1d(memory_k, n * n_embd, mem_offset(n_past))?;
        let v = b.view_1d(memory_v, n * n_embd, mem_offset(n_past))?;
        let store_k = b.cpy(k_cur, k)?;
        b.expand(store_k)?;
        let store_v = b.cpy(v_cur, v)?;
        b.expand(store_v)?;

        // Q: [head_dim, n, n_head]
        let q_buf = b.new_tensor(DType::F32, Shape::new(&[head_dim, n_head, n]))?;
        let q = b.cpy(q_cur, q_buf)?;
        let q = b.permute(q, [0, 2, 1, 3])?;

        // K: [head_dim, n_kv, n_head]
        let k = b.view_1d(memory_k, n_kv * n_embd, mem_offset(0))?;
        let k = b.reshape_3d(k, head_dim, n_head, n_kv)?;
        let k = b.permute(k, [0, 2, 1, 3])?;

        // KQ: [n_kv, n, n_head]
        let kq = b.mul_mat(k, q)?;
        let kq = b.scale(kq, 1.0 / (head_dim as f32).sqrt())?;
        let kq = b.diag_mask_inf(kq, n_past)?;
        let kq = b.soft_max(kq)?;

        // V transposed: [n_kv, head_dim, n_head]
        let v = b.view_1d(memory_v, n_kv * n_embd, mem_offset(0))?;
        let v = b.reshape_3d(v, head_dim, n_head, n_kv)?;
        let v = b.permute(v, [1, 2, 0, 3])?;
        let v = b.cont(v)?;

        // KQV: [head_dim, n, n_head] merged back to [n_embd, n].
        let kqv = b.mul_mat(v, kq)?;
        let merged = b.permute(kqv, [0, 2, 1, 3])?;
        let out_buf = b.new_tensor(DType::F32, Shape::new(&[n_embd, n]))?;
        let cur = b.cpy(merged, out_buf)?;

        let cur = linear(&mut b, cur, &w("attn/c_proj/w"), &w("attn/c_proj/b"))?;
        let inp_ff = b.add(cur, inp_l)?;

        let cur = b.norm(inp_ff, NORM_EPS)?;
        let cur = affine(&mut b, cur, &w("ln_2/g"), &w("ln_2/b"))?;
        let cur = linear(&mut b, cur, &w("mlp/c_fc/w"), &w("mlp/c_fc/b"))?;
        let cur = b.gelu(cur)?;
        let cur = linear(&mut b, cur, &w("mlp/c_proj/w"), &w("mlp/c_proj/b"))?;

        inp_l = b.add(cur, inp_ff)?;
    }

    let cur = b.norm(inp_l, NORM_EPS)?;
    let cur = affine(&mut b, cur, LN_F_G, LN_F_B)?;
    let lm_head = b.weight(LM_HEAD)?;
    let logits = b.mul_mat(lm_head, cur)?;
    b.set_name(logits, "logits")?;

    Ok(b.build(&[logits])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::gpt2::{Gpt2, Gpt2Params};
    use crate::ModelHandle;
    use mb_graph::{Op, TensorSource, WeightStore};

    fn tiny_handle(dir: &tempfile::TempDir, n_ctx: usize) -> ModelHandle<Gpt2> {
        let path = dir.path().join("gpt2.bin");
        fixtures::write_gpt2(&path, &fixtures::tiny_gpt2_hparams(), false).unwrap();
        let params = Gpt2Params {
            n_ctx,
            n_gpu_layers: 0,
        };
        ModelHandle::open(&path, &params).unwrap()
    }

    #[test]
    fn test_attention_over_past() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = tiny_handle(&dir, 1024);
        let hp = fixtures::tiny_gpt2_hparams();

        let g = handle
            .graph(&Gpt2GraphParams {
                n_past: 5,
                n_tokens: 1,
            })
            .unwrap();

        let masks: Vec<_> = g
            .nodes()
            .filter(|n| n.op() == &Op::DiagMaskInf { n_past: 5 })
            .collect();
        assert_eq!(masks.len(), hp.n_layer);
        for m in masks {
            assert_eq!(m.shape(), &Shape::new(&[6, 1, hp.n_head]));
        }

        let logits = g.outputs().next().unwrap();
        assert_eq!(logits.name(), Some("logits"));
        assert_eq!(logits.shape(), &Shape::new(&[hp.n_vocab, 1]));

        let inputs: Vec<_> = g.inputs().map(|n| n.name().unwrap()).collect();
        assert_eq!(inputs, vec!["embd", "position"]);
    }

    fn weights_of(g: &ComputeGraph<'_>) -> Vec<usize> {
        let mut ids: Vec<_> = g
            .leafs()
            .filter_map(|n| match n.source() {
                TensorSource::Weight(id) => Some(id.index()),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[test]
    fn test_token_count_changes_extents_not_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = tiny_handle(&dir, 0);
        let hp = fixtures::tiny_gpt2_hparams();

        let (one, store_one, ids_one) = {
            let g = handle
                .graph(&Gpt2GraphParams {
                    n_past: 0,
                    n_tokens: 1,
                })
                .unwrap();
            let out = *g.outputs().next().unwrap().shape();
            (out, g.weights() as *const WeightStore, weights_of(&g))
        };
        let g = handle
            .graph(&Gpt2GraphParams {
                n_past: 0,
                n_tokens: 4,
            })
            .unwrap();
        let four = *g.outputs().next().unwrap().shape();

        assert_eq!(one, Shape::new(&[hp.n_vocab, 1]));
        assert_eq!(four, Shape::new(&[hp.n_vocab, 4]));
        assert!(std::ptr::eq(store_one, g.weights()));
        assert_eq!(ids_one, weights_of(&g));
        assert_eq!(g.find("embd").unwrap().shape(), &Shape::new(&[4]));
    }

    #[test]
    fn test_kv_writes_land_at_n_past() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = tiny_handle(&dir, 0);
        let hp = fixtures::tiny_gpt2_hparams();
        let g = handle
            .graph(&Gpt2GraphParams {
                n_past: 3,
                n_tokens: 2,
            })
            .unwrap();

        let mem_k = g.weights().id(MEMORY_K).unwrap();
        let writes: Vec<usize> = g
            .nodes()
            .filter(|n| n.op() == &Op::Cpy)
            .filter_map(|n| {
                let (root, offset) = n.view_of()?;
                match g.node(root)?.source() {
                    TensorSource::Weight(id) if id == mem_k => Some(offset),
                    _ => None,
                }
            })
            .collect();
        let expected: Vec<usize> = (0..hp.n_layer)
            .map(|il| 4 * hp.n_embd * (il * hp.n_ctx + 3))
            .collect();
        assert_eq!(writes, expected);
    }

    #[test]
    fn test_rejects_bad_params() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = tiny_handle(&dir, 0);
        let n_ctx = fixtures::tiny_gpt2_hparams().n_ctx;

        for params in [
            Gpt2GraphParams {
                n_past: 0,
                n_tokens: 0,
            },
            Gpt2GraphParams {
                n_past: n_ctx,
                n_tokens: 1,
            },
            Gpt2GraphParams {
                n_past: usize::MAX,
                n_tokens: 1,
            },
        ] {
            assert!(matches!(
                handle.graph(&params),
                Err(ModelError::InvalidGraphParams(_))
            ));
        }
        // Filling the context exactly is fine.
        assert!(handle
            .graph(&Gpt2GraphParams {
                n_past: n_ctx - 1,
                n_tokens: 1,
            })
            .is_ok());
    }
}
