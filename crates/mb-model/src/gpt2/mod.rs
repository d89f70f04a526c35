//! GPT-2 text generator: legacy GGML file loader and inference graph.

pub mod graph;
pub mod hparams;
pub mod vocab;

pub use graph::{build_graph, Gpt2GraphParams, GPT2_MAX_NODES};
pub use hparams::Gpt2Hparams;
pub use vocab::Gpt2Vocab;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use mb_graph::{
    select_backend, BackendKind, ComputeBackend, ComputeGraph, DType, Shape, TensorLayout,
    WeightStore,
};

use crate::error::{ModelError, Result};
use crate::family::ModelFamily;
use crate::legacy::{LegacyFile, LegacyRecord};

pub const WTE: &str = "model/wte";
pub const WPE: &str = "model/wpe";
pub const LM_HEAD: &str = "model/lm_head";
pub const LN_F_G: &str = "model/ln_f/g";
pub const LN_F_B: &str = "model/ln_f/b";
pub const MEMORY_K: &str = "memory_k";
pub const MEMORY_V: &str = "memory_v";

/// Name of a per-layer tensor, e.g. `model/h3/attn/c_attn/w`.
pub fn layer_tensor(il: usize, suffix: &str) -> String {
    format!("model/h{}/{}", il, suffix)
}

/// Load-time parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gpt2Params {
    /// Key/value memory length. `0` uses the model's trained context; larger
    /// values are clamped to it.
    pub n_ctx: usize,
    /// Layers to offload to an accelerator. Any non-zero value requests
    /// Metal, falling back to CPU when unavailable.
    pub n_gpu_layers: usize,
}

/// A loaded GPT-2 model with its key/value memory.
#[derive(Debug)]
pub struct Gpt2Model {
    pub hparams: Gpt2Hparams,
    pub vocab: Gpt2Vocab,
    /// Model weights plus `memory_k` / `memory_v`.
    pub weights: WeightStore,
    /// Effective key/value memory length.
    pub n_ctx: usize,
    pub backend: Arc<dyn ComputeBackend>,
}

/// Every weight the file must provide, with its expected type and extent,
/// listed lazily so a corrupt layer count costs nothing up front.
pub(crate) fn expected_tensors(
    hp: &Gpt2Hparams,
    with_lm_head: bool,
) -> Result<impl Iterator<Item = (String, DType, Shape)>> {
    let wtype = hp.wtype()?;
    let e = hp.n_embd;
    let f32 = DType::F32;

    let mut globals = vec![
        (LN_F_G.to_string(), f32, Shape::new(&[e])),
        (LN_F_B.to_string(), f32, Shape::new(&[e])),
        (WTE.to_string(), wtype, Shape::new(&[e, hp.n_vocab])),
        (WPE.to_string(), f32, Shape::new(&[e, hp.n_ctx])),
    ];
    if with_lm_head {
        globals.push((LM_HEAD.to_string(), wtype, Shape::new(&[e, hp.n_vocab])));
    }
    let layers = (0..hp.n_layer).flat_map(move |il| {
        [
            ("ln_1/g", f32, Shape::new(&[e])),
            ("ln_1/b", f32, Shape::new(&[e])),
            ("ln_2/g", f32, Shape::new(&[e])),
            ("ln_2/b", f32, Shape::new(&[e])),
            ("attn/c_attn/w", wtype, Shape::new(&[e, 3 * e])),
            ("attn/c_attn/b", f32, Shape::new(&[3 * e])),
            ("attn/c_proj/w", wtype, Shape::new(&[e, e])),
            ("attn/c_proj/b", f32, Shape::new(&[e])),
            ("mlp/c_fc/w", wtype, Shape::new(&[e, 4 * e])),
            ("mlp/c_fc/b", f32, Shape::new(&[4 * e])),
            ("mlp/c_proj/w", wtype, Shape::new(&[4 * e, e])),
            ("mlp/c_proj/b", f32, Shape::new(&[e])),
        ]
        .into_iter()
        .map(move |(suffix, dtype, shape)| (layer_tensor(il, suffix), dtype, shape))
    });
    Ok(globals.into_iter().chain(layers))
}

fn choose_backend(n_gpu_layers: usize) -> Result<Arc<dyn ComputeBackend>> {
    if n_gpu_layers > 0 {
        match select_backend(BackendKind::Metal) {
            Ok(backend) => return Ok(backend),
            Err(e) => warn!(error = %e, "accelerator unavailable, using CPU"),
        }
    }
    Ok(select_backend(BackendKind::Cpu)?)
}

impl Gpt2Model {
    /// Load a GPT-2 model from a legacy GGML file.
    pub fn load(path: &Path, params: &Gpt2Params) -> Result<Gpt2Model> {
        let file = LegacyFile::open(path)?;
        let mut cursor = file.cursor()?;
        let hparams = Gpt2Hparams::read(&mut cursor)?;
        let vocab = Gpt2Vocab::read(&mut cursor, hparams.n_vocab)?;

        let mut records: HashMap<&str, LegacyRecord<'_>> = HashMap::new();
        while let Some(record) = cursor.next_record()? {
            if records.insert(record.name, record.clone()).is_some() {
                return Err(ModelError::Corrupt(format!(
                    "tensor '{}' appears twice",
                    record.name
                )));
            }
        }

        let has_lm_head = records.contains_key(LM_HEAD);
        // Every listed tensor matches a distinct record, so this never
        // outgrows the file.
        let mut expected = Vec::with_capacity(records.len());
        for (name, dtype, shape) in expected_tensors(&hparams, has_lm_head)? {
            let record = records
                .get(name.as_str())
                .ok_or_else(|| ModelError::TensorNotFound(name.clone()))?;
            if record.shape != shape || record.dtype != dtype {
                return Err(ModelError::TensorShape {
                    name,
                    expected: format!("{} {}", dtype, shape),
                    got: format!("{} {}", record.dtype, record.shape),
                });
            }
            expected.push((name, dtype, shape));
        }
        if records.len() != expected.len() {
            let unknown = records
                .keys()
                .find(|k| !expected.iter().any(|(n, _, _)| n.as_str() == **k))
                .map_or_else(String::new, |k| k.to_string());
            return Err(ModelError::Corrupt(format!("unknown tensor '{}'", unknown)));
        }

        let n_ctx = match params.n_ctx {
            0 => hparams.n_ctx,
            n if n > hparams.n_ctx => {
                warn!(
                    requested = n,
                    trained = hparams.n_ctx,
                    "n_ctx exceeds the model's context, clamping"
                );
                hparams.n_ctx
            }
            n => n,
        };

        let backend = choose_backend(params.n_gpu_layers)?;

        let mut weights = WeightStore::new();
        let mut layout = TensorLayout::new(backend.alignment());
        for (name, dtype, shape) in &expected {
            layout.push(name.clone(), *dtype, *shape)?;
        }
        let weight_bytes = layout.size();
        let ids = weights.allocate(layout, backend.as_ref())?;
        for ((name, _, _), id) in expected.iter().zip(ids) {
            if let Some(record) = records.get(name.as_str()) {
                weights.data_mut(id).copy_from_slice(record.data);
            }
        }
        if !has_lm_head {
            weights.alias(LM_HEAD, WTE)?;
        }

        let n_mem = hparams
            .n_layer
            .checked_mul(n_ctx)
            .and_then(|v| v.checked_mul(hparams.n_embd))
            .ok_or_else(|| ModelError::InvalidHparams("key/value memory too large".to_string()))?;
        let mut memory = TensorLayout::new(backend.alignment());
        memory.push(MEMORY_K, DType::F32, Shape::new(&[n_mem]))?;
        memory.push(MEMORY_V, DType::F32, Shape::new(&[n_mem]))?;
        let memory_bytes = memory.size();
        weights.allocate(memory, backend.as_ref())?;

        info!(
            backend = backend.name(),
            n_vocab = hparams.n_vocab,
            n_embd = hparams.n_embd,
            n_head = hparams.n_head,
            n_layer = hparams.n_layer,
            n_ctx,
            weight_bytes,
            memory_bytes,
            "loaded GPT-2 model"
        );

        Ok(Gpt2Model {
            hparams,
            vocab,
            weights,
            n_ctx,
            backend,
        })
    }
}

/// GPT-2 text generator family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gpt2;

impl ModelFamily for Gpt2 {
    const NAME: &'static str = "gpt2";
    type Params = Gpt2Params;
    type GraphParams = Gpt2GraphParams;
    type Container = Gpt2Model;

    fn load(path: &Path, params: &Gpt2Params) -> Result<Gpt2Model> {
        Gpt2Model::load(path, params)
    }

    fn build_graph<'a>(
        container: &'a mut Gpt2Model,
        params: &Gpt2GraphParams,
    ) -> Result<ComputeGraph<'a>> {
        build_graph(container, params)
    }
}
