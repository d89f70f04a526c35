//! YOLOv3-tiny object detector: GGUF loader, scratch arena and graph.
//!
//! The detector builds its graphs inside an arena owned by its container, so
//! repeated graph calls reuse the same metadata storage.

pub mod graph;

pub use graph::build_graph;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use mb_graph::{
    select_backend, BackendKind, ComputeBackend, ComputeGraph, ContextParams, DType,
    GraphContext, Shape, WeightStore,
};

use crate::error::{ModelError, Result};
use crate::family::ModelFamily;
use crate::gguf::GgufFile;

/// Convolution layers in YOLOv3-tiny.
pub const YOLO_N_LAYERS: usize = 13;

/// Layers without batch normalization; their output feeds a detection head
/// and is left linear.
const LINEAR_LAYERS: [usize; 2] = [9, 12];

pub const DEFAULT_INPUT_SIZE: usize = 416;
/// Largest accepted input width or height.
pub const MAX_INPUT_SIZE: usize = 1 << 16;
pub const KEY_WIDTH: &str = "yolo.width";
pub const KEY_HEIGHT: &str = "yolo.height";

/// Tensor name for field `what` of layer `il`, e.g. `l3_weights`.
pub fn layer_tensor(il: usize, what: &str) -> String {
    format!("l{}_{}", il, what)
}

/// One convolution with its optional batch normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvLayer {
    pub index: usize,
    pub kernel: usize,
    pub in_channels: usize,
    pub filters: usize,
    pub padding: usize,
    pub batch_normalize: bool,
    pub activate: bool,
}

impl ConvLayer {
    pub fn weights(&self) -> String {
        layer_tensor(self.index, "weights")
    }

    pub fn biases(&self) -> String {
        layer_tensor(self.index, "biases")
    }

    pub fn scales(&self) -> String {
        layer_tensor(self.index, "scales")
    }

    pub fn rolling_mean(&self) -> String {
        layer_tensor(self.index, "rolling_mean")
    }

    pub fn rolling_variance(&self) -> String {
        layer_tensor(self.index, "rolling_variance")
    }
}

/// Input geometry, layer descriptors and weights of a loaded detector.
#[derive(Debug)]
pub struct YoloModel {
    pub width: usize,
    pub height: usize,
    pub layers: Vec<ConvLayer>,
    pub weights: WeightStore,
}

impl YoloModel {
    pub fn load(path: &Path, backend: &dyn ComputeBackend) -> Result<YoloModel> {
        let file = GgufFile::open(path)?;
        let width = file.metadata.get_usize_or(KEY_WIDTH, DEFAULT_INPUT_SIZE)?;
        let height = file.metadata.get_usize_or(KEY_HEIGHT, DEFAULT_INPUT_SIZE)?;
        let in_range = |n: usize| (1..=MAX_INPUT_SIZE).contains(&n);
        let input = Shape::new(&[width, height, 3, 1]);
        if !in_range(width) || !in_range(height) || input.checked_nbytes(DType::F32).is_none() {
            return Err(ModelError::InvalidHparams(format!(
                "input size {}x{}, each side must be in 1..={}",
                width, height, MAX_INPUT_SIZE
            )));
        }

        let weights = file.load_weights(backend)?;
        let layers = (0..YOLO_N_LAYERS)
            .map(|il| describe_layer(&weights, il))
            .collect::<Result<Vec<_>>>()?;

        info!(
            backend = backend.name(),
            width,
            height,
            n_layers = layers.len(),
            bytes = weights.buffer_bytes(),
            "loaded YOLO model"
        );
        Ok(YoloModel {
            width,
            height,
            layers,
            weights,
        })
    }
}

fn describe_layer(weights: &WeightStore, il: usize) -> Result<ConvLayer> {
    let name = layer_tensor(il, "weights");
    let w = weights
        .by_name(&name)
        .ok_or_else(|| ModelError::TensorNotFound(name.clone()))?;
    let ne = w.shape().ne();
    if ne[0] != ne[1] || ne[0] % 2 == 0 {
        return Err(ModelError::TensorShape {
            name,
            expected: "an odd square kernel".to_string(),
            got: w.shape().to_string(),
        });
    }
    let batch_normalize = !LINEAR_LAYERS.contains(&il);
    let layer = ConvLayer {
        index: il,
        kernel: ne[0],
        in_channels: ne[2],
        filters: ne[3],
        padding: ne[0] / 2,
        batch_normalize,
        activate: batch_normalize,
    };

    let mut per_channel = vec![layer.biases()];
    if batch_normalize {
        per_channel.extend([layer.scales(), layer.rolling_mean(), layer.rolling_variance()]);
    }
    for name in per_channel {
        let t = weights
            .by_name(&name)
            .ok_or_else(|| ModelError::TensorNotFound(name.clone()))?;
        if t.shape().numel() != layer.filters || t.shape().dim(2) != layer.filters {
            return Err(ModelError::TensorShape {
                name,
                expected: format!("[1, 1, {}]", layer.filters),
                got: t.shape().to_string(),
            });
        }
    }
    Ok(layer)
}

/// Load-time parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YoloParams {
    pub backend: BackendKind,
}

/// Everything a live detector owns.
///
/// Fields drop in declaration order: the arena goes first, then the model,
/// then the backend its buffers came from.
pub struct YoloContainer {
    pub arena: GraphContext,
    pub model: YoloModel,
    pub backend: Arc<dyn ComputeBackend>,
}

impl std::fmt::Debug for YoloContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoloContainer")
            .field("arena_capacity", &self.arena.tensor_capacity())
            .field("model", &self.model)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl YoloContainer {
    /// Select the backend, load the model, then size the arena for one graph.
    pub fn load(path: &Path, params: &YoloParams) -> Result<YoloContainer> {
        let backend = select_backend(params.backend)?;
        let model = YoloModel::load(path, backend.as_ref())?;
        let mut arena = GraphContext::new(ContextParams::default())?;
        // Reject layer geometry that cannot form a graph.
        build_graph(&mut arena, &model)?;
        arena.reset();
        debug!(
            mem_size = arena.params().mem_size,
            capacity = arena.tensor_capacity(),
            "allocated YOLO graph arena"
        );
        Ok(YoloContainer {
            arena,
            model,
            backend,
        })
    }
}

/// YOLOv3-tiny detector family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Yolo;

impl ModelFamily for Yolo {
    const NAME: &'static str = "yolo";
    type Params = YoloParams;
    type GraphParams = ();
    type Container = YoloContainer;

    fn load(path: &Path, params: &YoloParams) -> Result<YoloContainer> {
        YoloContainer::load(path, params)
    }

    fn build_graph<'a>(container: &'a mut YoloContainer, _params: &()) -> Result<ComputeGraph<'a>> {
        build_graph(&mut container.arena, &container.model)
    }
}
