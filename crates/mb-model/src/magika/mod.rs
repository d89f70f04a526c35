//! Magika file-type classifier: GGUF loader and inference graph.

pub mod graph;

pub use graph::{build_graph, MAGIKA_BATCH};

use std::path::Path;

use tracing::info;

use mb_graph::{ComputeGraph, CpuBackend, Shape, WeightStore};

use crate::error::{ModelError, Result};
use crate::family::ModelFamily;
use crate::gguf::GgufFile;

pub const DENSE_W: &str = "dense/kernel:0";
pub const DENSE_B: &str = "dense/bias:0";
pub const LN_GAMMA: &str = "layer_normalization/gamma:0";
pub const LN_BETA: &str = "layer_normalization/beta:0";
pub const DENSE_1_W: &str = "dense_1/kernel:0";
pub const DENSE_1_B: &str = "dense_1/bias:0";
pub const DENSE_2_W: &str = "dense_2/kernel:0";
pub const DENSE_2_B: &str = "dense_2/bias:0";
pub const LN_1_GAMMA: &str = "layer_normalization_1/gamma:0";
pub const LN_1_BETA: &str = "layer_normalization_1/beta:0";
pub const TARGET_LABEL_W: &str = "target_label/kernel:0";
pub const TARGET_LABEL_B: &str = "target_label/bias:0";

/// Metadata key with the label names, indexed like the output probabilities.
pub const KEY_LABELS: &str = "magika.labels";

/// Largest accepted byte window (`beg_size`, `mid_size`, `end_size`).
pub const MAX_WINDOW: usize = 1 << 20;
/// Largest accepted padding token; tokens are bytes plus one padding value.
pub const MAX_PADDING_TOKEN: usize = 1 << 16;

/// Magika hyperparameters.
///
/// The byte windows come from optional `magika.*` metadata, falling back to
/// the published model's values; layer widths come from the weights.
#[derive(Debug, Clone, PartialEq)]
pub struct MagikaHparams {
    pub beg_size: usize,
    pub mid_size: usize,
    pub end_size: usize,
    /// Token standing for "no byte here"; the one-hot width is this plus one.
    pub padding_token: usize,
    pub f_norm_eps: f32,
    pub n_label: usize,
}

impl Default for MagikaHparams {
    fn default() -> Self {
        MagikaHparams {
            beg_size: 512,
            mid_size: 512,
            end_size: 512,
            padding_token: 256,
            f_norm_eps: 0.001,
            n_label: 113,
        }
    }
}

impl MagikaHparams {
    fn from_gguf(file: &GgufFile) -> Result<MagikaHparams> {
        let d = MagikaHparams::default();
        let md = &file.metadata;
        let n_label = file
            .tensor_info(TARGET_LABEL_B)
            .ok_or_else(|| ModelError::TensorNotFound(TARGET_LABEL_B.to_string()))?
            .shape
            .dim(0);
        let f_norm_eps = if md.contains("magika.f_norm_eps") {
            md.get_f32("magika.f_norm_eps")?
        } else {
            d.f_norm_eps
        };
        let window = |key: &str, default: usize| -> Result<usize> {
            let n = md.get_usize_or(key, default)?;
            if n > MAX_WINDOW {
                return Err(ModelError::InvalidHparams(format!(
                    "{} = {} exceeds {}",
                    key, n, MAX_WINDOW
                )));
            }
            Ok(n)
        };
        let hp = MagikaHparams {
            beg_size: window("magika.beg_size", d.beg_size)?,
            mid_size: window("magika.mid_size", d.mid_size)?,
            end_size: window("magika.end_size", d.end_size)?,
            padding_token: md.get_usize_or("magika.padding_token", d.padding_token)?,
            f_norm_eps,
            n_label,
        };
        if hp.padding_token > MAX_PADDING_TOKEN {
            return Err(ModelError::InvalidHparams(format!(
                "padding token {} exceeds {}",
                hp.padding_token, MAX_PADDING_TOKEN
            )));
        }
        if hp.n_tokens() == 0 {
            return Err(ModelError::InvalidHparams("empty byte windows".to_string()));
        }
        Ok(hp)
    }

    /// Byte positions fed to the network per file. Saturates rather than
    /// overflowing; loaded hyperparameters are always in range.
    pub fn n_tokens(&self) -> usize {
        self.beg_size
            .saturating_add(self.mid_size)
            .saturating_add(self.end_size)
    }

    /// Width of the one-hot byte encoding.
    pub fn n_vocab(&self) -> usize {
        self.padding_token.saturating_add(1)
    }
}

/// Layer widths, read off the weight shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagikaDims {
    pub dense: usize,
    /// Sequence length after the first reshape; the first norm runs over it.
    pub seq: usize,
    pub dense_1_in: usize,
    pub dense_1: usize,
    pub dense_2: usize,
}

/// A loaded Magika model.
#[derive(Debug)]
pub struct MagikaModel {
    pub hparams: MagikaHparams,
    pub dims: MagikaDims,
    pub labels: Vec<String>,
    pub weights: WeightStore,
}

fn shape_of(weights: &WeightStore, name: &str) -> Result<Shape> {
    weights
        .by_name(name)
        .map(|t| *t.shape())
        .ok_or_else(|| ModelError::TensorNotFound(name.to_string()))
}

fn expect_shape(weights: &WeightStore, name: &str, expected: Shape) -> Result<()> {
    let got = shape_of(weights, name)?;
    if got != expected {
        return Err(ModelError::TensorShape {
            name: name.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        });
    }
    Ok(())
}

/// Check that the weights chain together for a batch of one file.
fn check_dims(hp: &MagikaHparams, weights: &WeightStore) -> Result<MagikaDims> {
    let dense = shape_of(weights, DENSE_W)?.dim(1);
    expect_shape(weights, DENSE_W, Shape::new(&[hp.n_vocab(), dense]))?;
    expect_shape(weights, DENSE_B, Shape::new(&[dense]))?;

    let seq = shape_of(weights, LN_GAMMA)?.dim(0);
    expect_shape(weights, LN_BETA, Shape::new(&[seq]))?;

    let d1 = shape_of(weights, DENSE_1_W)?;
    let (dense_1_in, dense_1) = (d1.dim(0), d1.dim(1));
    let features = dense.checked_mul(hp.n_tokens()).ok_or_else(|| {
        ModelError::InvalidHparams(format!(
            "{} tokens of width {} overflow",
            hp.n_tokens(),
            dense
        ))
    })?;
    if dense_1_in.checked_mul(seq) != Some(features) {
        return Err(ModelError::TensorShape {
            name: DENSE_1_W.to_string(),
            expected: format!("{} inputs per position", features / seq.max(1)),
            got: d1.to_string(),
        });
    }
    expect_shape(weights, DENSE_1_W, Shape::new(&[dense_1_in, dense_1]))?;
    expect_shape(weights, DENSE_1_B, Shape::new(&[dense_1]))?;

    let dense_2 = shape_of(weights, DENSE_2_W)?.dim(1);
    expect_shape(weights, DENSE_2_W, Shape::new(&[dense_1, dense_2]))?;
    expect_shape(weights, DENSE_2_B, Shape::new(&[dense_2]))?;
    expect_shape(weights, LN_1_GAMMA, Shape::new(&[dense_2]))?;
    expect_shape(weights, LN_1_BETA, Shape::new(&[dense_2]))?;
    expect_shape(weights, TARGET_LABEL_W, Shape::new(&[dense_2, hp.n_label]))?;
    expect_shape(weights, TARGET_LABEL_B, Shape::new(&[hp.n_label]))?;

    Ok(MagikaDims {
        dense,
        seq,
        dense_1_in,
        dense_1,
        dense_2,
    })
}

impl MagikaModel {
    pub fn load(path: &Path) -> Result<MagikaModel> {
        let file = GgufFile::open(path)?;
        let hparams = MagikaHparams::from_gguf(&file)?;
        let labels = if file.metadata.contains(KEY_LABELS) {
            file.metadata.get_string_array(KEY_LABELS)?
        } else {
            Vec::new()
        };
        if !labels.is_empty() && labels.len() != hparams.n_label {
            return Err(ModelError::InvalidHparams(format!(
                "{} labels for {} outputs",
                labels.len(),
                hparams.n_label
            )));
        }

        let weights = file.load_weights(&CpuBackend::new())?;
        let dims = check_dims(&hparams, &weights)?;

        info!(
            n_label = hparams.n_label,
            n_tokens = hparams.n_tokens(),
            dense = dims.dense,
            bytes = weights.buffer_bytes(),
            "loaded Magika model"
        );
        Ok(MagikaModel {
            hparams,
            dims,
            labels,
            weights,
        })
    }

    /// Name of output class `i`, when the file carries label names.
    pub fn label(&self, i: usize) -> Option<&str> {
        self.labels.get(i).map(String::as_str)
    }
}

/// Load-time parameters. The classifier has none; batch size is fixed at one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MagikaParams;

/// Magika file-type classifier family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Magika;

impl ModelFamily for Magika {
    const NAME: &'static str = "magika";
    type Params = MagikaParams;
    type GraphParams = ();
    type Container = MagikaModel;

    fn load(path: &Path, _params: &MagikaParams) -> Result<MagikaModel> {
        MagikaModel::load(path)
    }

    fn build_graph<'a>(container: &'a mut MagikaModel, _params: &()) -> Result<ComputeGraph<'a>> {
        build_graph(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::gguf::{GgufMetadataValue, GgufWriter};
    use crate::ModelHandle;

    #[test]
    fn test_load_tiny() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magika.gguf");
        fixtures::write_magika(&path).unwrap();

        let model = MagikaModel::load(&path).unwrap();
        assert_eq!(model.hparams.n_tokens(), 1536);
        assert_eq!(model.hparams.n_vocab(), 257);
        assert_eq!(model.hparams.n_label, fixtures::MAGIKA_N_LABEL);
        assert_eq!(model.labels.len(), fixtures::MAGIKA_N_LABEL);
        assert_eq!(model.label(0), Some("label0"));
        assert_eq!(model.dims.seq, 384);
        assert_eq!(
            model.dims.dense_1_in * model.dims.seq,
            model.dims.dense * 1536
        );
    }

    #[test]
    fn test_inconsistent_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gguf");
        let mut w = GgufWriter::new();
        w.add_tensor_f32(DENSE_W, Shape::new(&[257, 2]), &[0.0; 514]).unwrap();
        w.add_tensor_f32(DENSE_B, Shape::new(&[3]), &[0.0; 3]).unwrap();
        w.add_tensor_f32(TARGET_LABEL_B, Shape::new(&[2]), &[0.0; 2]).unwrap();
        w.write_to(&path).unwrap();
        assert!(matches!(
            MagikaModel::load(&path),
            Err(ModelError::TensorShape { .. })
        ));
    }

    #[test]
    fn test_missing_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.gguf");
        GgufWriter::new().write_to(&path).unwrap();
        assert!(matches!(
            MagikaModel::load(&path),
            Err(ModelError::TensorNotFound(_))
        ));
    }

    #[test]
    fn test_out_of_range_hparams_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magika.gguf");
        let cases = [
            ("magika.beg_size", u64::MAX),
            ("magika.mid_size", (MAX_WINDOW + 1) as u64),
            ("magika.end_size", u64::MAX / 2),
            ("magika.padding_token", u64::MAX),
        ];
        for (key, value) in cases {
            let mut w = GgufWriter::new();
            w.add_value(key, GgufMetadataValue::U64(value));
            w.add_tensor_f32(TARGET_LABEL_B, Shape::new(&[2]), &[0.0; 2])
                .unwrap();
            w.write_to(&path).unwrap();

            let mut handle = ModelHandle::<Magika>::new();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handle.init(&path, &MagikaParams)
            }));
            assert!(
                matches!(result, Ok(Err(ModelError::InvalidHparams(_)))),
                "{} = {} was accepted",
                key,
                value
            );
            assert!(!handle.is_live());
        }
    }

    #[test]
    fn test_empty_windows_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magika.gguf");
        let mut w = GgufWriter::new();
        for key in ["magika.beg_size", "magika.mid_size", "magika.end_size"] {
            w.add_u32(key, 0);
        }
        w.add_tensor_f32(TARGET_LABEL_B, Shape::new(&[2]), &[0.0; 2])
            .unwrap();
        w.write_to(&path).unwrap();
        assert!(matches!(
            MagikaModel::load(&path),
            Err(ModelError::InvalidHparams(_))
        ));
    }
}
