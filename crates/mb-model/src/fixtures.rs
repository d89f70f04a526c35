//! Tiny synthetic model files for tests.
//!
//! Each writer produces a structurally complete file for one family with
//! small layer widths and deterministic weight values.

use std::path::Path;

use mb_graph::{DType, Shape};

use crate::error::{ModelError, Result};
use crate::gguf::{GgufMetadataValue, GgufWriter};
use crate::gpt2::{self, Gpt2Hparams, Gpt2Vocab};
use crate::legacy::LegacyWriter;
use crate::magika;
use crate::yolo;

/// Output classes of the fixture classifier.
pub const MAGIKA_N_LABEL: usize = 5;

/// Channels of each fixture detector head.
pub const YOLO_HEAD_CHANNELS: usize = 6;

/// Deterministic values for tensor `name`.
pub fn fill(name: &str, n: usize) -> Vec<f32> {
    let seed = name.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    (0..n)
        .map(|i| ((seed.wrapping_add(i)) % 17) as f32 * 0.01 - 0.08)
        .collect()
}

fn encode(name: &str, dtype: DType, values: &[f32]) -> Result<Vec<u8>> {
    match dtype {
        DType::F32 => Ok(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        DType::F16 => Ok(values
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect()),
        other => Err(ModelError::InvalidHparams(format!(
            "fixture tensor '{}' cannot be written as {}",
            name, other
        ))),
    }
}

pub fn tiny_gpt2_hparams() -> Gpt2Hparams {
    Gpt2Hparams {
        n_vocab: 16,
        n_ctx: 16,
        n_embd: 8,
        n_head: 2,
        n_layer: 2,
        ftype: 0,
    }
}

pub fn tiny_vocab(n_vocab: usize) -> Gpt2Vocab {
    (0..n_vocab).map(|i| format!("tok{}", i)).collect()
}

/// Write a legacy GGML GPT-2 file. Without `with_lm_head` the output
/// projection is tied to the token embedding, as in the released models.
pub fn write_gpt2(path: &Path, hp: &Gpt2Hparams, with_lm_head: bool) -> Result<()> {
    let mut w = LegacyWriter::new();
    hp.write(&mut w);
    tiny_vocab(hp.n_vocab).write(&mut w);
    for (name, dtype, shape) in gpt2::expected_tensors(hp, with_lm_head)? {
        let data = encode(&name, dtype, &fill(&name, shape.numel()))?;
        w.write_record(&name, dtype, shape, &data);
    }
    w.write_to(path)
}

/// Write a Magika GGUF file with the published input geometry
/// (`[257, 1536]`) and narrow hidden layers.
pub fn write_magika(path: &Path) -> Result<()> {
    let hp = magika::MagikaHparams::default();
    let (dense, seq, d1_in, d1, d2) = (4, 384, 16, 8, 8);
    let n_label = MAGIKA_N_LABEL;

    let tensors: [(&str, &[usize]); 12] = [
        (magika::DENSE_W, &[hp.n_vocab(), dense]),
        (magika::DENSE_B, &[dense]),
        (magika::LN_GAMMA, &[seq]),
        (magika::LN_BETA, &[seq]),
        (magika::DENSE_1_W, &[d1_in, d1]),
        (magika::DENSE_1_B, &[d1]),
        (magika::DENSE_2_W, &[d1, d2]),
        (magika::DENSE_2_B, &[d2]),
        (magika::LN_1_GAMMA, &[d2]),
        (magika::LN_1_BETA, &[d2]),
        (magika::TARGET_LABEL_W, &[d2, n_label]),
        (magika::TARGET_LABEL_B, &[n_label]),
    ];

    let mut w = GgufWriter::new();
    w.add_string("general.architecture", "magika");
    w.add_value(
        magika::KEY_LABELS,
        GgufMetadataValue::Array(
            (0..n_label)
                .map(|i| GgufMetadataValue::String(format!("label{}", i)))
                .collect(),
        ),
    );
    for (name, dims) in tensors {
        let shape = Shape::new(dims);
        w.add_tensor_f32(name, shape, &fill(name, shape.numel()))?;
    }
    w.write_to(path)
}

/// Write a YOLOv3-tiny GGUF file with narrow layers. `size` sets the input
/// geometry through metadata; `None` leaves the 416x416 default.
pub fn write_yolo(path: &Path, size: Option<(usize, usize)>) -> Result<()> {
    let head = YOLO_HEAD_CHANNELS;
    let filters = [4, 4, 4, 4, 4, 4, 4, 4, 4, head, 4, 4, head];
    let kernels = [3, 3, 3, 3, 3, 3, 3, 1, 3, 1, 1, 3, 1];
    let inputs = [
        3,
        filters[0],
        filters[1],
        filters[2],
        filters[3],
        filters[4],
        filters[5],
        filters[6],
        filters[7],
        filters[8],
        filters[7],
        filters[10] + filters[4],
        filters[11],
    ];

    let mut w = GgufWriter::new();
    w.add_string("general.architecture", "yolo");
    if let Some((width, height)) = size {
        w.add_u32(yolo::KEY_WIDTH, width as u32);
        w.add_u32(yolo::KEY_HEIGHT, height as u32);
    }
    for il in 0..yolo::YOLO_N_LAYERS {
        let (k, c, f) = (kernels[il], inputs[il], filters[il]);
        let mut tensors = vec![
            ("weights", Shape::new(&[k, k, c, f])),
            ("biases", Shape::new(&[1, 1, f])),
        ];
        if il != 9 && il != 12 {
            tensors.push(("scales", Shape::new(&[1, 1, f])));
            tensors.push(("rolling_mean", Shape::new(&[1, 1, f])));
            tensors.push(("rolling_variance", Shape::new(&[1, 1, f])));
        }
        for (what, shape) in tensors {
            let name = yolo::layer_tensor(il, what);
            let mut values = fill(&name, shape.numel());
            if what == "rolling_variance" {
                values.iter_mut().for_each(|v| *v = v.abs() + 1.0);
            }
            w.add_tensor_f32(&name, shape, &values)?;
        }
    }
    w.write_to(path)
}
