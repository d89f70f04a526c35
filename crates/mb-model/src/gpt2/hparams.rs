use mb_graph::DType;

use crate::error::{ModelError, Result};
use crate::legacy::{LegacyCursor, LegacyWriter};

/// Quantization version factor folded into the stored `ftype`.
pub const GGML_QNT_VERSION_FACTOR: u32 = 1000;

/// GPT-2 hyperparameters, read from the legacy file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt2Hparams {
    pub n_vocab: usize,
    /// Context length the position embeddings were trained for.
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    /// Weight storage type, quantization version stripped.
    pub ftype: u32,
}

impl Default for Gpt2Hparams {
    /// GPT-2 117M.
    fn default() -> Self {
        Gpt2Hparams {
            n_vocab: 50257,
            n_ctx: 1024,
            n_embd: 768,
            n_head: 12,
            n_layer: 12,
            ftype: 1,
        }
    }
}

impl Gpt2Hparams {
    /// Read the six i32 header fields and validate them.
    pub fn read(cursor: &mut LegacyCursor<'_>) -> Result<Gpt2Hparams> {
        let n_vocab = cursor.read_count("n_vocab")?;
        let n_ctx = cursor.read_count("n_ctx")?;
        let n_embd = cursor.read_count("n_embd")?;
        let n_head = cursor.read_count("n_head")?;
        let n_layer = cursor.read_count("n_layer")?;
        let ftype = cursor.read_count("ftype")? as u32 % GGML_QNT_VERSION_FACTOR;

        let hparams = Gpt2Hparams {
            n_vocab,
            n_ctx,
            n_embd,
            n_head,
            n_layer,
            ftype,
        };
        hparams.validate()?;
        Ok(hparams)
    }

    pub fn write(&self, w: &mut LegacyWriter) {
        for v in [self.n_vocab, self.n_ctx, self.n_embd, self.n_head, self.n_layer] {
            w.write_i32(v as i32);
        }
        w.write_i32(self.ftype as i32);
    }

    fn validate(&self) -> Result<()> {
        let dims = [
            ("n_vocab", self.n_vocab),
            ("n_ctx", self.n_ctx),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(ModelError::InvalidHparams(format!("{} is zero", name)));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(ModelError::InvalidHparams(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        self.wtype().map(|_| ())
    }

    /// Storage type of the matrix weights.
    pub fn wtype(&self) -> Result<DType> {
        DType::from_ftype(self.ftype)
            .ok_or_else(|| ModelError::InvalidHparams(format!("unsupported ftype {}", self.ftype)))
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::LegacyFile;

    fn read_back(h: &Gpt2Hparams, ftype_raw: i32) -> Result<Gpt2Hparams> {
        let mut w = LegacyWriter::new();
        for v in [h.n_vocab, h.n_ctx, h.n_embd, h.n_head, h.n_layer] {
            w.write_i32(v as i32);
        }
        w.write_i32(ftype_raw);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.bin");
        w.write_to(&path).unwrap();
        let f = LegacyFile::open(&path).unwrap();
        let mut c = f.cursor().unwrap();
        Gpt2Hparams::read(&mut c)
    }

    #[test]
    fn test_strips_quantization_version() {
        let h = read_back(&Gpt2Hparams::default(), 2002).unwrap();
        assert_eq!(h.ftype, 2);
        assert_eq!(h.wtype().unwrap(), DType::Q4_0);
        assert_eq!(h.head_dim(), 64);
    }

    #[test]
    fn test_rejects_bad_heads() {
        let h = Gpt2Hparams {
            n_head: 5,
            ..Default::default()
        };
        assert!(matches!(
            read_back(&h, 0),
            Err(ModelError::InvalidHparams(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_ftype() {
        assert!(read_back(&Gpt2Hparams::default(), 42).is_err());
    }
}
