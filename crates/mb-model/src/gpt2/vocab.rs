use std::collections::HashMap;

use crate::error::{ModelError, Result};
use crate::legacy::{LegacyCursor, LegacyWriter};

/// Upper bound on vocabulary entries reserved up front.
const MAX_VOCAB_PREALLOC: usize = 1 << 16;

/// GPT-2 token table as stored after the hyperparameters.
#[derive(Debug, Clone, Default)]
pub struct Gpt2Vocab {
    /// Token strings, indexed by token id.
    pub tokens: Vec<String>,
    /// Reverse mapping from token string to token id.
    pub token_to_id: HashMap<String, u32>,
}

impl Gpt2Vocab {
    /// Read an `i32` count, which must equal `n_vocab`, then that many
    /// `u32 len + bytes` entries.
    pub fn read(cursor: &mut LegacyCursor<'_>, n_vocab: usize) -> Result<Gpt2Vocab> {
        let n = cursor.read_count("vocabulary size")?;
        if n != n_vocab {
            return Err(ModelError::InvalidHparams(format!(
                "vocabulary has {} entries, hyperparameters say {}",
                n, n_vocab
            )));
        }

        let mut tokens = Vec::with_capacity(n.min(MAX_VOCAB_PREALLOC));
        let mut token_to_id = HashMap::with_capacity(n.min(MAX_VOCAB_PREALLOC));
        for id in 0..n {
            let word = String::from_utf8_lossy(cursor.read_prefixed()?).into_owned();
            token_to_id.insert(word.clone(), id as u32);
            tokens.push(word);
        }
        Ok(Gpt2Vocab {
            tokens,
            token_to_id,
        })
    }

    pub fn write(&self, w: &mut LegacyWriter) {
        w.write_i32(self.tokens.len() as i32);
        for t in &self.tokens {
            w.write_prefixed(t.as_bytes());
        }
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Number of tokens in the vocabulary.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<String> for Gpt2Vocab {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let tokens: Vec<String> = iter.into_iter().collect();
        let token_to_id = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Gpt2Vocab {
            tokens,
            token_to_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::LegacyFile;

    fn cursor_over(w: &LegacyWriter) -> (tempfile::TempDir, LegacyFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.bin");
        w.write_to(&path).unwrap();
        let f = LegacyFile::open(&path).unwrap();
        (dir, f)
    }

    #[test]
    fn test_read_vocab() {
        let vocab: Gpt2Vocab = ["hello", " world", "!"].iter().map(|s| s.to_string()).collect();
        let mut w = LegacyWriter::new();
        vocab.write(&mut w);
        let (_dir, f) = cursor_over(&w);
        let mut c = f.cursor().unwrap();
        let read = Gpt2Vocab::read(&mut c, 3).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read.token(1), Some(" world"));
        assert_eq!(read.id("!"), Some(2));
        assert_eq!(read.token(3), None);
    }

    #[test]
    fn test_count_mismatch() {
        let vocab: Gpt2Vocab = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let mut w = LegacyWriter::new();
        vocab.write(&mut w);
        let (_dir, f) = cursor_over(&w);
        let mut c = f.cursor().unwrap();
        assert!(matches!(
            Gpt2Vocab::read(&mut c, 5),
            Err(ModelError::InvalidHparams(_))
        ));
    }
}
