//! Reader and writer for the legacy GGML container.
//!
//! Layout: u32 magic `0x67676d6c`, a model-specific header of i32 fields and
//! vocabulary entries, then tensor records until end of file. Each record is
//! `i32 n_dims, i32 name_len, i32 type, i32 ne[n_dims], name bytes, data`.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use mb_graph::shape::MAX_DIMS;
use mb_graph::{DType, Shape};

use crate::error::{ModelError, Result};

/// Magic number opening every legacy GGML model file ("ggml" as a LE u32).
pub const GGML_FILE_MAGIC: u32 = 0x6767_6d6c;

/// A legacy model file mapped into memory.
pub struct LegacyFile {
    mmap: Mmap,
}

impl LegacyFile {
    pub fn open(path: &Path) -> Result<LegacyFile> {
        let file = File::open(path)?;
        // SAFETY: read-only map of a model file that is not modified while
        // it is being loaded.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(LegacyFile { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// A cursor positioned after the validated magic.
    pub fn cursor(&self) -> Result<LegacyCursor<'_>> {
        let mut cursor = LegacyCursor {
            data: &self.mmap,
            pos: 0,
        };
        let magic = cursor.read_u32()?;
        if magic != GGML_FILE_MAGIC {
            return Err(ModelError::InvalidMagic {
                expected: GGML_FILE_MAGIC,
                got: magic,
            });
        }
        Ok(cursor)
    }
}

/// One tensor record, borrowing its name and payload from the mapped file.
#[derive(Debug, Clone)]
pub struct LegacyRecord<'a> {
    pub name: &'a str,
    pub dtype: DType,
    pub shape: Shape,
    pub data: &'a [u8],
}

/// Bounds-checked little-endian reads over a mapped legacy file.
pub struct LegacyCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LegacyCursor<'a> {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                ModelError::Truncated(format!(
                    "need {} bytes at offset {}, file has {}",
                    len,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// An i32 field that must be non-negative.
    pub fn read_count(&mut self, what: &str) -> Result<usize> {
        let v = self.read_i32()?;
        usize::try_from(v).map_err(|_| ModelError::Corrupt(format!("negative {}: {}", what, v)))
    }

    /// A `u32 len` prefixed byte string.
    pub fn read_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// The next tensor record, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<LegacyRecord<'a>>> {
        if self.is_at_end() {
            return Ok(None);
        }
        let n_dims = self.read_count("tensor rank")?;
        let name_len = self.read_count("tensor name length")?;
        let ttype = self.read_u32()?;

        if n_dims == 0 || n_dims > MAX_DIMS {
            return Err(ModelError::Corrupt(format!("tensor rank {}", n_dims)));
        }
        let mut ne = [1usize; MAX_DIMS];
        for d in ne.iter_mut().take(n_dims) {
            *d = self.read_count("tensor dimension")?;
            if *d == 0 {
                return Err(ModelError::Corrupt("zero tensor dimension".to_string()));
            }
        }

        let name = std::str::from_utf8(self.read_bytes(name_len)?)
            .map_err(|e| ModelError::Corrupt(format!("tensor name: {}", e)))?;
        let dtype = DType::from_type_id(ttype).ok_or(ModelError::UnsupportedType(ttype))?;
        let shape = Shape::from_ne(ne);

        let size = dtype
            .row_size(ne[0])
            .and_then(|row| row.checked_mul(shape.checked_nrows()?))
            .ok_or_else(|| ModelError::TensorShape {
                name: name.to_string(),
                expected: format!("rows of whole {} blocks", dtype),
                got: shape.to_string(),
            })?;
        let data = self.read_bytes(size)?;

        Ok(Some(LegacyRecord {
            name,
            dtype,
            shape,
            data,
        }))
    }
}

/// Builds a legacy GGML file in memory.
#[derive(Debug, Default)]
pub struct LegacyWriter {
    buf: Vec<u8>,
}

impl LegacyWriter {
    /// A writer that has already emitted the magic.
    pub fn new() -> Self {
        let mut w = LegacyWriter::default();
        w.write_u32(GGML_FILE_MAGIC);
        w
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_prefixed(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_record(&mut self, name: &str, dtype: DType, shape: Shape, data: &[u8]) {
        let n_dims = shape.n_dims();
        self.write_i32(n_dims as i32);
        self.write_i32(name.len() as i32);
        self.write_u32(dtype.type_id());
        for d in &shape.ne()[..n_dims] {
            self.write_i32(*d as i32);
        }
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(data);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(w: &LegacyWriter) -> (tempfile::TempDir, LegacyFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        w.write_to(&path).unwrap();
        let f = LegacyFile::open(&path).unwrap();
        (dir, f)
    }

    #[test]
    fn test_records() {
        let mut w = LegacyWriter::new();
        w.write_i32(7);
        w.write_prefixed(b"hello");
        let data: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        w.write_record("model/x", DType::F32, Shape::new(&[2]), &data);
        w.write_record("model/y", DType::F16, Shape::new(&[2, 1]), &[0, 0, 0, 0]);

        let (_dir, f) = write(&w);
        let mut c = f.cursor().unwrap();
        assert_eq!(c.read_i32().unwrap(), 7);
        assert_eq!(c.read_prefixed().unwrap(), b"hello");
        let r = c.next_record().unwrap().unwrap();
        assert_eq!(r.name, "model/x");
        assert_eq!(r.data, &data[..]);
        let r = c.next_record().unwrap().unwrap();
        assert_eq!(r.dtype, DType::F16);
        assert_eq!(r.shape, Shape::new(&[2, 1]));
        assert!(c.next_record().unwrap().is_none());
    }

    #[test]
    fn test_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        std::fs::write(&path, b"GGUF\x03\0\0\0").unwrap();
        let f = LegacyFile::open(&path).unwrap();
        assert!(matches!(f.cursor(), Err(ModelError::InvalidMagic { .. })));
    }

    #[test]
    fn test_truncated_record() {
        let mut w = LegacyWriter::new();
        w.write_record("t", DType::F32, Shape::new(&[4]), &[0u8; 16]);
        let bytes = &w.as_bytes()[..w.as_bytes().len() - 3];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        std::fs::write(&path, bytes).unwrap();
        let f = LegacyFile::open(&path).unwrap();
        let mut c = f.cursor().unwrap();
        assert!(matches!(c.next_record(), Err(ModelError::Truncated(_))));
    }

    #[test]
    fn test_huge_prefix_is_truncation() {
        let mut w = LegacyWriter::new();
        w.write_u32(u32::MAX);
        let (_dir, f) = write(&w);
        let mut c = f.cursor().unwrap();
        assert!(matches!(c.read_prefixed(), Err(ModelError::Truncated(_))));
    }

    #[test]
    fn test_overflowing_dims_are_rejected() {
        let mut w = LegacyWriter::new();
        w.write_i32(4);
        w.write_i32(1);
        w.write_u32(DType::F32.type_id());
        for _ in 0..4 {
            w.write_i32(i32::MAX);
        }
        // Name "t", padded.
        w.write_u32(u32::from(b't'));
        let (_dir, f) = write(&w);
        let mut c = f.cursor().unwrap();
        assert!(matches!(
            c.next_record(),
            Err(ModelError::TensorShape { .. })
        ));
    }
}
