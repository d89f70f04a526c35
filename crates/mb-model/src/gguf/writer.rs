use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use mb_graph::{DType, Shape};

use super::header::{GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC};
use super::metadata::{GgufMetadataValue, KEY_ALIGNMENT};
use crate::error::{ModelError, Result};

const GGUF_WRITE_VERSION: u32 = 3;

struct PendingTensor {
    name: String,
    dtype: DType,
    shape: Shape,
    data: Vec<u8>,
}

/// Builds a GGUF v3 file in memory and writes it out in one pass.
pub struct GgufWriter {
    alignment: usize,
    kv: Vec<(String, GgufMetadataValue)>,
    tensors: Vec<PendingTensor>,
}

impl Default for GgufWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl GgufWriter {
    pub fn new() -> Self {
        GgufWriter {
            alignment: GGUF_DEFAULT_ALIGNMENT,
            kv: Vec::new(),
            tensors: Vec::new(),
        }
    }

    /// Use a non-default data alignment, recorded as `general.alignment`.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self.add_u32(KEY_ALIGNMENT, alignment as u32);
        self
    }

    pub fn add_value(&mut self, key: &str, value: GgufMetadataValue) {
        self.kv.push((key.to_string(), value));
    }

    pub fn add_u32(&mut self, key: &str, value: u32) {
        self.add_value(key, GgufMetadataValue::U32(value));
    }

    pub fn add_f32(&mut self, key: &str, value: f32) {
        self.add_value(key, GgufMetadataValue::F32(value));
    }

    pub fn add_string(&mut self, key: &str, value: &str) {
        self.add_value(key, GgufMetadataValue::String(value.to_string()));
    }

    /// Queue a tensor with raw, already encoded bytes.
    pub fn add_tensor(&mut self, name: &str, dtype: DType, shape: Shape, data: Vec<u8>) -> Result<()> {
        let expected = dtype
            .row_size(shape.dim(0))
            .and_then(|row| row.checked_mul(shape.checked_nrows()?));
        if expected != Some(data.len()) {
            return Err(ModelError::TensorShape {
                name: name.to_string(),
                expected: format!("{:?} bytes", expected),
                got: format!("{} bytes", data.len()),
            });
        }
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            dtype,
            shape,
            data,
        });
        Ok(())
    }

    pub fn add_tensor_f32(&mut self, name: &str, shape: Shape, values: &[f32]) -> Result<()> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_tensor(name, DType::F32, shape, data)
    }

    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        let mut out = Counting { inner: out, pos: 0 };

        out.put(&GGUF_MAGIC.to_le_bytes())?;
        out.put(&GGUF_WRITE_VERSION.to_le_bytes())?;
        out.put(&(self.tensors.len() as u64).to_le_bytes())?;
        out.put(&(self.kv.len() as u64).to_le_bytes())?;

        for (key, value) in &self.kv {
            let mut buf = Vec::new();
            encode_string(&mut buf, key);
            buf.extend_from_slice(&value.type_id().to_le_bytes());
            encode_value(&mut buf, value);
            out.put(&buf)?;
        }

        let mut offset = 0usize;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offset = offset.div_ceil(self.alignment) * self.alignment;
            offsets.push(offset);
            let mut buf = Vec::new();
            encode_string(&mut buf, &t.name);
            let n_dims = t.shape.n_dims();
            buf.extend_from_slice(&(n_dims as u32).to_le_bytes());
            for d in &t.shape.ne()[..n_dims] {
                buf.extend_from_slice(&(*d as u64).to_le_bytes());
            }
            buf.extend_from_slice(&t.dtype.type_id().to_le_bytes());
            buf.extend_from_slice(&(offset as u64).to_le_bytes());
            out.put(&buf)?;
            offset += t.data.len();
        }

        out.pad_to(self.alignment)?;
        let data_start = out.pos;
        for (t, off) in self.tensors.iter().zip(offsets) {
            out.put(&vec![0u8; data_start + off - out.pos])?;
            out.put(&t.data)?;
        }
        out.inner.flush()?;
        Ok(())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write(&mut out)
    }
}

struct Counting<'w, W: Write> {
    inner: &'w mut W,
    pos: usize,
}

impl<W: Write> Counting<'_, W> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.pos += bytes.len();
        Ok(())
    }

    fn pad_to(&mut self, alignment: usize) -> Result<()> {
        let pad = self.pos.div_ceil(alignment) * alignment - self.pos;
        self.put(&vec![0u8; pad])
    }
}

fn encode_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn encode_value(buf: &mut Vec<u8>, value: &GgufMetadataValue) {
    use GgufMetadataValue as V;
    match value {
        V::U8(v) => buf.push(*v),
        V::I8(v) => buf.push(*v as u8),
        V::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        V::Bool(v) => buf.push(*v as u8),
        V::String(s) => encode_string(buf, s),
        V::Array(items) => {
            let elem_type = items.first().map_or(0, GgufMetadataValue::type_id);
            buf.extend_from_slice(&elem_type.to_le_bytes());
            buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                encode_value(buf, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::GgufFile;

    #[test]
    fn test_custom_alignment_and_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gguf");
        let mut w = GgufWriter::new().with_alignment(64);
        w.add_value(
            "labels",
            GgufMetadataValue::Array(vec![
                GgufMetadataValue::String("pdf".into()),
                GgufMetadataValue::String("zip".into()),
            ]),
        );
        w.add_tensor_f32("x", Shape::new(&[3]), &[1.0, 2.0, 3.0]).unwrap();
        w.add_tensor_f32("y", Shape::new(&[1]), &[9.0]).unwrap();
        w.write_to(&path).unwrap();

        let f = GgufFile::open(&path).unwrap();
        assert_eq!(f.metadata.alignment().unwrap(), 64);
        assert_eq!(f.metadata.get_string_array("labels").unwrap(), vec!["pdf", "zip"]);
        let y = f.tensor_info("y").unwrap();
        assert_eq!(y.offset, 64);
        assert_eq!(f.tensor_data(y).unwrap(), &9.0f32.to_le_bytes());
    }

    #[test]
    fn test_rejects_wrong_data_size() {
        let mut w = GgufWriter::new();
        assert!(w.add_tensor_f32("x", Shape::new(&[4]), &[1.0]).is_err());
    }
}
