use std::io::{BufReader, Seek};
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, info};

use mb_graph::{ComputeBackend, TensorLayout, WeightStore};

use super::header::GgufHeader;
use super::metadata::GgufMetadata;
use super::tensor_info::{self, GgufTensorInfo};
use crate::error::{ModelError, Result};

/// A parsed GGUF file backed by a memory-mapped region.
///
/// The header, metadata, and tensor info table are parsed with buffered
/// reads; the whole file is then memory-mapped so tensor data can be copied
/// into backend buffers without further IO.
pub struct GgufFile {
    pub header: GgufHeader,
    pub metadata: GgufMetadata,
    pub tensor_infos: Vec<GgufTensorInfo>,
    mmap: Mmap,
    /// Byte offset within the file where tensor data begins (aligned).
    data_offset: usize,
}

impl GgufFile {
    /// Open and parse a GGUF file from disk.
    pub fn open(path: &Path) -> Result<GgufFile> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(&file);

        let header = GgufHeader::parse(&mut reader)?;
        let metadata = GgufMetadata::parse_kv(&mut reader, header.n_kv)?;
        let tensor_infos = tensor_info::parse_tensor_infos(&mut reader, header.n_tensors)?;

        let current_pos = reader.stream_position()? as usize;
        let alignment = metadata.alignment()?;
        let data_offset = current_pos.div_ceil(alignment) * alignment;

        // SAFETY: the map is read-only and model files are not expected to
        // be modified while a model is being loaded.
        let mmap = unsafe { Mmap::map(&file)? };

        debug!(
            path = %path.display(),
            version = header.version,
            n_tensors = header.n_tensors,
            n_kv = header.n_kv,
            "parsed GGUF header"
        );

        Ok(GgufFile {
            header,
            metadata,
            tensor_infos,
            mmap,
            data_offset,
        })
    }

    pub fn tensor_info(&self, name: &str) -> Option<&GgufTensorInfo> {
        self.tensor_infos.iter().find(|t| t.name == name)
    }

    /// Raw bytes of a tensor within the mapped file.
    pub fn tensor_data(&self, info: &GgufTensorInfo) -> Result<&[u8]> {
        let size = info.data_size()?;
        let range = usize::try_from(info.offset)
            .ok()
            .and_then(|off| off.checked_add(self.data_offset))
            .and_then(|start| Some(start..start.checked_add(size)?))
            .filter(|r| r.end <= self.mmap.len())
            .ok_or_else(|| {
                ModelError::Truncated(format!(
                    "tensor '{}' ({} bytes at offset {}) lies outside the file",
                    info.name, size, info.offset
                ))
            })?;
        Ok(&self.mmap[range])
    }

    /// Copy every tensor into a single buffer allocated on `backend`.
    pub fn load_weights(&self, backend: &dyn ComputeBackend) -> Result<WeightStore> {
        let mut layout = TensorLayout::new(backend.alignment());
        for t in &self.tensor_infos {
            // Validates the data range before any allocation happens.
            self.tensor_data(t)?;
            layout.push(t.name.clone(), t.dtype, t.shape)?;
        }
        let total = layout.size();

        let mut store = WeightStore::new();
        let ids = store.allocate(layout, backend)?;
        for (t, id) in self.tensor_infos.iter().zip(ids) {
            store.data_mut(id).copy_from_slice(self.tensor_data(t)?);
        }

        info!(
            backend = backend.name(),
            n_tensors = store.len(),
            bytes = total,
            "loaded GGUF weights"
        );
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::writer::GgufWriter;
    use mb_graph::{CpuBackend, DType, Shape};

    #[test]
    fn test_open_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        let mut w = GgufWriter::new();
        w.add_u32("test.n", 3);
        w.add_string("general.name", "tiny");
        w.add_tensor_f32("a", Shape::new(&[3]), &[1.0, 2.0, 3.0]).unwrap();
        w.add_tensor_f32("b", Shape::new(&[2, 2]), &[4.0, 5.0, 6.0, 7.0]).unwrap();
        w.write_to(&path).unwrap();

        let file = GgufFile::open(&path).unwrap();
        assert_eq!(file.header.version, 3);
        assert_eq!(file.metadata.get_u32("test.n").unwrap(), 3);
        assert_eq!(file.metadata.get_string("general.name").unwrap(), "tiny");
        let b = file.tensor_info("b").unwrap();
        assert_eq!(b.shape, Shape::new(&[2, 2]));
        assert_eq!(b.offset % 32, 0);

        let store = file.load_weights(&CpuBackend::new()).unwrap();
        assert_eq!(store.len(), 2);
        let id = store.id("b").unwrap();
        assert_eq!(store.get(id).unwrap().dtype(), DType::F32);
        let bytes: Vec<u8> = [4.0f32, 5.0, 6.0, 7.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(store.data(id), &bytes[..]);
    }

    #[test]
    fn test_truncated_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        let mut w = GgufWriter::new();
        w.add_tensor_f32("a", Shape::new(&[64]), &[0.5; 64]).unwrap();
        w.write_to(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 16]).unwrap();

        let file = GgufFile::open(&path).unwrap();
        assert!(matches!(
            file.load_weights(&CpuBackend::new()),
            Err(ModelError::Truncated(_))
        ));
    }

    #[test]
    fn test_not_gguf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"definitely not a model").unwrap();
        assert!(matches!(
            GgufFile::open(&path),
            Err(ModelError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            GgufFile::open(Path::new("/nonexistent/model.gguf")),
            Err(ModelError::Io(_))
        ));
    }
}
