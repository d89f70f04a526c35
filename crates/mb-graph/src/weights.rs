use std::collections::HashMap;

use crate::backend::ComputeBackend;
use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::shape::Shape;
use crate::storage::BackendBuffer;

/// Index of a tensor within a [`WeightStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightId(usize);

impl WeightId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A named tensor living in one of the store's backend buffers.
#[derive(Debug, Clone)]
pub struct WeightTensor {
    name: String,
    dtype: DType,
    shape: Shape,
    buffer: usize,
    offset: usize,
}

impl WeightTensor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn nbytes(&self) -> usize {
        self.shape.nbytes(self.dtype)
    }
}

struct LayoutEntry {
    name: String,
    dtype: DType,
    shape: Shape,
    offset: usize,
}

/// Placement plan for a set of tensors in a single buffer.
///
/// Every tensor starts at a multiple of `alignment`; `size()` is the buffer
/// size the plan needs.
pub struct TensorLayout {
    alignment: usize,
    size: usize,
    entries: Vec<LayoutEntry>,
}

impl TensorLayout {
    pub fn new(alignment: usize) -> Self {
        TensorLayout {
            alignment: alignment.max(1),
            size: 0,
            entries: Vec::new(),
        }
    }

    /// Reserve room for a tensor, returning its byte offset in the buffer.
    pub fn push(&mut self, name: impl Into<String>, dtype: DType, shape: Shape) -> Result<usize> {
        let name = name.into();
        if dtype.row_size(shape.dim(0)).is_none() {
            return Err(GraphError::Other(format!(
                "{}: row of {} elements is not a whole number of {} blocks",
                name,
                shape.dim(0),
                dtype
            )));
        }
        let end = self
            .size
            .div_ceil(self.alignment)
            .checked_mul(self.alignment)
            .zip(shape.checked_nbytes(dtype))
            .and_then(|(offset, n)| Some((offset, offset.checked_add(n)?)));
        let Some((offset, end)) = end else {
            return Err(GraphError::TensorTooLarge {
                shape,
                dtype: dtype.to_string(),
            });
        };
        self.size = end;
        self.entries.push(LayoutEntry {
            name,
            dtype,
            shape,
            offset,
        });
        Ok(offset)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Named model tensors and the backend buffers holding their bytes.
#[derive(Debug, Default)]
pub struct WeightStore {
    tensors: Vec<WeightTensor>,
    by_name: HashMap<String, WeightId>,
    buffers: Vec<BackendBuffer>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate one buffer on `backend` for every tensor in `layout`.
    ///
    /// Names must be unique across the whole store. Tensor bytes start zeroed.
    pub fn allocate(
        &mut self,
        layout: TensorLayout,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<WeightId>> {
        for (i, entry) in layout.entries.iter().enumerate() {
            let dup_in_layout = layout.entries[..i].iter().any(|e| e.name == entry.name);
            if dup_in_layout || self.by_name.contains_key(&entry.name) {
                return Err(GraphError::DuplicateWeight(entry.name.clone()));
            }
        }

        let buffer = backend.alloc_buffer(layout.size)?;
        let buffer_idx = self.buffers.len();
        self.buffers.push(buffer);

        let mut ids = Vec::with_capacity(layout.entries.len());
        for entry in layout.entries {
            let id = WeightId(self.tensors.len());
            self.by_name.insert(entry.name.clone(), id);
            self.tensors.push(WeightTensor {
                name: entry.name,
                dtype: entry.dtype,
                shape: entry.shape,
                buffer: buffer_idx,
                offset: entry.offset,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    /// Make `alias` resolve to the tensor already stored as `target`.
    pub fn alias(&mut self, alias: &str, target: &str) -> Result<WeightId> {
        if self.by_name.contains_key(alias) {
            return Err(GraphError::DuplicateWeight(alias.to_string()));
        }
        let id = self
            .id(target)
            .ok_or_else(|| GraphError::UnknownWeight(target.to_string()))?;
        self.by_name.insert(alias.to_string(), id);
        Ok(id)
    }

    pub fn id(&self, name: &str) -> Option<WeightId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: WeightId) -> Option<&WeightTensor> {
        self.tensors.get(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<&WeightTensor> {
        self.id(name).and_then(|id| self.get(id))
    }

    /// Raw bytes of a tensor.
    ///
    /// # Panics
    /// Panics if `id` was issued by a different store.
    pub fn data(&self, id: WeightId) -> &[u8] {
        let t = &self.tensors[id.0];
        &self.buffers[t.buffer].as_slice()[t.offset..t.offset + t.nbytes()]
    }

    /// Mutable raw bytes of a tensor, used by loaders to fill weights.
    ///
    /// # Panics
    /// Panics if `id` was issued by a different store.
    pub fn data_mut(&mut self, id: WeightId) -> &mut [u8] {
        let t = &self.tensors[id.0];
        let (offset, len) = (t.offset, t.nbytes());
        &mut self.buffers[t.buffer].as_mut_slice()[offset..offset + len]
    }

    /// Number of distinct tensors (aliases excluded).
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WeightTensor> {
        self.tensors.iter()
    }

    /// Total bytes held in backend buffers, alignment padding included.
    pub fn buffer_bytes(&self) -> usize {
        self.buffers.iter().map(BackendBuffer::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    fn store_with(entries: &[(&str, DType, &[usize])]) -> (WeightStore, Vec<WeightId>) {
        let backend = CpuBackend::new();
        let mut layout = TensorLayout::new(backend.alignment());
        for (name, dtype, dims) in entries {
            layout.push(*name, *dtype, Shape::new(dims)).unwrap();
        }
        let mut store = WeightStore::new();
        let ids = store.allocate(layout, &backend).unwrap();
        (store, ids)
    }

    #[test]
    fn test_layout_alignment() {
        let mut layout = TensorLayout::new(32);
        assert_eq!(layout.push("a", DType::F32, Shape::new(&[3])).unwrap(), 0);
        assert_eq!(layout.push("b", DType::F32, Shape::new(&[3])).unwrap(), 32);
        assert_eq!(layout.size(), 44);
        assert_eq!(layout.len(), 2);
    }

    #[test]
    fn test_layout_rejects_partial_blocks() {
        let mut layout = TensorLayout::new(32);
        assert!(layout.push("q", DType::Q8_0, Shape::new(&[33])).is_err());
    }

    #[test]
    fn test_layout_rejects_oversized_tensors() {
        let mut layout = TensorLayout::new(32);
        layout.push("a", DType::F32, Shape::new(&[3])).unwrap();
        let huge = Shape::new(&[1 << 32, 1 << 32]);
        assert!(matches!(
            layout.push("b", DType::F32, huge),
            Err(GraphError::TensorTooLarge { .. })
        ));
        assert_eq!(layout.size(), 12);
        assert_eq!(layout.len(), 1);
    }

    #[test]
    fn test_allocate_and_read_back() {
        let (mut store, ids) = store_with(&[("w", DType::F32, &[2, 2]), ("b", DType::F16, &[2])]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.id("b"), Some(ids[1]));

        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        store.data_mut(ids[0]).copy_from_slice(&bytes);
        assert_eq!(store.data(ids[0]), &bytes[..]);
        assert_eq!(store.data(ids[1]), &[0u8; 4][..]);
        assert_eq!(store.by_name("b").unwrap().nbytes(), 4);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let backend = CpuBackend::new();
        let mut layout = TensorLayout::new(32);
        layout.push("w", DType::F32, Shape::new(&[1])).unwrap();
        layout.push("w", DType::F32, Shape::new(&[1])).unwrap();
        let mut store = WeightStore::new();
        assert!(matches!(
            store.allocate(layout, &backend),
            Err(GraphError::DuplicateWeight(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_alias() {
        let (mut store, ids) = store_with(&[("wte", DType::F32, &[4, 2])]);
        assert_eq!(store.alias("lm_head", "wte").unwrap(), ids[0]);
        assert_eq!(store.by_name("lm_head").unwrap().name(), "wte");
        assert_eq!(store.len(), 1);
        assert!(store.alias("x", "missing").is_err());
    }
}
