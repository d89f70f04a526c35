use crate::error::{GraphError, Result};

/// Memory owned by a compute backend, holding raw tensor bytes.
///
/// Host-visible on every backend supported so far; tensors address it by
/// byte offset.
#[derive(Debug)]
pub struct BackendBuffer {
    backend: String,
    alignment: usize,
    data: Vec<u8>,
}

impl BackendBuffer {
    /// Allocate `size` zeroed bytes, reporting allocation failure as an error
    /// instead of aborting.
    pub fn zeroed(backend: &str, size: usize, alignment: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| GraphError::BufferAllocation {
                backend: backend.to_string(),
                size,
            })?;
        data.resize(size, 0);
        Ok(BackendBuffer {
            backend: backend.to_string(),
            alignment,
            data,
        })
    }

    /// Name of the backend this buffer belongs to.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes `[offset, offset + len)`, or `None` when out of range.
    pub fn range(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.data.get(offset..end)
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let end = offset.checked_add(len)?;
        self.data.get_mut(offset..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed() {
        let b = BackendBuffer::zeroed("cpu", 8, 32).unwrap();
        assert_eq!(b.len(), 8);
        assert!(!b.is_empty());
        assert_eq!(b.as_slice(), &[0; 8]);
    }

    #[test]
    fn test_ranges() {
        let mut b = BackendBuffer::zeroed("cpu", 8, 32).unwrap();
        b.range_mut(4, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(b.range(4, 4).unwrap(), &[1, 2, 3, 4]);
        assert!(b.range(6, 4).is_none());
        assert!(b.range(usize::MAX, 2).is_none());
    }
}
