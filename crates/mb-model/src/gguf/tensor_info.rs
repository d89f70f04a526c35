use std::io::Read;

use mb_graph::shape::MAX_DIMS;
use mb_graph::{DType, Shape};

use super::{read_string, read_u32, read_u64};
use crate::error::{ModelError, Result};

/// Upper bound on tensor infos reserved up front.
const MAX_INFO_PREALLOC: usize = 1024;

/// Describes a single tensor stored within a GGUF file.
#[derive(Debug, Clone)]
pub struct GgufTensorInfo {
    /// Tensor name (e.g. "dense/kernel:0").
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
    /// Byte offset of this tensor's data from the start of the data section.
    pub offset: u64,
}

impl GgufTensorInfo {
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Byte size of this tensor's raw data in the file.
    pub fn data_size(&self) -> Result<usize> {
        self.dtype
            .row_size(self.shape.dim(0))
            .and_then(|row| row.checked_mul(self.shape.checked_nrows()?))
            .ok_or_else(|| ModelError::TensorShape {
                name: self.name.clone(),
                expected: format!("rows that are whole {} blocks", self.dtype),
                got: self.shape.to_string(),
            })
    }
}

/// Parse `n_tensors` tensor info entries from a reader.
///
/// Each entry:
/// 1. GGUF string name
/// 2. u32 number of dimensions
/// 3. n_dims x u64 dimension sizes
/// 4. u32 type id
/// 5. u64 byte offset within the tensor data section
pub fn parse_tensor_infos(reader: &mut impl Read, n_tensors: u64) -> Result<Vec<GgufTensorInfo>> {
    let mut infos = Vec::with_capacity((n_tensors as usize).min(MAX_INFO_PREALLOC));
    for _ in 0..n_tensors {
        let name = read_string(reader)?;

        let n_dims = read_u32(reader)? as usize;
        if n_dims == 0 || n_dims > MAX_DIMS {
            return Err(ModelError::TensorShape {
                name,
                expected: format!("1 to {} dimensions", MAX_DIMS),
                got: format!("{} dimensions", n_dims),
            });
        }
        let mut ne = [1usize; MAX_DIMS];
        for d in ne.iter_mut().take(n_dims) {
            let dim = read_u64(reader)?;
            *d = usize::try_from(dim)
                .ok()
                .filter(|&v| v > 0)
                .ok_or_else(|| ModelError::TensorShape {
                    name: name.clone(),
                    expected: "non-zero dimensions".to_string(),
                    got: dim.to_string(),
                })?;
        }
        if ne.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(ModelError::TensorShape {
                name,
                expected: "an addressable element count".to_string(),
                got: format!("{:?}", ne),
            });
        }

        let type_id = read_u32(reader)?;
        let dtype = DType::from_type_id(type_id).ok_or(ModelError::UnsupportedType(type_id))?;
        let offset = read_u64(reader)?;

        infos.push(GgufTensorInfo {
            name,
            shape: Shape::from_ne(ne),
            dtype,
            offset,
        });
    }
    Ok(infos)
}
