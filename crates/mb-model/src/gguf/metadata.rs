use std::collections::HashMap;
use std::io::Read;

use super::{read_string, read_u32, read_u64, GGUF_DEFAULT_ALIGNMENT};
use crate::error::{ModelError, Result};

/// Key holding the tensor data alignment of a GGUF file.
pub const KEY_ALIGNMENT: &str = "general.alignment";

/// Upper bound on elements reserved up front for an array value.
const MAX_ARRAY_PREALLOC: usize = 4096;

/// A single GGUF metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufMetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Array(Vec<GgufMetadataValue>),
}

impl GgufMetadataValue {
    /// GGUF value type id, as written on disk.
    ///
    ///   0=U8, 1=I8, 2=U16, 3=I16, 4=U32, 5=I32, 6=F32, 7=Bool,
    ///   8=String, 9=Array, 10=U64, 11=I64, 12=F64
    pub fn type_id(&self) -> u32 {
        match self {
            GgufMetadataValue::U8(_) => 0,
            GgufMetadataValue::I8(_) => 1,
            GgufMetadataValue::U16(_) => 2,
            GgufMetadataValue::I16(_) => 3,
            GgufMetadataValue::U32(_) => 4,
            GgufMetadataValue::I32(_) => 5,
            GgufMetadataValue::F32(_) => 6,
            GgufMetadataValue::Bool(_) => 7,
            GgufMetadataValue::String(_) => 8,
            GgufMetadataValue::Array(_) => 9,
            GgufMetadataValue::U64(_) => 10,
            GgufMetadataValue::I64(_) => 11,
            GgufMetadataValue::F64(_) => 12,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            GgufMetadataValue::U8(_) => "U8",
            GgufMetadataValue::I8(_) => "I8",
            GgufMetadataValue::U16(_) => "U16",
            GgufMetadataValue::I16(_) => "I16",
            GgufMetadataValue::U32(_) => "U32",
            GgufMetadataValue::I32(_) => "I32",
            GgufMetadataValue::U64(_) => "U64",
            GgufMetadataValue::I64(_) => "I64",
            GgufMetadataValue::F32(_) => "F32",
            GgufMetadataValue::F64(_) => "F64",
            GgufMetadataValue::Bool(_) => "Bool",
            GgufMetadataValue::String(_) => "String",
            GgufMetadataValue::Array(_) => "Array",
        }
    }

    /// Any non-negative integer value, widened.
    fn as_u64(&self) -> Option<u64> {
        match *self {
            GgufMetadataValue::U8(v) => Some(v as u64),
            GgufMetadataValue::U16(v) => Some(v as u64),
            GgufMetadataValue::U32(v) => Some(v as u64),
            GgufMetadataValue::U64(v) => Some(v),
            GgufMetadataValue::I8(v) => u64::try_from(v).ok(),
            GgufMetadataValue::I16(v) => u64::try_from(v).ok(),
            GgufMetadataValue::I32(v) => u64::try_from(v).ok(),
            GgufMetadataValue::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }
}

/// Collection of GGUF metadata key-value pairs.
#[derive(Debug, Clone, Default)]
pub struct GgufMetadata {
    pub entries: HashMap<String, GgufMetadataValue>,
}

impl GgufMetadata {
    pub fn get(&self, key: &str) -> Option<&GgufMetadataValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn typed<'a, T>(
        &'a self,
        key: &str,
        expected: &'static str,
        pick: impl FnOnce(&'a GgufMetadataValue) -> Option<T>,
    ) -> Result<T> {
        let value = self
            .entries
            .get(key)
            .ok_or_else(|| ModelError::MissingKey(key.to_string()))?;
        pick(value).ok_or_else(|| ModelError::TypeMismatch {
            key: key.to_string(),
            expected: expected.to_string(),
            got: value.type_name().to_string(),
        })
    }

    pub fn get_string(&self, key: &str) -> Result<&str> {
        self.typed(key, "String", |v| match v {
            GgufMetadataValue::String(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn get_u32(&self, key: &str) -> Result<u32> {
        self.typed(key, "U32", |v| match v {
            GgufMetadataValue::U32(x) => Some(*x),
            _ => None,
        })
    }

    pub fn get_f32(&self, key: &str) -> Result<f32> {
        self.typed(key, "F32", |v| match v {
            GgufMetadataValue::F32(x) => Some(*x),
            _ => None,
        })
    }

    /// Any non-negative integer type, as usize.
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        self.typed(key, "unsigned integer", |v| {
            v.as_u64().and_then(|x| usize::try_from(x).ok())
        })
    }

    /// Like [`get_usize`](Self::get_usize), but `default` when the key is absent.
    pub fn get_usize_or(&self, key: &str, default: usize) -> Result<usize> {
        if self.contains(key) {
            self.get_usize(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_string_array(&self, key: &str) -> Result<Vec<String>> {
        let arr = self.typed(key, "Array", |v| match v {
            GgufMetadataValue::Array(a) => Some(a),
            _ => None,
        })?;
        arr.iter()
            .enumerate()
            .map(|(i, v)| match v {
                GgufMetadataValue::String(s) => Ok(s.clone()),
                other => Err(ModelError::TypeMismatch {
                    key: format!("{}[{}]", key, i),
                    expected: "String".to_string(),
                    got: other.type_name().to_string(),
                }),
            })
            .collect()
    }

    /// Tensor data alignment: `general.alignment`, or 32 when absent.
    pub fn alignment(&self) -> Result<usize> {
        let alignment = self.get_usize_or(KEY_ALIGNMENT, GGUF_DEFAULT_ALIGNMENT)?;
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(ModelError::InvalidHparams(format!(
                "{} must be a power of two, got {}",
                KEY_ALIGNMENT, alignment
            )));
        }
        Ok(alignment)
    }

    /// Parse `n_kv` key-value metadata entries from a reader.
    ///
    /// Each entry is a GGUF string key, a u32 value type id, then the value
    /// payload whose format depends on the type id.
    pub fn parse_kv(reader: &mut impl Read, n_kv: u64) -> Result<GgufMetadata> {
        let mut entries = HashMap::new();
        for _ in 0..n_kv {
            let key = read_string(reader)?;
            let type_id = read_u32(reader)?;
            let value = read_value(reader, type_id)?;
            entries.insert(key, value);
        }
        Ok(GgufMetadata { entries })
    }
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a single GGUF metadata value given its type id.
fn read_value(reader: &mut impl Read, type_id: u32) -> Result<GgufMetadataValue> {
    use GgufMetadataValue as V;
    let value = match type_id {
        0 => V::U8(read_array::<1>(reader)?[0]),
        1 => V::I8(read_array::<1>(reader)?[0] as i8),
        2 => V::U16(u16::from_le_bytes(read_array(reader)?)),
        3 => V::I16(i16::from_le_bytes(read_array(reader)?)),
        4 => V::U32(read_u32(reader)?),
        5 => V::I32(i32::from_le_bytes(read_array(reader)?)),
        6 => V::F32(f32::from_le_bytes(read_array(reader)?)),
        7 => V::Bool(read_array::<1>(reader)?[0] != 0),
        8 => V::String(read_string(reader)?),
        9 => {
            // u32 element type, u64 count, then count values of that type.
            let elem_type = read_u32(reader)?;
            let count = read_u64(reader)?;
            let mut values = Vec::with_capacity((count as usize).min(MAX_ARRAY_PREALLOC));
            for _ in 0..count {
                values.push(read_value(reader, elem_type)?);
            }
            V::Array(values)
        }
        10 => V::U64(read_u64(reader)?),
        11 => V::I64(i64::from_le_bytes(read_array(reader)?)),
        12 => V::F64(f64::from_le_bytes(read_array(reader)?)),
        other => return Err(ModelError::UnsupportedType(other)),
    };
    Ok(value)
}
