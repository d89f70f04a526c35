use std::fmt;

/// Element types a tensor can be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point (IEEE 754 half-precision).
    F16,
    /// 4-bit quantized, one f16 scale per block of 32.
    Q4_0,
    /// 4-bit quantized, f16 scale and f16 minimum per block of 32.
    Q4_1,
    /// 8-bit quantized, one f16 scale per block of 32.
    Q8_0,
    /// 32-bit signed integer (token ids, positions).
    I32,
}

impl DType {
    /// Bytes per element for plain types, bytes per block for quantized ones.
    ///
    /// - Q4_0: 2-byte scale + 16 bytes of nibbles
    /// - Q4_1: 2-byte scale + 2-byte min + 16 bytes of nibbles
    /// - Q8_0: 2-byte scale + 32 signed bytes
    pub fn type_size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::Q4_0 => 18,
            DType::Q4_1 => 20,
            DType::Q8_0 => 34,
        }
    }

    /// Elements per quantization block, 1 for plain types.
    pub fn block_size(&self) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::I32 => 1,
            DType::Q4_0 | DType::Q4_1 | DType::Q8_0 => 32,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.block_size() > 1
    }

    /// Byte size of one row of `n` elements. Returns `None` when `n` is not a
    /// whole number of blocks.
    pub fn row_size(&self, n: usize) -> Option<usize> {
        if n % self.block_size() != 0 {
            return None;
        }
        Some(n / self.block_size() * self.type_size())
    }

    /// Maps a tensor type id as stored in GGUF and legacy GGML files.
    pub fn from_type_id(id: u32) -> Option<DType> {
        match id {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::Q4_0),
            3 => Some(DType::Q4_1),
            8 => Some(DType::Q8_0),
            26 => Some(DType::I32),
            _ => None,
        }
    }

    pub fn type_id(&self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4_0 => 2,
            DType::Q4_1 => 3,
            DType::Q8_0 => 8,
            DType::I32 => 26,
        }
    }

    /// Maps a whole-file weight format (`ftype`) of legacy GGML model files to
    /// the dtype used for its matrices.
    pub fn from_ftype(ftype: u32) -> Option<DType> {
        match ftype {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::Q4_0),
            3 => Some(DType::Q4_1),
            7 => Some(DType::Q8_0),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Q4_0 => "q4_0",
            DType::Q4_1 => "q4_1",
            DType::Q8_0 => "q8_0",
            DType::I32 => "i32",
        };
        f.write_str(name)
    }
}
