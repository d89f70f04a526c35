use std::io::Read;

use super::{read_u32, read_u64};
use crate::error::{ModelError, Result};

/// The four-byte magic number identifying a GGUF file: ASCII "GGUF".
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Default alignment (in bytes) for tensor data within a GGUF file.
pub const GGUF_DEFAULT_ALIGNMENT: usize = 32;

/// GGUF versions this reader understands. Both use 64-bit counts.
pub const GGUF_SUPPORTED_VERSIONS: [u32; 2] = [2, 3];

/// Parsed GGUF file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    /// Number of tensors stored in the file.
    pub n_tensors: u64,
    /// Number of key-value metadata entries.
    pub n_kv: u64,
}

impl GgufHeader {
    /// Parse a GGUF header from the beginning of a reader.
    ///
    /// Reads and validates the magic, then the version (u32 LE), tensor
    /// count (u64 LE), and KV count (u64 LE).
    pub fn parse(reader: &mut impl Read) -> Result<GgufHeader> {
        let magic = read_u32(reader)?;
        if magic != GGUF_MAGIC {
            return Err(ModelError::InvalidMagic {
                expected: GGUF_MAGIC,
                got: magic,
            });
        }

        let version = read_u32(reader)?;
        if !GGUF_SUPPORTED_VERSIONS.contains(&version) {
            return Err(ModelError::UnsupportedVersion(version));
        }

        let n_tensors = read_u64(reader)?;
        let n_kv = read_u64(reader)?;

        Ok(GgufHeader {
            version,
            n_tensors,
            n_kv,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(magic: u32, version: u32) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&magic.to_le_bytes());
        b.extend_from_slice(&version.to_le_bytes());
        b.extend_from_slice(&7u64.to_le_bytes());
        b.extend_from_slice(&3u64.to_le_bytes());
        b
    }

    #[test]
    fn test_parse_v2_and_v3() {
        for version in [2, 3] {
            let h = GgufHeader::parse(&mut header_bytes(GGUF_MAGIC, version).as_slice()).unwrap();
            assert_eq!(h.version, version);
            assert_eq!(h.n_tensors, 7);
            assert_eq!(h.n_kv, 3);
        }
    }

    #[test]
    fn test_bad_magic() {
        let err = GgufHeader::parse(&mut header_bytes(0x6767_6d6c, 3).as_slice()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidMagic { got: 0x6767_6d6c, .. }));
    }

    #[test]
    fn test_unsupported_version() {
        let err = GgufHeader::parse(&mut header_bytes(GGUF_MAGIC, 1).as_slice()).unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedVersion(1)));
    }

    #[test]
    fn test_truncated() {
        let bytes = header_bytes(GGUF_MAGIC, 3);
        assert!(matches!(
            GgufHeader::parse(&mut &bytes[..10]),
            Err(ModelError::Io(_))
        ));
    }
}
