//! Binary descriptor persisted next to each cached shared library.
//!
//! Reuse of a disk artifact requires the stored descriptor to equal the one
//! computed for the current request byte for byte; there is no partial
//! matching and no parsing on the read side.

use veckern::{DType, Dialect, FpMode};

use super::cache::target_tag;
use crate::bridge::BRIDGE_ABI_VERSION;
use crate::codegen::CODEGEN_VERSION;

pub const META_MAGIC: [u8; 8] = *b"VKJITMD\0";
pub const META_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelMetadata {
    pub key: u64,
    pub fingerprint: u64,
    pub output: DType,
    pub dialect: Dialect,
    pub fp_mode: FpMode,
    pub params: Vec<DType>,
    /// Hash of the compiler command line
    pub toolchain_hash: u64,
}

impl KernelMetadata {
    /// Little-endian encoding; platform fields come from the running process.
    pub fn to_bytes(&self) -> Vec<u8> {
        let target = target_tag();
        let mut out = Vec::with_capacity(64 + target.len() + self.params.len());
        out.extend_from_slice(&META_MAGIC);
        out.extend_from_slice(&META_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&CODEGEN_VERSION.to_le_bytes());
        out.extend_from_slice(&BRIDGE_ABI_VERSION.to_le_bytes());
        out.extend_from_slice(&(target.len() as u32).to_le_bytes());
        out.extend_from_slice(target.as_bytes());
        out.push(std::mem::size_of::<usize>() as u8);
        out.extend_from_slice(&self.key.to_le_bytes());
        out.extend_from_slice(&self.fingerprint.to_le_bytes());
        out.push(self.output.code());
        out.push(self.dialect.code());
        out.push(self.fp_mode.code());
        out.extend_from_slice(&(self.params.len() as u32).to_le_bytes());
        out.extend(self.params.iter().map(|p| p.code()));
        out.extend_from_slice(&self.toolchain_hash.to_le_bytes());
        out
    }

    pub fn matches(&self, stored: &[u8]) -> bool {
        stored == self.to_bytes().as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KernelMetadata {
        KernelMetadata {
            key: 0xdead_beef,
            fingerprint: 42,
            output: DType::F64,
            dialect: Dialect::Vector,
            fp_mode: FpMode::Strict,
            params: vec![DType::F64, DType::I32],
            toolchain_hash: 7,
        }
    }

    #[test]
    fn test_starts_with_magic() {
        assert!(sample().to_bytes().starts_with(&META_MAGIC));
    }

    #[test]
    fn test_matches_exact_bytes_only() {
        let meta = sample();
        let bytes = meta.to_bytes();
        assert!(meta.matches(&bytes));

        for i in [0, 9, bytes.len() / 2, bytes.len() - 1] {
            let mut flipped = bytes.clone();
            flipped[i] ^= 0x01;
            assert!(!meta.matches(&flipped), "flip at {i} accepted");
        }
        assert!(!meta.matches(&bytes[..bytes.len() - 1]));
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(!meta.matches(&longer));
    }

    #[test]
    fn test_fields_change_encoding() {
        let base = sample().to_bytes();
        let mut other = sample();
        other.fp_mode = FpMode::Fast;
        assert_ne!(other.to_bytes(), base);
        let mut other = sample();
        other.toolchain_hash = 8;
        assert_ne!(other.to_bytes(), base);
    }
}
