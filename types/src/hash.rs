//! Content-addressed identifiers for blocks and transactions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte block identifier, the content hash of a block header.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRid([u8; 32]);

impl BlockRid {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Default for BlockRid {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for BlockRid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRid({}\u{2026})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for BlockRid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// A 32-byte transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxRid([u8; 32]);

impl TxRid {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TxRid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxRid({}\u{2026})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for TxRid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

// Inline hex encoding to keep this crate free of the `hex` dependency.
pub(crate) mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_full_hex() {
        let rid = BlockRid::new([0xab; 32]);
        assert_eq!(rid.to_string(), "ab".repeat(32));
        assert_eq!(rid.short(), "abababab");
    }

    #[test]
    fn zero_rid() {
        assert!(BlockRid::ZERO.is_zero());
        assert!(!BlockRid::new([1; 32]).is_zero());
        assert_eq!(BlockRid::default(), BlockRid::ZERO);
    }
}
