//! Core type definitions for TabletFS

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a data block
///
/// Opaque to callers; the block manager that created the block is the only
/// component that knows how it maps to physical storage. Rendered as 16
/// lowercase hex digits.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
)]
pub struct BlockId(u64);

impl BlockId {
    /// Create from a raw 64-bit value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Hex string form, as used in file names
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for BlockId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(format!("block id must be 16 hex digits: {s}"));
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| format!("invalid block id {s}: {e}"))?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}
