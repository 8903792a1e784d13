//! Address and identity value types shared by every subsystem.

use crate::error::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Number of addressable slots inside one block.
pub const DATA_IDS_PER_BLOCK: u16 = 16384;
/// Distance between consecutive blocks opened by the same manager.
pub const BLOCK_STRIDE: u64 = 256;

const DATA_ID_BITS: u32 = 14;

/// Identifier of a fixed-capacity storage unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub high: u64,
    pub low: u64,
}

impl BlockId {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Adds `n` to the low word, carrying into the high word.
    pub fn add(&self, n: u64) -> Self {
        let (low, carried) = self.low.overflowing_add(n);
        let high = if carried {
            self.high.wrapping_add(1)
        } else {
            self.high
        };
        Self { high, low }
    }

    pub fn to_be_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.high.to_be_bytes());
        bytes[8..].copy_from_slice(&self.low.to_be_bytes());
        bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_be_bytes())
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|error| BasaltError::InvalidRequest(format!("invalid block id: {}", error)))?;
        if bytes.len() != 16 {
            return Err(BasaltError::InvalidRequest(format!(
                "invalid block id length: {}",
                bytes.len()
            )));
        }

        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&bytes[..8]);
        low.copy_from_slice(&bytes[8..]);
        Ok(Self {
            high: u64::from_be_bytes(high),
            low: u64::from_be_bytes(low),
        })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Deserialize)]
struct DataAddressRepr {
    block_id: BlockId,
    data_id: u16,
}

/// One slot inside a block. Ordered by block first, then slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "DataAddressRepr")]
pub struct DataAddress {
    block_id: BlockId,
    data_id: u16,
}

impl TryFrom<DataAddressRepr> for DataAddress {
    type Error = BasaltError;

    fn try_from(repr: DataAddressRepr) -> Result<Self> {
        DataAddress::new(repr.block_id, repr.data_id)
    }
}

impl DataAddress {
    pub fn new(block_id: BlockId, data_id: u16) -> Result<Self> {
        if data_id >= DATA_IDS_PER_BLOCK {
            return Err(BasaltError::InvalidRequest(format!(
                "data id {} out of range for block {}",
                data_id, block_id
            )));
        }

        Ok(Self { block_id, data_id })
    }

    pub fn first_in(block_id: BlockId) -> Self {
        Self {
            block_id,
            data_id: 0,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn data_id(&self) -> u16 {
        self.data_id
    }

    /// Next address in allocation order. The flag is set when the slot
    /// space of the block is exhausted and the address moved `stride`
    /// blocks ahead.
    pub fn next(&self, stride: u64) -> (Self, bool) {
        let data_id = self.data_id + 1;
        if data_id >= DATA_IDS_PER_BLOCK {
            (Self::first_in(self.block_id.add(stride)), true)
        } else {
            (
                Self {
                    block_id: self.block_id,
                    data_id,
                },
                false,
            )
        }
    }

    /// Packed `block_id << 14 | data_id` form. `None` when the block id
    /// uses the top 14 bits, which the packed form cannot carry.
    pub fn packed(&self) -> Option<u128> {
        let block = ((self.block_id.high as u128) << 64) | self.block_id.low as u128;
        if block >> (128 - DATA_ID_BITS) != 0 {
            return None;
        }
        Some((block << DATA_ID_BITS) | self.data_id as u128)
    }

    pub fn from_packed(value: u128) -> Self {
        let data_id = (value & ((1u128 << DATA_ID_BITS) - 1)) as u16;
        let block = value >> DATA_ID_BITS;
        Self {
            block_id: BlockId::new((block >> 64) as u64, block as u64),
            data_id,
        }
    }
}

impl fmt::Display for DataAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04x}", self.block_id, self.data_id)
    }
}

/// Reference to a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeId {
    /// A node persisted at a data address.
    Stored { address: DataAddress },
    /// An in-memory leaf of `length` bytes all equal to `fill`.
    Sparse { fill: u8, length: u32 },
}

impl From<DataAddress> for NodeId {
    fn from(address: DataAddress) -> Self {
        NodeId::Stored { address }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Stored { address } => write!(f, "{}", address),
            NodeId::Sparse { fill, length } => write!(f, "sparse({:02x}x{})", fill, length),
        }
    }
}

/// Unique identifier of one replicated log entry.
///
/// The high word carries the millisecond timestamp in its upper 48 bits,
/// so ordering follows wall-clock time across managers with small skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid {
    pub high: u64,
    pub low: u64,
}

impl Uid {
    pub const ZERO: Uid = Uid { high: 0, low: 0 };

    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    pub fn generate() -> Self {
        let value = Ulid::new().0;
        Self {
            high: (value >> 64) as u64,
            low: value as u64,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.high >> 16
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_add_carries_into_high() {
        let block = BlockId::new(3, u64::MAX - 1);
        assert_eq!(block.add(1), BlockId::new(3, u64::MAX));
        assert_eq!(block.add(2), BlockId::new(4, 0));
        assert!(block.add(2) > block);
    }

    #[test]
    fn block_id_hex_roundtrip() {
        let block = BlockId::new(0x0102, 0xfeed);
        let parsed = BlockId::from_hex(&block.to_hex()).unwrap();
        assert_eq!(parsed, block);
        assert!(BlockId::from_hex("abcd").is_err());
    }

    #[test]
    fn data_address_rejects_out_of_range_slot() {
        assert!(DataAddress::new(BlockId::new(0, 1), DATA_IDS_PER_BLOCK).is_err());
        let json = r#"{"block_id":{"high":0,"low":1},"data_id":16384}"#;
        assert!(serde_json::from_str::<DataAddress>(json).is_err());
    }

    #[test]
    fn data_address_next_crosses_block_boundary() {
        let block = BlockId::new(0, 5);
        let last = DataAddress::new(block, DATA_IDS_PER_BLOCK - 1).unwrap();
        let (next, crossed) = last.next(BLOCK_STRIDE);
        assert!(crossed);
        assert_eq!(next.block_id(), BlockId::new(0, 5 + BLOCK_STRIDE));
        assert_eq!(next.data_id(), 0);

        let (inside, crossed) = DataAddress::first_in(block).next(BLOCK_STRIDE);
        assert!(!crossed);
        assert_eq!(inside.data_id(), 1);
    }

    #[test]
    fn packed_order_matches_struct_order() {
        let a = DataAddress::new(BlockId::new(0, 9), 16383).unwrap();
        let b = DataAddress::new(BlockId::new(0, 10), 0).unwrap();
        let c = DataAddress::new(BlockId::new(1, 0), 2).unwrap();
        assert!(a < b && b < c);
        assert!(a.packed().unwrap() < b.packed().unwrap());
        assert!(b.packed().unwrap() < c.packed().unwrap());
        assert_eq!(DataAddress::from_packed(c.packed().unwrap()), c);
        assert!(
            DataAddress::first_in(BlockId::new(u64::MAX, 0))
                .packed()
                .is_none()
        );
    }

    #[test]
    fn generated_uids_are_unique_and_time_ordered() {
        let first = Uid::generate();
        let second = Uid::generate();
        assert_ne!(first, second);
        assert!(first.timestamp_ms() <= second.timestamp_ms());
        assert!(Uid::ZERO < first);
    }
}
