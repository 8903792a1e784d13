//! Network encoding of tree nodes.
//!
//! Header, big-endian: `[typeTag:i16][reserved:i16][crc32c:u32][count:i32]`.
//! A branch carries `count` i64 elements, a leaf `count` opaque bytes. The
//! checksum covers every byte after the checksum field.
//!
//! The checksum is CRC-32C (Castagnoli polynomial), not the IEEE CRC-32.
//! Block checksums use the same function, so the crc32 field of the node
//! format holds a CRC-32C value.

use crate::address::DataAddress;
use crate::error::{BasaltError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const LEAF_TYPE_TAG: i16 = 0x019e;
pub const BRANCH_TYPE_TAG: i16 = 0x022e;

const HEADER_LEN: usize = 12;
const CHECKSUM_END: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNode {
    Branch { elements: Vec<i64> },
    Leaf { data: Bytes },
}

impl TreeNode {
    pub fn leaf(data: impl Into<Bytes>) -> Self {
        TreeNode::Leaf { data: data.into() }
    }

    pub fn branch(elements: Vec<i64>) -> Self {
        TreeNode::Branch { elements }
    }

    /// In-memory leaf backing a sparse node id.
    pub fn sparse(fill: u8, length: u32) -> Self {
        TreeNode::Leaf {
            data: Bytes::from(vec![fill; length as usize]),
        }
    }

    pub fn type_tag(&self) -> i16 {
        match self {
            TreeNode::Branch { .. } => BRANCH_TYPE_TAG,
            TreeNode::Leaf { .. } => LEAF_TYPE_TAG,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                TreeNode::Branch { elements } => elements.len() * 8,
                TreeNode::Leaf { data } => data.len(),
            }
    }
}

pub fn encode(node: &TreeNode) -> Result<Bytes> {
    let (count, body_len) = match node {
        TreeNode::Branch { elements } => (elements.len(), elements.len() * 8),
        TreeNode::Leaf { data } => (data.len(), data.len()),
    };
    let count = i32::try_from(count)
        .map_err(|_| BasaltError::InvalidRequest(format!("node too large: {} elements", count)))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    buf.put_i16(node.type_tag());
    buf.put_i16(0);
    buf.put_u32(0);
    buf.put_i32(count);
    match node {
        TreeNode::Branch { elements } => {
            for element in elements {
                buf.put_i64(*element);
            }
        }
        TreeNode::Leaf { data } => buf.put_slice(data),
    }

    let crc = crc32c::crc32c(&buf[CHECKSUM_END..]);
    buf[4..CHECKSUM_END].copy_from_slice(&crc.to_be_bytes());
    Ok(buf.freeze())
}

/// Checks the stored checksum of an encoded node.
pub fn verify(address: DataAddress, bytes: &[u8]) -> Result<()> {
    if bytes.len() < HEADER_LEN {
        return Err(BasaltError::Protocol(format!(
            "node {} shorter than its header: {} bytes",
            address,
            bytes.len()
        )));
    }

    let expected = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let actual = crc32c::crc32c(&bytes[CHECKSUM_END..]);
    if expected != actual {
        return Err(BasaltError::ChecksumMismatch {
            address,
            expected,
            actual,
        });
    }
    Ok(())
}

pub fn decode(address: DataAddress, bytes: &[u8]) -> Result<TreeNode> {
    verify(address, bytes)?;

    let mut header = &bytes[..HEADER_LEN];
    let type_tag = header.get_i16();
    let _reserved = header.get_i16();
    let _crc = header.get_u32();
    let count = header.get_i32();
    if count < 0 {
        return Err(BasaltError::Protocol(format!(
            "node {} has negative count {}",
            address, count
        )));
    }
    let count = count as usize;
    let mut body = &bytes[HEADER_LEN..];

    match type_tag {
        BRANCH_TYPE_TAG => {
            if body.len() != count * 8 {
                return Err(BasaltError::Protocol(format!(
                    "branch {} declares {} elements but carries {} bytes",
                    address,
                    count,
                    body.len()
                )));
            }
            let elements = (0..count).map(|_| body.get_i64()).collect();
            Ok(TreeNode::Branch { elements })
        }
        LEAF_TYPE_TAG => {
            if body.len() != count {
                return Err(BasaltError::Protocol(format!(
                    "leaf {} declares {} bytes but carries {}",
                    address,
                    count,
                    body.len()
                )));
            }
            Ok(TreeNode::Leaf {
                data: Bytes::copy_from_slice(body),
            })
        }
        other => Err(BasaltError::Protocol(format!(
            "node {} has unknown type tag {:#06x}",
            address, other
        ))),
    }
}
