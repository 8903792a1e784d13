use crate::address::{BlockId, DataAddress};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BasaltError>;

/// Coarse classification used to drive retry and escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure or "not connected"; retried or rerouted locally.
    Connection,
    /// A proposal did not reach a majority of the cluster.
    Quorum,
    /// A racing allocator already claimed the block.
    Conflict,
    /// Checksum mismatch on a replica response.
    Corruption,
    /// Unknown command or malformed arguments.
    Protocol,
    /// The service can no longer process requests.
    Fatal,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Quorum => "quorum",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum BasaltError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection to {address} failed: {message}")]
    Connection { address: String, message: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Quorum not reached: {acknowledged} of {members} members acknowledged")]
    Quorum { acknowledged: usize, members: usize },

    #[error("Block already allocated: {0}")]
    BlockAlreadyAllocated(BlockId),

    #[error("No block servers available")]
    NoBlockServersAvailable,

    #[error("Checksum mismatch for node {address}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        address: DataAddress,
        expected: u32,
        actual: u32,
    },

    #[error("Block {block_id} checksum differs after transfer: local {local:x}, remote {remote:x}")]
    TransferChecksumMismatch {
        block_id: BlockId,
        local: u64,
        remote: u64,
    },

    #[error("Block unavailable on every replica: {0}")]
    BlockUnavailable(BlockId),

    #[error("Node not found: {0}")]
    NodeNotFound(DataAddress),

    #[error("Unknown path type: {0}")]
    UnknownPathType(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote {} error: {message}", kind.as_str())]
    Remote { kind: ErrorKind, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BasaltError::Connection { .. } | BasaltError::NotConnected(_) => ErrorKind::Connection,
            BasaltError::Quorum { .. } => ErrorKind::Quorum,
            BasaltError::BlockAlreadyAllocated(_) => ErrorKind::Conflict,
            BasaltError::ChecksumMismatch { .. } | BasaltError::TransferChecksumMismatch { .. } => {
                ErrorKind::Corruption
            }
            BasaltError::Protocol(_)
            | BasaltError::InvalidRequest(_)
            | BasaltError::UnknownPathType(_)
            | BasaltError::NodeNotFound(_)
            | BasaltError::Serialization(_) => ErrorKind::Protocol,
            BasaltError::Io(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::OutOfMemory | std::io::ErrorKind::StorageFull
                ) =>
            {
                ErrorKind::Fatal
            }
            BasaltError::Remote { kind, .. } => *kind,
            BasaltError::Io(_)
            | BasaltError::Database(_)
            | BasaltError::Config(_)
            | BasaltError::Http(_)
            | BasaltError::NoBlockServersAvailable
            | BasaltError::BlockUnavailable(_)
            | BasaltError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_connection_fault(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    pub fn connection(address: impl Into<String>, message: impl Into<String>) -> Self {
        BasaltError::Connection {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Rebuilds an error received from a remote service.
    pub fn remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        BasaltError::Remote {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_drive_retry_classification() {
        assert!(BasaltError::connection("10.0.0.1:7000", "refused").is_connection_fault());
        assert!(BasaltError::NotConnected("sync pending".to_string()).is_connection_fault());
        assert_eq!(
            BasaltError::Quorum {
                acknowledged: 1,
                members: 3
            }
            .kind(),
            ErrorKind::Quorum
        );
        assert_eq!(
            BasaltError::BlockAlreadyAllocated(BlockId::new(0, 7)).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            BasaltError::remote(ErrorKind::Corruption, "bad crc").kind(),
            ErrorKind::Corruption
        );
    }

    #[test]
    fn exhausted_resources_are_fatal() {
        let full = std::io::Error::from(std::io::ErrorKind::StorageFull);
        assert_eq!(BasaltError::from(full).kind(), ErrorKind::Fatal);

        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(BasaltError::from(missing).kind(), ErrorKind::Internal);
    }
}
