use crate::address::{BlockId, DataAddress};
use crate::error::{BasaltError, Result};
use bytes::Bytes;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const NODE_EXTENSION: &str = "node";

/// File-backed node storage of a block server.
/// Layout: `blocks/{block_id}/{data_id}.node`.
pub struct BlockStore {
    base_path: PathBuf,
    open_blocks: Mutex<HashSet<BlockId>>,
}

impl BlockStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("blocks"))?;
        Ok(Self {
            base_path,
            open_blocks: Mutex::new(HashSet::new()),
        })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    pub async fn open_block(&self, block_id: BlockId) -> Result<()> {
        fs::create_dir_all(self.block_dir(block_id)).await?;
        self.open_set()?.insert(block_id);
        Ok(())
    }

    /// Flushes the block and drops it from the open set.
    pub async fn close_block(&self, block_id: BlockId) -> Result<()> {
        self.flush(block_id).await?;
        self.open_set()?.remove(&block_id);
        tracing::debug!("closed block {}", block_id);
        Ok(())
    }

    pub fn is_open(&self, block_id: BlockId) -> bool {
        self.open_blocks
            .lock()
            .map(|open| open.contains(&block_id))
            .unwrap_or(false)
    }

    pub async fn write_node(&self, address: DataAddress, data: Bytes) -> Result<()> {
        let block_id = address.block_id();
        if !self.is_open(block_id) {
            self.open_block(block_id).await?;
        }

        let node_path = self.node_path(address);
        let temp_path = node_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &node_path).await?;
        tracing::debug!("stored node {} ({} bytes)", address, data.len());
        Ok(())
    }

    pub async fn read_node(&self, address: DataAddress) -> Result<Option<Bytes>> {
        let node_path = self.node_path(address);
        match fs::read(&node_path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Returns whether the node existed.
    pub async fn delete_node(&self, address: DataAddress) -> Result<bool> {
        match fs::remove_file(self.node_path(address)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn flush(&self, block_id: BlockId) -> Result<()> {
        let block_dir = self.block_dir(block_id);
        if !fs::try_exists(&block_dir).await? {
            return Ok(());
        }
        let dir = fs::File::open(&block_dir).await?;
        dir.sync_all().await?;
        Ok(())
    }

    /// Slots present in the block, ascending.
    pub async fn list_nodes(&self, block_id: BlockId) -> Result<Vec<u16>> {
        let block_dir = self.block_dir(block_id);
        if !fs::try_exists(&block_dir).await? {
            return Ok(Vec::new());
        }

        let mut data_ids = Vec::new();
        let mut entries = fs::read_dir(&block_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(NODE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Ok(data_id) = u16::from_str_radix(stem, 16) {
                data_ids.push(data_id);
            }
        }

        data_ids.sort_unstable();
        Ok(data_ids)
    }

    /// CRC-32C over `(data_id, bytes)` of every node in slot order.
    pub async fn checksum(&self, block_id: BlockId) -> Result<u64> {
        let mut crc = 0u32;
        for data_id in self.list_nodes(block_id).await? {
            let address = DataAddress::new(block_id, data_id)?;
            let Some(data) = self.read_node(address).await? else {
                continue;
            };
            crc = crc32c::crc32c_append(crc, &data_id.to_be_bytes());
            crc = crc32c::crc32c_append(crc, &data);
        }
        Ok(crc as u64)
    }

    fn open_set(&self) -> Result<std::sync::MutexGuard<'_, HashSet<BlockId>>> {
        self.open_blocks
            .lock()
            .map_err(|_| BasaltError::Internal("block store lock poisoned".to_string()))
    }

    fn block_dir(&self, block_id: BlockId) -> PathBuf {
        self.base_path.join("blocks").join(block_id.to_hex())
    }

    fn node_path(&self, address: DataAddress) -> PathBuf {
        self.block_dir(address.block_id())
            .join(format!("{:04x}.{}", address.data_id(), NODE_EXTENSION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn nodes_are_written_read_and_deleted() {
        let dir = tempdir().unwrap();
        let store = BlockStore::new(dir.path().to_path_buf()).unwrap();
        let block = BlockId::new(0, 2);
        let address = DataAddress::new(block, 9).unwrap();

        assert_eq!(store.read_node(address).await.unwrap(), None);
        store
            .write_node(address, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(store.is_open(block));
        assert_eq!(
            store.read_node(address).await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        assert_eq!(store.list_nodes(block).await.unwrap(), vec![9]);

        assert!(store.delete_node(address).await.unwrap());
        assert!(!store.delete_node(address).await.unwrap());
        assert!(store.list_nodes(block).await.unwrap().is_empty());

        store.close_block(block).await.unwrap();
        assert!(!store.is_open(block));
    }

    #[tokio::test]
    async fn checksum_depends_on_content_not_write_order() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let a = BlockStore::new(dir_a.path().to_path_buf()).unwrap();
        let b = BlockStore::new(dir_b.path().to_path_buf()).unwrap();
        let block = BlockId::new(0, 1);
        let first = DataAddress::new(block, 0).unwrap();
        let second = DataAddress::new(block, 1).unwrap();

        a.write_node(first, Bytes::from_static(b"x")).await.unwrap();
        a.write_node(second, Bytes::from_static(b"y")).await.unwrap();
        b.write_node(second, Bytes::from_static(b"y")).await.unwrap();
        b.write_node(first, Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(a.checksum(block).await.unwrap(), b.checksum(block).await.unwrap());

        b.write_node(first, Bytes::from_static(b"z")).await.unwrap();
        assert_ne!(a.checksum(block).await.unwrap(), b.checksum(block).await.unwrap());
    }
}
