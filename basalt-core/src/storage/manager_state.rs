use crate::cluster::{BlockServiceInfo, ServiceRole};
use crate::error::{BasaltError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const META_UNIQUE_ID: &str = "unique_id";

/// Membership records and manager identity that survive restarts.
pub struct ManagerStateStore {
    conn: Mutex<Connection>,
}

impl ManagerStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BasaltError::Internal("manager state lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS servers (
                address TEXT NOT NULL,
                role TEXT NOT NULL,
                server_guid INTEGER,
                PRIMARY KEY (address, role)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS manager_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn unique_id(&self) -> Result<Option<u8>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM manager_meta WHERE key = ?1",
                params![META_UNIQUE_ID],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|value| {
                value.parse::<u8>().map_err(|error| {
                    BasaltError::Internal(format!("invalid stored unique id {}: {}", value, error))
                })
            })
            .transpose()
    }

    pub fn set_unique_id(&self, unique_id: u8) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO manager_meta (key, value) VALUES (?1, ?2)",
            params![META_UNIQUE_ID, unique_id.to_string()],
        )?;
        Ok(())
    }

    /// Registers a block server, replacing the guid of an existing record.
    pub fn register_block_server(&self, info: &BlockServiceInfo) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO servers (address, role, server_guid) VALUES (?1, ?2, ?3)",
            params![
                info.address,
                ServiceRole::Block.as_str(),
                info.server_guid as i64
            ],
        )?;
        Ok(())
    }

    /// Returns whether a record was removed.
    pub fn deregister_block_server(&self, address: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM servers WHERE address = ?1 AND role = ?2",
            params![address, ServiceRole::Block.as_str()],
        )?;
        Ok(removed > 0)
    }

    pub fn block_servers(&self) -> Result<Vec<BlockServiceInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, server_guid FROM servers WHERE role = ?1 ORDER BY server_guid",
        )?;
        let rows = stmt.query_map(params![ServiceRole::Block.as_str()], |row| {
            Ok(BlockServiceInfo {
                address: row.get(0)?,
                server_guid: row.get::<_, i64>(1)? as u64,
            })
        })?;

        let mut servers = Vec::new();
        for row in rows {
            servers.push(row?);
        }
        Ok(servers)
    }

    pub fn add_server(&self, address: &str, role: ServiceRole) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO servers (address, role, server_guid) VALUES (?1, ?2, NULL)",
            params![address, role.as_str()],
        )?;
        Ok(())
    }

    pub fn servers(&self, role: ServiceRole) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT address FROM servers WHERE role = ?1 ORDER BY address")?;
        let rows = stmt.query_map(params![role.as_str()], |row| row.get::<_, String>(0))?;

        let mut servers = Vec::new();
        for row in rows {
            servers.push(row?);
        }
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn membership_and_identity_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manager.db");

        {
            let store = ManagerStateStore::open(&path).unwrap();
            assert_eq!(store.unique_id().unwrap(), None);
            store.set_unique_id(7).unwrap();
            store
                .register_block_server(&BlockServiceInfo {
                    server_guid: 42,
                    address: "b1:7100".to_string(),
                })
                .unwrap();
            store
                .register_block_server(&BlockServiceInfo {
                    server_guid: 43,
                    address: "b2:7100".to_string(),
                })
                .unwrap();
            store.add_server("r1:7200", ServiceRole::Root).unwrap();
        }

        let store = ManagerStateStore::open(&path).unwrap();
        assert_eq!(store.unique_id().unwrap(), Some(7));
        assert_eq!(store.block_servers().unwrap().len(), 2);
        assert_eq!(store.servers(ServiceRole::Root).unwrap(), vec!["r1:7200"]);

        assert!(store.deregister_block_server("b1:7100").unwrap());
        assert!(!store.deregister_block_server("b1:7100").unwrap());
        let remaining = store.block_servers().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].server_guid, 43);
    }
}
