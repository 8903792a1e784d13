use crate::address::{BlockId, Uid};
use crate::error::{BasaltError, Result};
use crate::replication::{LogEntry, LogPayload};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// UIDs whose high words share a bucket are stored in one blob.
const BUCKET_DIVISOR: u64 = 16;

const SIGN_BIT: u64 = 1 << 63;

/// Maps an unsigned value onto i64 so SQLite integer order is unsigned order.
fn ordered(value: u64) -> i64 {
    (value ^ SIGN_BIT) as i64
}

fn unordered(value: i64) -> u64 {
    (value as u64) ^ SIGN_BIT
}

/// Local durable copy of the replicated log plus its secondary indexes.
pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
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
            .map_err(|_| BasaltError::Internal("log store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS log_buckets (
                bucket_id INTEGER PRIMARY KEY,
                records BLOB NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS log_uids (
                uid_high INTEGER NOT NULL,
                uid_low INTEGER NOT NULL,
                bucket_id INTEGER NOT NULL,
                PRIMARY KEY (uid_high, uid_low)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_index (
                key TEXT PRIMARY KEY,
                uid_high INTEGER NOT NULL,
                uid_low INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_index (
                block_high INTEGER NOT NULL,
                block_low INTEGER NOT NULL,
                uid_high INTEGER NOT NULL,
                uid_low INTEGER NOT NULL,
                PRIMARY KEY (block_high, block_low)
            )",
            [],
        )?;

        Ok(())
    }

    /// Applies a group of entries in one transaction. Entries whose UID was
    /// applied before are skipped. Returns how many entries were new.
    pub fn apply(&self, entries: &[LogEntry]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut applied = 0;
        for entry in entries {
            if uid_exists(&tx, entry.uid())? {
                continue;
            }
            append_record(&tx, entry)?;
            update_index(&tx, entry)?;
            applied += 1;
        }

        tx.commit()?;
        Ok(applied)
    }

    pub fn has_applied_uid(&self, uid: Uid) -> Result<bool> {
        let conn = self.conn()?;
        uid_exists(&conn, uid)
    }

    pub fn last_uid(&self) -> Result<Option<Uid>> {
        let conn = self.conn()?;
        let uid = conn
            .query_row(
                "SELECT uid_high, uid_low FROM log_uids
                 ORDER BY uid_high DESC, uid_low DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(uid.map(|(high, low)| Uid::new(unordered(high), unordered(low))))
    }

    pub fn entry_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM log_uids", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Entries in UID order starting after `from` (or at it when `inclusive`).
    pub fn entries_after(&self, from: Uid, inclusive: bool, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn()?;
        let sql = if inclusive {
            "SELECT uid_high, uid_low, bucket_id FROM log_uids
             WHERE uid_high > ?1 OR (uid_high = ?1 AND uid_low >= ?2)
             ORDER BY uid_high, uid_low LIMIT ?3"
        } else {
            "SELECT uid_high, uid_low, bucket_id FROM log_uids
             WHERE uid_high > ?1 OR (uid_high = ?1 AND uid_low > ?2)
             ORDER BY uid_high, uid_low LIMIT ?3"
        };

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(
            params![ordered(from.high), ordered(from.low), limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        let mut located = Vec::new();
        for row in rows {
            let (high, low, bucket_id) = row?;
            located.push((Uid::new(unordered(high), unordered(low)), bucket_id));
        }
        drop(stmt);

        let mut entries = Vec::with_capacity(located.len());
        for (uid, bucket_id) in located {
            entries.push(read_from_bucket(&conn, bucket_id, uid)?);
        }
        Ok(entries)
    }

    pub fn read_entry(&self, uid: Uid) -> Result<Option<LogEntry>> {
        let conn = self.conn()?;
        let bucket_id: Option<i64> = conn
            .query_row(
                "SELECT bucket_id FROM log_uids WHERE uid_high = ?1 AND uid_low = ?2",
                params![ordered(uid.high), ordered(uid.low)],
                |row| row.get(0),
            )
            .optional()?;

        match bucket_id {
            Some(bucket_id) => Ok(Some(read_from_bucket(&conn, bucket_id, uid)?)),
            None => Ok(None),
        }
    }

    /// Latest value for `key`; `None` when unset or deleted.
    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let Some(uid) = indexed_uid(
            &conn,
            "SELECT uid_high, uid_low FROM kv_index WHERE key = ?1",
            params![key],
        )?
        else {
            return Ok(None);
        };

        match read_indexed(&conn, uid)?.payload() {
            LogPayload::KeyValue { value, .. } => Ok(value.clone()),
            LogPayload::BlockServers { .. } => Err(BasaltError::Internal(format!(
                "key index for {} points at a block entry",
                key
            ))),
        }
    }

    pub fn get_block_servers(&self, block_id: BlockId) -> Result<Option<Vec<u64>>> {
        let conn = self.conn()?;
        let Some(uid) = indexed_uid(
            &conn,
            "SELECT uid_high, uid_low FROM block_index WHERE block_high = ?1 AND block_low = ?2",
            params![ordered(block_id.high), ordered(block_id.low)],
        )?
        else {
            return Ok(None);
        };

        match read_indexed(&conn, uid)?.payload() {
            LogPayload::BlockServers { server_guids, .. } => Ok(Some(server_guids.clone())),
            LogPayload::KeyValue { .. } => Err(BasaltError::Internal(format!(
                "block index for {} points at a key entry",
                block_id
            ))),
        }
    }

    /// Greatest block id with a recorded server set.
    pub fn last_block_id(&self) -> Result<Option<BlockId>> {
        let conn = self.conn()?;
        let block = conn
            .query_row(
                "SELECT block_high, block_low FROM block_index
                 ORDER BY block_high DESC, block_low DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(block.map(|(high, low)| BlockId::new(unordered(high), unordered(low))))
    }
}

fn uid_exists(conn: &Connection, uid: Uid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM log_uids WHERE uid_high = ?1 AND uid_low = ?2",
            params![ordered(uid.high), ordered(uid.low)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn append_record(tx: &Transaction<'_>, entry: &LogEntry) -> Result<()> {
    let uid = entry.uid();
    let bucket_id = ordered(uid.high / BUCKET_DIVISOR);
    let record = entry.encode_record()?;

    let existing: Option<Vec<u8>> = tx
        .query_row(
            "SELECT records FROM log_buckets WHERE bucket_id = ?1",
            params![bucket_id],
            |row| row.get(0),
        )
        .optional()?;

    let mut records = existing.unwrap_or_default();
    records.extend_from_slice(&record);
    tx.execute(
        "INSERT OR REPLACE INTO log_buckets (bucket_id, records) VALUES (?1, ?2)",
        params![bucket_id, records],
    )?;

    tx.execute(
        "INSERT INTO log_uids (uid_high, uid_low, bucket_id) VALUES (?1, ?2, ?3)",
        params![ordered(uid.high), ordered(uid.low), bucket_id],
    )?;
    Ok(())
}

fn update_index(tx: &Transaction<'_>, entry: &LogEntry) -> Result<()> {
    let uid = entry.uid();
    match entry.payload() {
        LogPayload::KeyValue { key, .. } => {
            let current = indexed_uid(
                tx,
                "SELECT uid_high, uid_low FROM kv_index WHERE key = ?1",
                params![key],
            )?;
            if current.is_some_and(|current| current >= uid) {
                return Ok(());
            }
            tx.execute(
                "INSERT OR REPLACE INTO kv_index (key, uid_high, uid_low) VALUES (?1, ?2, ?3)",
                params![key, ordered(uid.high), ordered(uid.low)],
            )?;
        }
        LogPayload::BlockServers { block_id, .. } => {
            let current = indexed_uid(
                tx,
                "SELECT uid_high, uid_low FROM block_index WHERE block_high = ?1 AND block_low = ?2",
                params![ordered(block_id.high), ordered(block_id.low)],
            )?;
            if current.is_some_and(|current| current >= uid) {
                return Ok(());
            }
            tx.execute(
                "INSERT OR REPLACE INTO block_index (block_high, block_low, uid_high, uid_low)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    ordered(block_id.high),
                    ordered(block_id.low),
                    ordered(uid.high),
                    ordered(uid.low)
                ],
            )?;
        }
    }
    Ok(())
}

fn indexed_uid(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Option<Uid>> {
    let uid = conn
        .query_row(sql, params, |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .optional()?;
    Ok(uid.map(|(high, low)| Uid::new(unordered(high), unordered(low))))
}

fn read_indexed(conn: &Connection, uid: Uid) -> Result<LogEntry> {
    let bucket_id: i64 = conn.query_row(
        "SELECT bucket_id FROM log_uids WHERE uid_high = ?1 AND uid_low = ?2",
        params![ordered(uid.high), ordered(uid.low)],
        |row| row.get(0),
    )?;
    read_from_bucket(conn, bucket_id, uid)
}

fn read_from_bucket(conn: &Connection, bucket_id: i64, uid: Uid) -> Result<LogEntry> {
    let records: Vec<u8> = conn.query_row(
        "SELECT records FROM log_buckets WHERE bucket_id = ?1",
        params![bucket_id],
        |row| row.get(0),
    )?;

    LogEntry::scan_bucket(&records, uid)?.ok_or_else(|| {
        BasaltError::Internal(format!("log entry {} missing from bucket {}", uid, bucket_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn kv(uid: Uid, key: &str, value: Option<&str>) -> LogEntry {
        LogEntry::new(
            uid,
            LogPayload::KeyValue {
                key: key.to_string(),
                value: value.map(|value| value.to_string()),
            },
        )
    }

    fn bs(uid: Uid, block_id: BlockId, guids: &[u64]) -> LogEntry {
        LogEntry::new(
            uid,
            LogPayload::BlockServers {
                block_id,
                server_guids: guids.to_vec(),
            },
        )
    }

    #[test]
    fn replaying_an_entry_twice_leaves_identical_state() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path().join("log.db")).unwrap();
        let entry = kv(Uid::new(100, 1), "alpha", Some("one"));

        assert_eq!(store.apply(std::slice::from_ref(&entry)).unwrap(), 1);
        let count = store.entry_count().unwrap();

        assert_eq!(store.apply(std::slice::from_ref(&entry)).unwrap(), 0);
        assert_eq!(store.entry_count().unwrap(), count);
        assert_eq!(store.get_value("alpha").unwrap().as_deref(), Some("one"));
        assert!(store.has_applied_uid(entry.uid()).unwrap());
    }

    #[test]
    fn greater_uid_wins_regardless_of_apply_order() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path().join("log.db")).unwrap();

        store
            .apply(&[kv(Uid::new(200, 5), "alpha", Some("newer"))])
            .unwrap();
        store
            .apply(&[kv(Uid::new(200, 4), "alpha", Some("older"))])
            .unwrap();
        assert_eq!(store.get_value("alpha").unwrap().as_deref(), Some("newer"));

        store.apply(&[kv(Uid::new(300, 0), "alpha", None)]).unwrap();
        assert_eq!(store.get_value("alpha").unwrap(), None);
    }

    #[test]
    fn block_index_tracks_last_block() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path().join("log.db")).unwrap();
        assert_eq!(store.last_block_id().unwrap(), None);

        store
            .apply(&[
                bs(Uid::new(1, 1), BlockId::new(0, 3), &[1, 2]),
                bs(Uid::new(1, 2), BlockId::new(0, 259), &[2, 3]),
                bs(Uid::new(1, 3), BlockId::new(0, 3), &[1, 2, 4]),
            ])
            .unwrap();

        assert_eq!(store.last_block_id().unwrap(), Some(BlockId::new(0, 259)));
        assert_eq!(
            store.get_block_servers(BlockId::new(0, 3)).unwrap(),
            Some(vec![1, 2, 4])
        );
        assert_eq!(store.get_block_servers(BlockId::new(0, 4)).unwrap(), None);
    }

    #[test]
    fn entries_stream_in_uid_order_across_buckets() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path().join("log.db")).unwrap();

        let uids = [
            Uid::new(u64::MAX, 0),
            Uid::new(1, 9),
            Uid::new(40, 0),
            Uid::new(1, 2),
            Uid::new(17, 3),
        ];
        let entries: Vec<_> = uids
            .iter()
            .enumerate()
            .map(|(i, uid)| kv(*uid, &format!("k{}", i), Some("v")))
            .collect();
        store.apply(&entries).unwrap();

        let streamed: Vec<Uid> = store
            .entries_after(Uid::ZERO, false, 32)
            .unwrap()
            .iter()
            .map(|entry| entry.uid())
            .collect();
        assert_eq!(
            streamed,
            vec![
                Uid::new(1, 2),
                Uid::new(1, 9),
                Uid::new(17, 3),
                Uid::new(40, 0),
                Uid::new(u64::MAX, 0)
            ]
        );

        let tail = store.entries_after(Uid::new(17, 3), true, 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].uid(), Uid::new(17, 3));
        assert_eq!(tail[1].uid(), Uid::new(40, 0));

        assert_eq!(store.last_uid().unwrap(), Some(Uid::new(u64::MAX, 0)));
        assert_eq!(
            store.read_entry(Uid::new(1, 9)).unwrap().map(|entry| entry.uid()),
            Some(Uid::new(1, 9))
        );
    }
}
