//! Replicated log entries and their bucket record encoding.
//!
//! Record layout, big-endian:
//! `[totalLength:i32][uidHigh:i64][uidLow:i64][payload]`, where
//! `totalLength` counts the whole record including itself.

use crate::address::{BlockId, Uid};
use crate::error::{BasaltError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const RECORD_HEADER_LEN: usize = 4 + 8 + 8;

const PAYLOAD_KEY_VALUE: u8 = 1;
const PAYLOAD_BLOCK_SERVERS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogPayload {
    KeyValue {
        key: String,
        value: Option<String>,
    },
    BlockServers {
        block_id: BlockId,
        server_guids: Vec<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    uid: Uid,
    payload: LogPayload,
}

impl LogEntry {
    pub fn new(uid: Uid, payload: LogPayload) -> Self {
        Self { uid, payload }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn payload(&self) -> &LogPayload {
        &self.payload
    }

    pub fn encode_record(&self) -> Result<Bytes> {
        let payload = encode_payload(&self.payload)?;
        let total = RECORD_HEADER_LEN + payload.len();
        let total = i32::try_from(total)
            .map_err(|_| BasaltError::InvalidRequest(format!("log entry too large: {}", total)))?;

        let mut buf = BytesMut::with_capacity(total as usize);
        buf.put_i32(total);
        buf.put_i64(self.uid.high as i64);
        buf.put_i64(self.uid.low as i64);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decodes the record at the start of `buf`, returning it with its length.
    pub fn decode_record(buf: &[u8]) -> Result<(LogEntry, usize)> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(corrupt("truncated record header"));
        }

        let mut cursor = buf;
        let total = cursor.get_i32();
        if total < RECORD_HEADER_LEN as i32 || total as usize > buf.len() {
            return Err(corrupt(&format!("invalid record length {}", total)));
        }
        let total = total as usize;
        let uid = Uid::new(cursor.get_i64() as u64, cursor.get_i64() as u64);
        let payload = decode_payload(&buf[RECORD_HEADER_LEN..total])?;

        Ok((LogEntry::new(uid, payload), total))
    }

    /// Finds the record for `uid` in a bucket by linear scan.
    pub fn scan_bucket(bucket: &[u8], uid: Uid) -> Result<Option<LogEntry>> {
        let mut offset = 0;
        while offset < bucket.len() {
            let (entry, length) = Self::decode_record(&bucket[offset..])?;
            if entry.uid == uid {
                return Ok(Some(entry));
            }
            offset += length;
        }
        Ok(None)
    }
}

fn corrupt(message: &str) -> BasaltError {
    BasaltError::Internal(format!("corrupt log record: {}", message))
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let length = u32::try_from(value.len())
        .map_err(|_| BasaltError::InvalidRequest("string too long".to_string()))?;
    buf.put_u32(length);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(corrupt("truncated string length"));
    }
    let length = buf.get_u32() as usize;
    if buf.remaining() < length {
        return Err(corrupt("truncated string"));
    }
    let value = String::from_utf8(buf[..length].to_vec())
        .map_err(|_| corrupt("string is not utf-8"))?;
    buf.advance(length);
    Ok(value)
}

fn encode_payload(payload: &LogPayload) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    match payload {
        LogPayload::KeyValue { key, value } => {
            buf.put_u8(PAYLOAD_KEY_VALUE);
            put_string(&mut buf, key)?;
            match value {
                Some(value) => {
                    buf.put_u8(1);
                    put_string(&mut buf, value)?;
                }
                None => buf.put_u8(0),
            }
        }
        LogPayload::BlockServers {
            block_id,
            server_guids,
        } => {
            buf.put_u8(PAYLOAD_BLOCK_SERVERS);
            buf.put_u64(block_id.high);
            buf.put_u64(block_id.low);
            buf.put_u32(server_guids.len() as u32);
            for guid in server_guids {
                buf.put_u64(*guid);
            }
        }
    }
    Ok(buf)
}

fn decode_payload(mut buf: &[u8]) -> Result<LogPayload> {
    if !buf.has_remaining() {
        return Err(corrupt("empty payload"));
    }

    match buf.get_u8() {
        PAYLOAD_KEY_VALUE => {
            let key = get_string(&mut buf)?;
            if !buf.has_remaining() {
                return Err(corrupt("missing value flag"));
            }
            let value = match buf.get_u8() {
                0 => None,
                _ => Some(get_string(&mut buf)?),
            };
            Ok(LogPayload::KeyValue { key, value })
        }
        PAYLOAD_BLOCK_SERVERS => {
            if buf.remaining() < 20 {
                return Err(corrupt("truncated block servers payload"));
            }
            let block_id = BlockId::new(buf.get_u64(), buf.get_u64());
            let count = buf.get_u32() as usize;
            if buf.remaining() < count * 8 {
                return Err(corrupt("truncated server guid list"));
            }
            let server_guids = (0..count).map(|_| buf.get_u64()).collect();
            Ok(LogPayload::BlockServers {
                block_id,
                server_guids,
            })
        }
        tag => Err(corrupt(&format!("unknown payload tag {}", tag))),
    }
}
