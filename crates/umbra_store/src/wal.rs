//! Write-ahead log records and log manager.
//!
//! Every mutation a transaction stages is logged before commit. Records are
//! framed as `magic | version | type | len | payload | crc32`; a record with
//! a bad magic or checksum at the tail is treated as a torn write and ends
//! replay.

use crate::error::{StoreError, StoreResult};
use crate::types::{ClassId, ObjectId, TxnId};
use parking_lot::Mutex;
use umbra_storage::StorageBackend;

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"UWAL";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + type (1) + length (4).
const HEADER_SIZE: usize = 11;

/// CRC trailer size.
const CRC_SIZE: usize = 4;

/// Type tag of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Insert or update an object payload.
    Put = 1,
    /// Remove an object.
    Remove = 2,
    /// Set a name binding.
    SetBinding = 3,
    /// Remove a name binding.
    RemoveBinding = 4,
    /// Define a class descriptor.
    ClassDef = 5,
    /// Transaction reached the prepared state.
    Prepare = 6,
    /// Transaction committed.
    Commit = 7,
    /// Transaction aborted after prepare.
    Abort = 8,
}

impl LogRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Remove),
            3 => Some(Self::SetBinding),
            4 => Some(Self::RemoveBinding),
            5 => Some(Self::ClassDef),
            6 => Some(Self::Prepare),
            7 => Some(Self::Commit),
            8 => Some(Self::Abort),
            _ => None,
        }
    }

    /// Converts the record type to its byte tag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A single log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Insert or update an object payload.
    Put {
        /// Writing transaction.
        txn: TxnId,
        /// Object identifier.
        id: ObjectId,
        /// Serialized payload.
        bytes: Vec<u8>,
    },
    /// Remove an object.
    Remove {
        /// Writing transaction.
        txn: TxnId,
        /// Object identifier.
        id: ObjectId,
    },
    /// Bind a name to an object.
    SetBinding {
        /// Writing transaction.
        txn: TxnId,
        /// Internal (prefixed) binding name.
        name: String,
        /// Bound object.
        id: ObjectId,
    },
    /// Remove a name binding.
    RemoveBinding {
        /// Writing transaction.
        txn: TxnId,
        /// Internal (prefixed) binding name.
        name: String,
    },
    /// Assign a class ID to a descriptor.
    ClassDef {
        /// Writing transaction.
        txn: TxnId,
        /// Assigned class ID.
        class: ClassId,
        /// Descriptor bytes.
        descriptor: Vec<u8>,
    },
    /// All of the transaction's mutations are logged.
    Prepare {
        /// The prepared transaction.
        txn: TxnId,
    },
    /// The transaction's mutations take effect.
    Commit {
        /// The committed transaction.
        txn: TxnId,
        /// Object-ID high-water mark at commit, so allocation never
        /// regresses across restart.
        next_object_id: u64,
    },
    /// The transaction's mutations are discarded.
    Abort {
        /// The aborted transaction.
        txn: TxnId,
    },
}

impl LogRecord {
    /// Returns the record type tag.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Put { .. } => LogRecordType::Put,
            Self::Remove { .. } => LogRecordType::Remove,
            Self::SetBinding { .. } => LogRecordType::SetBinding,
            Self::RemoveBinding { .. } => LogRecordType::RemoveBinding,
            Self::ClassDef { .. } => LogRecordType::ClassDef,
            Self::Prepare { .. } => LogRecordType::Prepare,
            Self::Commit { .. } => LogRecordType::Commit,
            Self::Abort { .. } => LogRecordType::Abort,
        }
    }

    /// Returns the transaction this record belongs to.
    #[must_use]
    pub fn txn(&self) -> TxnId {
        match self {
            Self::Put { txn, .. }
            | Self::Remove { txn, .. }
            | Self::SetBinding { txn, .. }
            | Self::RemoveBinding { txn, .. }
            | Self::ClassDef { txn, .. }
            | Self::Prepare { txn }
            | Self::Commit { txn, .. }
            | Self::Abort { txn } => *txn,
        }
    }

    /// Serializes the record payload (without the frame envelope).
    pub fn encode_payload(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Put { txn, id, bytes } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                buf.extend_from_slice(&id.as_u64().to_le_bytes());
                let len = u32::try_from(bytes.len()).map_err(|_| {
                    StoreError::invalid_argument("object payload exceeds 4 GiB")
                })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            Self::Remove { txn, id } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                buf.extend_from_slice(&id.as_u64().to_le_bytes());
            }
            Self::SetBinding { txn, name, id } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                encode_str(&mut buf, name)?;
                buf.extend_from_slice(&id.as_u64().to_le_bytes());
            }
            Self::RemoveBinding { txn, name } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                encode_str(&mut buf, name)?;
            }
            Self::ClassDef {
                txn,
                class,
                descriptor,
            } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                buf.extend_from_slice(&class.as_u32().to_le_bytes());
                let len = u32::try_from(descriptor.len()).map_err(|_| {
                    StoreError::invalid_argument("class descriptor too large")
                })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(descriptor);
            }
            Self::Prepare { txn } | Self::Abort { txn } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
            }
            Self::Commit {
                txn,
                next_object_id,
            } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                buf.extend_from_slice(&next_object_id.to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Deserializes a record from its type tag and payload.
    pub fn decode_payload(record_type: LogRecordType, payload: &[u8]) -> StoreResult<Self> {
        let mut cursor = Cursor::new(payload);
        let record = match record_type {
            LogRecordType::Put => {
                let txn = TxnId::new(cursor.read_u64()?);
                let id = cursor.read_object_id()?;
                let bytes = cursor.read_bytes()?;
                Self::Put { txn, id, bytes }
            }
            LogRecordType::Remove => {
                let txn = TxnId::new(cursor.read_u64()?);
                let id = cursor.read_object_id()?;
                Self::Remove { txn, id }
            }
            LogRecordType::SetBinding => {
                let txn = TxnId::new(cursor.read_u64()?);
                let name = cursor.read_string()?;
                let id = cursor.read_object_id()?;
                Self::SetBinding { txn, name, id }
            }
            LogRecordType::RemoveBinding => {
                let txn = TxnId::new(cursor.read_u64()?);
                let name = cursor.read_string()?;
                Self::RemoveBinding { txn, name }
            }
            LogRecordType::ClassDef => {
                let txn = TxnId::new(cursor.read_u64()?);
                let class = ClassId::new(cursor.read_u32()?);
                let descriptor = cursor.read_bytes()?;
                Self::ClassDef {
                    txn,
                    class,
                    descriptor,
                }
            }
            LogRecordType::Prepare => Self::Prepare {
                txn: TxnId::new(cursor.read_u64()?),
            },
            LogRecordType::Commit => Self::Commit {
                txn: TxnId::new(cursor.read_u64()?),
                next_object_id: cursor.read_u64()?,
            },
            LogRecordType::Abort => Self::Abort {
                txn: TxnId::new(cursor.read_u64()?),
            },
        };
        cursor.expect_end()?;
        Ok(record)
    }
}

fn encode_str(buf: &mut Vec<u8>, s: &str) -> StoreResult<()> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| StoreError::invalid_argument("binding name exceeds 64 KiB"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked cursor over a record payload.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StoreError::corrupt("unexpected end of log payload"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u64(&mut self) -> StoreResult<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| StoreError::corrupt("invalid u64 in log payload"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_u32(&mut self) -> StoreResult<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| StoreError::corrupt("invalid u32 in log payload"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u16(&mut self) -> StoreResult<u16> {
        let bytes: [u8; 2] = self
            .take(2)?
            .try_into()
            .map_err(|_| StoreError::corrupt("invalid u16 in log payload"))?;
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_object_id(&mut self) -> StoreResult<ObjectId> {
        let raw = self.read_u64()?;
        ObjectId::new(raw).ok_or_else(|| StoreError::corrupt("zero object id in log payload"))
    }

    fn read_bytes(&mut self) -> StoreResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> StoreResult<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::corrupt("invalid UTF-8 in log payload"))
    }

    fn expect_end(&self) -> StoreResult<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(StoreError::corrupt(format!(
                "trailing bytes in log record: consumed {}, have {}",
                self.pos,
                self.data.len()
            )))
        }
    }
}

/// Computes the CRC32 checksum (IEEE polynomial) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

fn encode_frame(record: &LogRecord) -> StoreResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&LOG_MAGIC);
    data.extend_from_slice(&LOG_VERSION.to_le_bytes());
    data.push(record.record_type().as_byte());
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::invalid_argument("log record payload too large"))?;
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Manages appends to and replay of the write-ahead log.
pub struct LogManager {
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl LogManager {
    /// Creates a log manager over `backend`.
    #[must_use]
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    /// Appends a batch of records as one write, flushing if requested.
    pub fn append_all(&self, records: &[LogRecord], flush: bool) -> StoreResult<()> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&encode_frame(record)?);
        }
        let mut backend = self.backend.lock();
        backend.append(&data)?;
        if flush {
            backend.sync()?;
        }
        Ok(())
    }

    /// Appends a single record.
    pub fn append(&self, record: &LogRecord, flush: bool) -> StoreResult<()> {
        self.append_all(std::slice::from_ref(record), flush)
    }

    /// Reads every complete record in the log.
    ///
    /// A torn frame at the tail (short header, short payload, or checksum
    /// mismatch on the final record) ends the scan; anything before it is
    /// returned. A bad frame *followed by* readable data is corruption.
    pub fn replay(&self) -> StoreResult<Vec<LogRecord>> {
        let backend = self.backend.lock();
        let size = backend.size()?;
        let mut records = Vec::new();
        let mut offset = 0u64;

        while offset + (HEADER_SIZE as u64) <= size {
            let header = backend.read_at(offset, HEADER_SIZE)?;
            if header[0..4] != LOG_MAGIC {
                return Err(StoreError::corrupt(format!(
                    "bad log magic at offset {offset}"
                )));
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version > LOG_VERSION {
                return Err(StoreError::corrupt(format!(
                    "unsupported log version {version}"
                )));
            }
            let record_type = LogRecordType::from_byte(header[6]).ok_or_else(|| {
                StoreError::corrupt(format!("unknown log record type {}", header[6]))
            })?;
            let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;

            let frame_len = HEADER_SIZE as u64 + len + CRC_SIZE as u64;
            if offset + frame_len > size {
                // Torn tail from an interrupted append.
                tracing::warn!(offset, "truncated log record at tail; ending replay");
                break;
            }

            let frame = backend.read_at(offset, frame_len as usize)?;
            let body_end = HEADER_SIZE + len as usize;
            let stored_crc = u32::from_le_bytes([
                frame[body_end],
                frame[body_end + 1],
                frame[body_end + 2],
                frame[body_end + 3],
            ]);
            if compute_crc32(&frame[..body_end]) != stored_crc {
                if offset + frame_len == size {
                    tracing::warn!(offset, "checksum mismatch at tail; ending replay");
                    break;
                }
                return Err(StoreError::corrupt(format!(
                    "log checksum mismatch at offset {offset}"
                )));
            }

            records.push(LogRecord::decode_payload(
                record_type,
                &frame[HEADER_SIZE..body_end],
            )?);
            offset += frame_len;
        }

        Ok(records)
    }

    /// Discards the log and replaces it with `records` (used at checkpoint).
    pub fn reset(&self, records: &[LogRecord]) -> StoreResult<()> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&encode_frame(record)?);
        }
        let mut backend = self.backend.lock();
        backend.truncate(0)?;
        if !data.is_empty() {
            backend.append(&data)?;
        }
        backend.sync()?;
        Ok(())
    }

    /// Flushes buffered appends.
    pub fn flush(&self) -> StoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Returns the current log size in bytes.
    pub fn size(&self) -> StoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_storage::MemoryBackend;

    fn txn(n: u64) -> TxnId {
        TxnId::new(n)
    }

    fn oid(n: u64) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[test]
    fn record_type_roundtrip() {
        for t in [
            LogRecordType::Put,
            LogRecordType::Remove,
            LogRecordType::SetBinding,
            LogRecordType::RemoveBinding,
            LogRecordType::ClassDef,
            LogRecordType::Prepare,
            LogRecordType::Commit,
            LogRecordType::Abort,
        ] {
            assert_eq!(LogRecordType::from_byte(t.as_byte()), Some(t));
        }
    }

    #[test]
    fn payload_roundtrips() {
        let records = vec![
            LogRecord::Put {
                txn: txn(1),
                id: oid(7),
                bytes: vec![0xCA, 0xFE],
            },
            LogRecord::Remove {
                txn: txn(1),
                id: oid(7),
            },
            LogRecord::SetBinding {
                txn: txn(2),
                name: "a.counter".to_string(),
                id: oid(9),
            },
            LogRecord::RemoveBinding {
                txn: txn(2),
                name: "a.counter".to_string(),
            },
            LogRecord::ClassDef {
                txn: txn(3),
                class: ClassId::new(4),
                descriptor: b"demo::Player".to_vec(),
            },
            LogRecord::Prepare { txn: txn(3) },
            LogRecord::Commit {
                txn: txn(3),
                next_object_id: 10,
            },
            LogRecord::Abort { txn: txn(4) },
        ];
        for record in records {
            let payload = record.encode_payload().unwrap();
            let decoded = LogRecord::decode_payload(record.record_type(), &payload).unwrap();
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn append_and_replay() {
        let log = LogManager::new(Box::new(MemoryBackend::new()));
        let records = vec![
            LogRecord::Put {
                txn: txn(1),
                id: oid(1),
                bytes: vec![1, 2, 3],
            },
            LogRecord::Prepare { txn: txn(1) },
            LogRecord::Commit {
                txn: txn(1),
                next_object_id: 2,
            },
        ];
        log.append_all(&records, true).unwrap();
        assert_eq!(log.replay().unwrap(), records);
    }

    #[test]
    fn torn_tail_ends_replay() {
        let log = LogManager::new(Box::new(MemoryBackend::new()));
        log.append(
            &LogRecord::Prepare { txn: txn(1) },
            true,
        )
        .unwrap();

        // Simulate a torn append: a full second record minus its last byte.
        let frame = encode_frame(&LogRecord::Commit {
            txn: txn(1),
            next_object_id: 5,
        })
        .unwrap();
        log.backend.lock().append(&frame[..frame.len() - 1]).unwrap();

        let records = log.replay().unwrap();
        assert_eq!(records, vec![LogRecord::Prepare { txn: txn(1) }]);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let log = LogManager::new(Box::new(MemoryBackend::new()));
        log.backend.lock().append(b"XXXXXXXXXXXXXXXX").unwrap();
        assert!(matches!(
            log.replay().unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn reset_replaces_contents() {
        let log = LogManager::new(Box::new(MemoryBackend::new()));
        log.append(
            &LogRecord::Abort { txn: txn(1) },
            true,
        )
        .unwrap();

        let kept = vec![LogRecord::Prepare { txn: txn(2) }];
        log.reset(&kept).unwrap();
        assert_eq!(log.replay().unwrap(), kept);
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }
}
