//! Checkpoint images of the committed store state.
//!
//! A snapshot captures the full committed tables so the log can be
//! truncated. The encoding is deterministic: maps are written in key order.

use crate::error::{StoreError, StoreResult};
use crate::types::{ClassId, ObjectId};
use std::collections::BTreeMap;

/// Magic bytes for a snapshot image.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"USNP";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// A point-in-time image of the committed store state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreImage {
    /// Next object ID to allocate.
    pub next_object_id: u64,
    /// Next class ID to assign.
    pub next_class_id: u32,
    /// Committed object payloads.
    pub objects: BTreeMap<ObjectId, Vec<u8>>,
    /// Committed name bindings (internal, prefixed names).
    pub bindings: BTreeMap<String, ObjectId>,
    /// Committed class descriptors by ID.
    pub classes: BTreeMap<ClassId, Vec<u8>>,
}

impl StoreImage {
    /// Encodes the image to bytes, with a trailing CRC32.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.next_object_id.to_le_bytes());
        buf.extend_from_slice(&self.next_class_id.to_le_bytes());

        let object_count = u64::try_from(self.objects.len())
            .map_err(|_| StoreError::corrupt("object table too large to snapshot"))?;
        buf.extend_from_slice(&object_count.to_le_bytes());
        for (id, bytes) in &self.objects {
            buf.extend_from_slice(&id.as_u64().to_le_bytes());
            let len = u32::try_from(bytes.len())
                .map_err(|_| StoreError::corrupt("object payload exceeds 4 GiB"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(bytes);
        }

        let binding_count = u64::try_from(self.bindings.len())
            .map_err(|_| StoreError::corrupt("binding table too large to snapshot"))?;
        buf.extend_from_slice(&binding_count.to_le_bytes());
        for (name, id) in &self.bindings {
            let name_bytes = name.as_bytes();
            let len = u16::try_from(name_bytes.len())
                .map_err(|_| StoreError::corrupt("binding name exceeds 64 KiB"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(name_bytes);
            buf.extend_from_slice(&id.as_u64().to_le_bytes());
        }

        let class_count = u32::try_from(self.classes.len())
            .map_err(|_| StoreError::corrupt("class table too large to snapshot"))?;
        buf.extend_from_slice(&class_count.to_le_bytes());
        for (class, descriptor) in &self.classes {
            buf.extend_from_slice(&class.as_u32().to_le_bytes());
            let len = u32::try_from(descriptor.len())
                .map_err(|_| StoreError::corrupt("class descriptor too large"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(descriptor);
        }

        let crc = crate::wal::compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes an image from bytes, verifying magic, version, and CRC.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        if data.len() < 4 + 2 + 4 {
            return Err(StoreError::corrupt("snapshot too short"));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crate::wal::compute_crc32(body) != stored_crc {
            return Err(StoreError::corrupt("snapshot checksum mismatch"));
        }

        let mut cursor = ImageCursor { data: body, pos: 0 };
        if cursor.take(4)? != SNAPSHOT_MAGIC {
            return Err(StoreError::corrupt("invalid snapshot magic"));
        }
        let version = cursor.read_u16()?;
        if version > SNAPSHOT_VERSION {
            return Err(StoreError::corrupt(format!(
                "unsupported snapshot version {version}"
            )));
        }

        let next_object_id = cursor.read_u64()?;
        let next_class_id = cursor.read_u32()?;

        let object_count = cursor.read_u64()?;
        let mut objects = BTreeMap::new();
        for _ in 0..object_count {
            let id = cursor.read_object_id()?;
            let len = cursor.read_u32()? as usize;
            objects.insert(id, cursor.take(len)?.to_vec());
        }

        let binding_count = cursor.read_u64()?;
        let mut bindings = BTreeMap::new();
        for _ in 0..binding_count {
            let len = cursor.read_u16()? as usize;
            let name = String::from_utf8(cursor.take(len)?.to_vec())
                .map_err(|_| StoreError::corrupt("invalid UTF-8 in snapshot binding"))?;
            let id = cursor.read_object_id()?;
            bindings.insert(name, id);
        }

        let class_count = cursor.read_u32()?;
        let mut classes = BTreeMap::new();
        for _ in 0..class_count {
            let class = ClassId::new(cursor.read_u32()?);
            let len = cursor.read_u32()? as usize;
            classes.insert(class, cursor.take(len)?.to_vec());
        }

        if cursor.pos != body.len() {
            return Err(StoreError::corrupt("trailing bytes in snapshot"));
        }

        Ok(Self {
            next_object_id,
            next_class_id,
            objects,
            bindings,
            classes,
        })
    }
}

struct ImageCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ImageCursor<'a> {
    fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StoreError::corrupt("snapshot too short"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> StoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> StoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> StoreResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_object_id(&mut self) -> StoreResult<ObjectId> {
        ObjectId::new(self.read_u64()?)
            .ok_or_else(|| StoreError::corrupt("zero object id in snapshot"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u64) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    fn sample() -> StoreImage {
        let mut image = StoreImage {
            next_object_id: 12,
            next_class_id: 3,
            ..StoreImage::default()
        };
        image.objects.insert(oid(1), vec![1, 2, 3]);
        image.objects.insert(oid(5), vec![]);
        image.bindings.insert("a.root".to_string(), oid(1));
        image.bindings.insert("s.header".to_string(), oid(5));
        image.classes.insert(ClassId::new(1), b"demo::Obj".to_vec());
        image
    }

    #[test]
    fn encode_decode_roundtrip() {
        let image = sample();
        let encoded = image.encode().unwrap();
        assert_eq!(StoreImage::decode(&encoded).unwrap(), image);
    }

    #[test]
    fn empty_image_roundtrip() {
        let image = StoreImage::default();
        let encoded = image.encode().unwrap();
        assert_eq!(StoreImage::decode(&encoded).unwrap(), image);
    }

    #[test]
    fn deterministic_encoding() {
        let a = sample().encode().unwrap();
        let b = sample().encode().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn corrupted_byte_rejected() {
        let mut encoded = sample().encode().unwrap();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;
        assert!(matches!(
            StoreImage::decode(&encoded).unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let err = StoreImage::decode(b"XXXXXXXXXXXXXX").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
