use crate::error::{Error, Result};
use crate::storage::DataType;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::time::{SystemTime, UNIX_EPOCH};

/// CRC32 (IEEE), computed over the value bytes only. The header and key
/// are not covered; this matches the on-disk format of existing data.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// crc(4) + key_size(4) + value_size(4) + extra_size(4) + state(2)
// + timestamp(8) + tx_id(8)
pub const ENTRY_HEADER_SIZE: usize = 34;

/// Packs a value-type tag and an operation mark into the entry state
/// word: high eight bits type, low eight bits operation.
pub fn pack_state(dtype: DataType, mark: u16) -> u16 {
    ((dtype.tag() as u16) << 8) | mark
}

/// One mutation record as persisted in a segment file.
///
/// `timestamp` is the creation time in nanoseconds, except for `*Expire`
/// entries where it carries the absolute Unix-second deadline. Dispatch
/// on the operation mark before interpreting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub state: u16,
    pub timestamp: u64,
    pub tx_id: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub extra: Vec<u8>,
}

/// The fixed-size decoded entry header. Body sections follow in
/// `key || value || extra` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub crc32: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub extra_size: u32,
    pub state: u16,
    pub timestamp: u64,
    pub tx_id: u64,
}

impl EntryHeader {
    /// Total encoded size of the entry this header describes.
    pub fn entry_size(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64
            + self.key_size as u64
            + self.value_size as u64
            + self.extra_size as u64
    }

    pub fn decode(buf: &[u8]) -> Result<EntryHeader> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return Err(Error::InvalidEntry);
        }
        let mut reader = buf;
        Ok(EntryHeader {
            crc32: reader.read_u32::<BigEndian>()?,
            key_size: reader.read_u32::<BigEndian>()?,
            value_size: reader.read_u32::<BigEndian>()?,
            extra_size: reader.read_u32::<BigEndian>()?,
            state: reader.read_u16::<BigEndian>()?,
            timestamp: reader.read_u64::<BigEndian>()?,
            tx_id: reader.read_u64::<BigEndian>()?,
        })
    }
}

impl Entry {
    /// A new entry stamped with the current time.
    pub fn new(key: Vec<u8>, value: Vec<u8>, extra: Vec<u8>, dtype: DataType, mark: u16) -> Entry {
        Entry {
            state: pack_state(dtype, mark),
            timestamp: now_nanos(),
            tx_id: 0,
            key,
            value,
            extra,
        }
    }

    /// A new entry without an extra section.
    pub fn no_extra(key: Vec<u8>, value: Vec<u8>, dtype: DataType, mark: u16) -> Entry {
        Entry::new(key, value, Vec::new(), dtype, mark)
    }

    /// A new `*Expire` entry whose timestamp carries the absolute
    /// Unix-second deadline.
    pub fn with_expire(
        key: Vec<u8>,
        value: Vec<u8>,
        deadline: i64,
        dtype: DataType,
        mark: u16,
    ) -> Entry {
        Entry {
            state: pack_state(dtype, mark),
            timestamp: deadline as u64,
            tx_id: 0,
            key,
            value,
            extra: Vec::new(),
        }
    }

    /// A new entry stamped with the committing transaction's id.
    pub fn with_txn(
        key: Vec<u8>,
        value: Vec<u8>,
        extra: Vec<u8>,
        dtype: DataType,
        mark: u16,
        tx_id: u64,
    ) -> Entry {
        let mut e = Entry::new(key, value, extra, dtype, mark);
        e.tx_id = tx_id;
        e
    }

    /// Total encoded size in bytes.
    pub fn size(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64
            + self.key.len() as u64
            + self.value.len() as u64
            + self.extra.len() as u64
    }

    /// The value-type tag packed in the high byte of the state word.
    pub fn data_type(&self) -> Result<DataType> {
        DataType::from_tag((self.state >> 8) as u8)
    }

    /// The operation mark packed in the low byte of the state word.
    pub fn mark(&self) -> u16 {
        self.state & 0xff
    }

    /// Encodes the entry into its on-disk representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.key.is_empty() {
            return Err(Error::InvalidEntry);
        }

        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.write_u32::<BigEndian>(CRC32.checksum(&self.value))?;
        buf.write_u32::<BigEndian>(self.key.len() as u32)?;
        buf.write_u32::<BigEndian>(self.value.len() as u32)?;
        buf.write_u32::<BigEndian>(self.extra.len() as u32)?;
        buf.write_u16::<BigEndian>(self.state)?;
        buf.write_u64::<BigEndian>(self.timestamp)?;
        buf.write_u64::<BigEndian>(self.tx_id)?;
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf.extend_from_slice(&self.extra);
        Ok(buf)
    }

    /// Decodes a fully buffered entry and verifies its checksum.
    pub fn decode(buf: &[u8]) -> Result<Entry> {
        let header = EntryHeader::decode(buf)?;
        if (buf.len() as u64) < header.entry_size() {
            return Err(Error::InvalidEntry);
        }

        let key_end = ENTRY_HEADER_SIZE + header.key_size as usize;
        let value_end = key_end + header.value_size as usize;
        let extra_end = value_end + header.extra_size as usize;

        let entry = Entry {
            state: header.state,
            timestamp: header.timestamp,
            tx_id: header.tx_id,
            key: buf[ENTRY_HEADER_SIZE..key_end].to_vec(),
            value: buf[key_end..value_end].to_vec(),
            extra: buf[value_end..extra_end].to_vec(),
        };
        verify_checksum(header.crc32, &entry.value)?;
        Ok(entry)
    }
}

/// The checksum stored in an entry header for the given value bytes.
pub fn checksum(value: &[u8]) -> u32 {
    CRC32.checksum(value)
}

/// Compares a stored checksum against the decoded value bytes.
pub fn verify_checksum(stored: u32, value: &[u8]) -> Result<()> {
    if stored != CRC32.checksum(value) {
        return Err(Error::InvalidCrc);
    }
    Ok(())
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ListOp, StrOp};

    #[test]
    fn test_encode_decode_round_trip() {
        let entry = Entry::new(
            b"key".to_vec(),
            b"value".to_vec(),
            b"extra".to_vec(),
            DataType::List,
            ListOp::LInsert as u16,
        );

        let encoded = entry.encode().expect("encode entry");
        assert_eq!(encoded.len() as u64, entry.size());

        let decoded = Entry::decode(&encoded).expect("decode entry");
        assert_eq!(decoded, entry);
        assert_eq!(decoded.data_type().unwrap(), DataType::List);
        assert_eq!(decoded.mark(), ListOp::LInsert as u16);
    }

    #[test]
    fn test_encode_empty_key() {
        let entry = Entry::no_extra(Vec::new(), b"v".to_vec(), DataType::String, 0);
        assert_eq!(entry.encode(), Err(Error::InvalidEntry));
    }

    #[test]
    fn test_decode_corrupted_value() {
        let entry = Entry::no_extra(
            b"key".to_vec(),
            b"value".to_vec(),
            DataType::String,
            StrOp::Set as u16,
        );
        let mut encoded = entry.encode().expect("encode entry");

        // Flip a value byte; the stored checksum no longer matches.
        let value_pos = ENTRY_HEADER_SIZE + 3;
        encoded[value_pos] ^= 0xff;
        assert_eq!(Entry::decode(&encoded), Err(Error::InvalidCrc));
    }

    #[test]
    fn test_decode_corrupted_key_is_not_detected() {
        // The checksum covers the value only; key corruption passes.
        let entry = Entry::no_extra(
            b"key".to_vec(),
            b"value".to_vec(),
            DataType::String,
            StrOp::Set as u16,
        );
        let mut encoded = entry.encode().expect("encode entry");
        encoded[ENTRY_HEADER_SIZE] ^= 0xff;

        let decoded = Entry::decode(&encoded).expect("decode entry");
        assert_ne!(decoded.key, entry.key);
        assert_eq!(decoded.value, entry.value);
    }

    #[test]
    fn test_expire_entry_timestamp_is_deadline() {
        let entry = Entry::with_expire(
            b"key".to_vec(),
            b"value".to_vec(),
            1_700_000_000,
            DataType::String,
            StrOp::Expire as u16,
        );
        assert_eq!(entry.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_state_packing() {
        let entry = Entry::no_extra(
            b"k".to_vec(),
            Vec::new(),
            DataType::ZSet,
            crate::storage::ZSetOp::ZClear as u16,
        );
        assert_eq!(entry.state >> 8, DataType::ZSet.tag() as u16);
        assert_eq!(entry.mark(), crate::storage::ZSetOp::ZClear as u16);
    }

    #[test]
    fn test_header_decode_short_buffer() {
        let buf = vec![0u8; ENTRY_HEADER_SIZE - 1];
        assert_eq!(EntryHeader::decode(&buf), Err(Error::InvalidEntry));
    }
}
