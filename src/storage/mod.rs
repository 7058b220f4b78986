//! On-disk storage: entry framing and append-only segment files.
//!
//! Every mutation is one [`Entry`](entry::Entry) appended to the active
//! [`Segment`](segment::Segment) of its value type. The entry `state`
//! word packs the value-type tag into its high byte and the operation
//! mark into its low byte; both are part of the on-disk format and must
//! not be renumbered.

pub mod entry;
pub mod segment;

use crate::error::{Error, Result};

/// Number of value types.
pub const DATA_TYPE_COUNT: usize = 5;

/// File name of the commit log inside the data directory.
pub const TX_META_FILE: &str = "DB.TX.META";

/// File name of the JSON config snapshot written at close.
pub const CONFIG_FILE: &str = "DB.CFG";

/// File name of the data-directory lock.
pub const LOCK_FILE: &str = "zerokv.lock";

/// Scratch directory used only while a reclaim pass runs.
pub const RECLAIM_DIR: &str = "zerokv_reclaim";

/// Separator reserved inside the `extra` field of compound operations
/// (LInsert, LTrim). Pivots and values may not contain it.
pub const EXTRA_SEPARATOR: &str = "\\0";

/// The five value types. The discriminants are the on-disk type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    String = 0,
    List = 1,
    Hash = 2,
    Set = 3,
    ZSet = 4,
}

impl DataType {
    pub const ALL: [DataType; DATA_TYPE_COUNT] = [
        DataType::String,
        DataType::List,
        DataType::Hash,
        DataType::Set,
        DataType::ZSet,
    ];

    /// The on-disk type tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<DataType> {
        match tag {
            0 => Ok(DataType::String),
            1 => Ok(DataType::List),
            2 => Ok(DataType::Hash),
            3 => Ok(DataType::Set),
            4 => Ok(DataType::ZSet),
            _ => Err(Error::InvalidEntry),
        }
    }

    /// The segment file-name suffix for this type.
    pub fn suffix(self) -> &'static str {
        match self {
            DataType::String => "str",
            DataType::List => "list",
            DataType::Hash => "hash",
            DataType::Set => "set",
            DataType::ZSet => "zset",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<DataType> {
        match suffix {
            "str" => Some(DataType::String),
            "list" => Some(DataType::List),
            "hash" => Some(DataType::Hash),
            "set" => Some(DataType::Set),
            "zset" => Some(DataType::ZSet),
            _ => None,
        }
    }

    /// Segment file name for the given id, e.g. `000000003.data.list`.
    pub fn file_name(self, id: u32) -> String {
        format!("{:09}.data.{}", id, self.suffix())
    }
}

/// String operation marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum StrOp {
    Set = 0,
    Rem = 1,
    Expire = 2,
    Persist = 3,
}

impl StrOp {
    pub fn from_mark(mark: u16) -> Option<StrOp> {
        match mark {
            0 => Some(StrOp::Set),
            1 => Some(StrOp::Rem),
            2 => Some(StrOp::Expire),
            3 => Some(StrOp::Persist),
            _ => None,
        }
    }
}

/// List operation marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ListOp {
    LPush = 0,
    RPush = 1,
    LPop = 2,
    RPop = 3,
    LRem = 4,
    LInsert = 5,
    LSet = 6,
    LTrim = 7,
    LClear = 8,
    LExpire = 9,
}

impl ListOp {
    pub fn from_mark(mark: u16) -> Option<ListOp> {
        match mark {
            0 => Some(ListOp::LPush),
            1 => Some(ListOp::RPush),
            2 => Some(ListOp::LPop),
            3 => Some(ListOp::RPop),
            4 => Some(ListOp::LRem),
            5 => Some(ListOp::LInsert),
            6 => Some(ListOp::LSet),
            7 => Some(ListOp::LTrim),
            8 => Some(ListOp::LClear),
            9 => Some(ListOp::LExpire),
            _ => None,
        }
    }
}

/// Hash operation marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum HashOp {
    HSet = 0,
    HDel = 1,
    HClear = 2,
    HExpire = 3,
}

impl HashOp {
    pub fn from_mark(mark: u16) -> Option<HashOp> {
        match mark {
            0 => Some(HashOp::HSet),
            1 => Some(HashOp::HDel),
            2 => Some(HashOp::HClear),
            3 => Some(HashOp::HExpire),
            _ => None,
        }
    }
}

/// Set operation marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum SetOp {
    SAdd = 0,
    SRem = 1,
    SMove = 2,
    SClear = 3,
    SExpire = 4,
}

impl SetOp {
    pub fn from_mark(mark: u16) -> Option<SetOp> {
        match mark {
            0 => Some(SetOp::SAdd),
            1 => Some(SetOp::SRem),
            2 => Some(SetOp::SMove),
            3 => Some(SetOp::SClear),
            4 => Some(SetOp::SExpire),
            _ => None,
        }
    }
}

/// Sorted-set operation marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ZSetOp {
    ZAdd = 0,
    ZRem = 1,
    ZClear = 2,
    ZExpire = 3,
}

impl ZSetOp {
    pub fn from_mark(mark: u16) -> Option<ZSetOp> {
        match mark {
            0 => Some(ZSetOp::ZAdd),
            1 => Some(ZSetOp::ZRem),
            2 => Some(ZSetOp::ZClear),
            3 => Some(ZSetOp::ZExpire),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_tags_round_trip() {
        for dtype in DataType::ALL {
            assert_eq!(DataType::from_tag(dtype.tag()).unwrap(), dtype);
            assert_eq!(DataType::from_suffix(dtype.suffix()), Some(dtype));
        }
        assert!(DataType::from_tag(5).is_err());
        assert_eq!(DataType::from_suffix("wal"), None);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(DataType::String.file_name(0), "000000000.data.str");
        assert_eq!(DataType::ZSet.file_name(42), "000000042.data.zset");
    }

    #[test]
    fn test_mark_round_trip() {
        assert_eq!(StrOp::from_mark(StrOp::Persist as u16), Some(StrOp::Persist));
        assert_eq!(ListOp::from_mark(ListOp::LExpire as u16), Some(ListOp::LExpire));
        assert_eq!(SetOp::from_mark(SetOp::SMove as u16), Some(SetOp::SMove));
        assert_eq!(ZSetOp::from_mark(9), None);
    }
}
