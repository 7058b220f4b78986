use crate::db::{Db, TypeState};
use crate::error::Result;
use crate::index::{HashIndex, ListIndex, SetIndex, StrIndex, ZSetIndex};
use crate::storage::DataType;
use std::sync::RwLockWriteGuard;

/// The set of value types a transaction has touched, as a bitmask over
/// the type tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TypeSet(u16);

impl TypeSet {
    pub(crate) fn new() -> TypeSet {
        TypeSet(0)
    }

    pub(crate) fn insert(&mut self, dtype: DataType) {
        self.0 |= 1 << dtype.tag();
    }

    pub(crate) fn contains(self, dtype: DataType) -> bool {
        self.0 & (1 << dtype.tag()) != 0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Write guards over the touched types, acquired in ascending type-tag
/// order so concurrent commits cannot deadlock. Dropping the bundle
/// releases every guard, which keeps unlock symmetric on all exit paths.
pub(crate) struct WriteGuards<'a> {
    pub(crate) strings: Option<RwLockWriteGuard<'a, TypeState<StrIndex>>>,
    pub(crate) lists: Option<RwLockWriteGuard<'a, TypeState<ListIndex>>>,
    pub(crate) hashes: Option<RwLockWriteGuard<'a, TypeState<HashIndex>>>,
    pub(crate) sets: Option<RwLockWriteGuard<'a, TypeState<SetIndex>>>,
    pub(crate) zsets: Option<RwLockWriteGuard<'a, TypeState<ZSetIndex>>>,
}

impl Db {
    /// Acquires the write locks of every type in `types`. Field order is
    /// acquisition order: String, List, Hash, Set, ZSet.
    pub(crate) fn write_guards(&self, types: TypeSet) -> Result<WriteGuards<'_>> {
        let strings = if types.contains(DataType::String) {
            Some(self.strings.write()?)
        } else {
            None
        };
        let lists = if types.contains(DataType::List) {
            Some(self.lists.write()?)
        } else {
            None
        };
        let hashes = if types.contains(DataType::Hash) {
            Some(self.hashes.write()?)
        } else {
            None
        };
        let sets = if types.contains(DataType::Set) {
            Some(self.sets.write()?)
        } else {
            None
        };
        let zsets = if types.contains(DataType::ZSet) {
            Some(self.zsets.write()?)
        } else {
            None
        };

        Ok(WriteGuards {
            strings,
            lists,
            hashes,
            sets,
            zsets,
        })
    }
}
