//! The engine: per-type segment sets, per-type guarded indexes, lazy
//! expiration, transactions, recovery and reclaim.

pub mod hashes;
pub mod lists;
pub(crate) mod locks;
pub mod reclaim;
pub(crate) mod recovery;
pub mod sets;
pub mod strings;
pub mod txn;
pub mod zsets;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::{HashIndex, ListIndex, SetIndex, StrIndex, ZSetIndex};
use crate::storage::entry::Entry;
use crate::storage::segment::{scan_dir, Segment};
use crate::storage::{
    DataType, HashOp, ListOp, SetOp, StrOp, ZSetOp, CONFIG_FILE, DATA_TYPE_COUNT, LOCK_FILE,
    TX_META_FILE,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use txn::TxnMeta;

/// The writable segment of one value type plus its read-only
/// predecessors, keyed by id.
pub(crate) struct SegmentSet {
    pub(crate) active: Segment,
    pub(crate) archived: BTreeMap<u32, Segment>,
}

impl SegmentSet {
    /// Opens the segments of one type found in `dir`: every id but the
    /// last becomes archived, the last (or a fresh id 0) becomes active.
    fn load(dir: &std::path::Path, dtype: DataType, ids: &[u32]) -> Result<SegmentSet> {
        let mut archived = BTreeMap::new();
        let active_id = match ids.split_last() {
            Some((last, rest)) => {
                for id in rest {
                    archived.insert(*id, Segment::open(dir, *id, dtype)?);
                }
                *last
            }
            None => 0,
        };
        Ok(SegmentSet {
            active: Segment::open(dir, active_id, dtype)?,
            archived,
        })
    }
}

/// One value type's index together with its expiration table, guarded by
/// a single lock so deadlines never drift from the index they describe.
pub(crate) struct TypeState<I> {
    pub(crate) index: I,
    pub(crate) expires: HashMap<Vec<u8>, i64>,
}

impl<I> TypeState<I> {
    pub(crate) fn new(index: I) -> Self {
        TypeState {
            index,
            expires: HashMap::new(),
        }
    }
}

/// The seam between the engine and a type's index: enough to purge an
/// expired key and record which entry marks the purge on disk.
pub(crate) trait TypeIndex {
    const DTYPE: DataType;
    const PURGE_MARK: u16;

    fn purge(&mut self, key: &[u8]);
}

impl TypeIndex for StrIndex {
    const DTYPE: DataType = DataType::String;
    const PURGE_MARK: u16 = StrOp::Rem as u16;

    fn purge(&mut self, key: &[u8]) {
        self.remove(key);
    }
}

impl TypeIndex for ListIndex {
    const DTYPE: DataType = DataType::List;
    const PURGE_MARK: u16 = ListOp::LClear as u16;

    fn purge(&mut self, key: &[u8]) {
        self.lclear(key);
    }
}

impl TypeIndex for HashIndex {
    const DTYPE: DataType = DataType::Hash;
    const PURGE_MARK: u16 = HashOp::HClear as u16;

    fn purge(&mut self, key: &[u8]) {
        self.hclear(key);
    }
}

impl TypeIndex for SetIndex {
    const DTYPE: DataType = DataType::Set;
    const PURGE_MARK: u16 = SetOp::SClear as u16;

    fn purge(&mut self, key: &[u8]) {
        self.sclear(key);
    }
}

impl TypeIndex for ZSetIndex {
    const DTYPE: DataType = DataType::ZSet;
    const PURGE_MARK: u16 = ZSetOp::ZClear as u16;

    fn purge(&mut self, key: &[u8]) {
        self.zclear(key);
    }
}

/// An embeddable persistent key-value engine serving five Redis-style
/// value types over per-type append-only segment files.
///
/// All public operations are thread-safe. Within one value type,
/// mutations are totally ordered by that type's lock; across types there
/// is no ordering guarantee outside transactions.
pub struct Db {
    pub(crate) config: Config,
    pub(crate) segments: [Mutex<SegmentSet>; DATA_TYPE_COUNT],
    pub(crate) strings: RwLock<TypeState<StrIndex>>,
    pub(crate) lists: RwLock<TypeState<ListIndex>>,
    pub(crate) hashes: RwLock<TypeState<HashIndex>>,
    pub(crate) sets: RwLock<TypeState<SetIndex>>,
    pub(crate) zsets: RwLock<TypeState<ZSetIndex>>,
    pub(crate) txn_meta: Mutex<TxnMeta>,
    pub(crate) reclaim_mu: Mutex<()>,
    pub(crate) is_reclaiming: AtomicBool,
    closed: AtomicBool,
    _lock: FileLock,
}

impl Db {
    /// Opens an engine over `config.dir_path`, creating the directory if
    /// needed and rebuilding every index by replaying the segment files.
    pub fn open(config: Config) -> Result<Db> {
        fs::create_dir_all(&config.dir_path)?;
        let lock = FileLock::lock(config.dir_path.join(LOCK_FILE))?;

        let ids = scan_dir(&config.dir_path)?;
        let mut sets = Vec::with_capacity(DATA_TYPE_COUNT);
        for dtype in DataType::ALL {
            sets.push(SegmentSet::load(&config.dir_path, dtype, &ids[&dtype])?);
        }
        let sets: [SegmentSet; DATA_TYPE_COUNT] = sets
            .try_into()
            .map_err(|_| Error::ActiveFileIsNil)?;

        let mut txn_meta = TxnMeta::load(&config.dir_path.join(TX_META_FILE))?;
        let replayed = recovery::replay(&sets, &txn_meta)?;
        txn_meta.active_tx_ids = replayed.active_tx_ids;

        tracing::info!(
            dir = %config.dir_path.display(),
            strings = replayed.strings.index.len(),
            committed_txns = txn_meta.committed.len(),
            "opened database"
        );

        Ok(Db {
            config,
            segments: sets.map(Mutex::new),
            strings: RwLock::new(replayed.strings),
            lists: RwLock::new(replayed.lists),
            hashes: RwLock::new(replayed.hashes),
            sets: RwLock::new(replayed.sets),
            zsets: RwLock::new(replayed.zsets),
            txn_meta: Mutex::new(txn_meta),
            reclaim_mu: Mutex::new(()),
            is_reclaiming: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            _lock: lock,
        })
    }

    /// Closes the engine: saves the config snapshot, syncs every segment
    /// and marks the handle closed. Further calls fail with
    /// [`Error::DBIsClosed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::DBIsClosed);
        }

        self.save_config()?;
        for cell in &self.segments {
            let set = cell.lock()?;
            set.active.sync()?;
            for segment in set.archived.values() {
                segment.sync()?;
            }
        }
        let meta = self.txn_meta.lock()?;
        meta.sync()?;

        tracing::info!(dir = %self.config.dir_path.display(), "closed database");
        Ok(())
    }

    /// Flushes every active segment to durable media.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        for cell in &self.segments {
            cell.lock()?.active.sync()?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DBIsClosed);
        }
        Ok(())
    }

    fn save_config(&self) -> Result<()> {
        let encoded = serde_json::to_vec(&self.config).map_err(|e| Error::IO(e.to_string()))?;
        fs::write(self.config.dir_path.join(CONFIG_FILE), encoded)?;
        Ok(())
    }

    /// Appends an entry to its type's active segment, rotating to a new
    /// segment first when the write would push the active one past
    /// `block_size`. Returns the `(file_id, offset)` the entry was
    /// written at.
    pub(crate) fn store(&self, e: &Entry) -> Result<(u32, u64)> {
        let dtype = e.data_type()?;
        let mut set = self.segments[dtype.tag() as usize].lock()?;

        if set.active.offset() + e.size() > self.config.block_size {
            set.active.sync()?;
            let next_id = set.active.id() + 1;
            let fresh = Segment::open(&self.config.dir_path, next_id, dtype)?;
            let old = std::mem::replace(&mut set.active, fresh);
            tracing::info!(
                dtype = dtype.suffix(),
                archived = old.id(),
                active = next_id,
                "rotated segment"
            );
            set.archived.insert(old.id(), old);
        }

        let offset = set.active.write(e)?;
        if self.config.sync {
            set.active.sync()?;
        }
        Ok((set.active.id(), offset))
    }

    /// Rejects empty or oversized keys and oversized values.
    pub(crate) fn check_key_value(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if key.len() as u64 > self.config.max_key_size as u64 {
            return Err(Error::KeyTooLarge);
        }
        for value in values {
            if value.len() as u64 > self.config.max_value_size as u64 {
                return Err(Error::ValueTooLarge);
            }
        }
        Ok(())
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        self.check_key_value(key, &[])
    }

    /// If the key's deadline has passed, appends the purge entry, drops
    /// the key from the index and forgets the deadline. Returns whether
    /// the key was expired.
    pub(crate) fn check_expired<I: TypeIndex>(
        &self,
        state: &mut TypeState<I>,
        key: &[u8],
    ) -> Result<bool> {
        let Some(&deadline) = state.expires.get(key) else {
            return Ok(false);
        };
        if unix_now() <= deadline {
            return Ok(false);
        }

        let e = Entry::no_extra(key.to_vec(), Vec::new(), I::DTYPE, I::PURGE_MARK);
        self.store(&e)?;
        state.index.purge(key);
        state.expires.remove(key);
        Ok(true)
    }

    /// Read-path variant of [`check_expired`]: peeks at the deadline
    /// under the read lock and escalates to the write lock only when
    /// cleanup is due.
    pub(crate) fn expire_if_due<I: TypeIndex>(
        &self,
        cell: &RwLock<TypeState<I>>,
        key: &[u8],
    ) -> Result<bool> {
        {
            let state = cell.read()?;
            match state.expires.get(key) {
                None => return Ok(false),
                Some(&deadline) if unix_now() <= deadline => return Ok(false),
                Some(_) => {}
            }
        }
        let mut state = cell.write()?;
        self.check_expired(&mut state, key)
    }

    /// Remaining seconds before the key's deadline; 0 when the key has
    /// no deadline or is already gone.
    pub(crate) fn ttl_of<I: TypeIndex>(
        &self,
        cell: &RwLock<TypeState<I>>,
        key: &[u8],
    ) -> Result<i64> {
        if self.expire_if_due(cell, key)? {
            return Ok(0);
        }
        let state = cell.read()?;
        match state.expires.get(key) {
            Some(&deadline) => Ok(deadline - unix_now()),
            None => Ok(0),
        }
    }
}

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(Config::new(dir.path())).expect("open db")
    }

    #[test]
    fn test_open_close() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);
        db.close().expect("close db");
        assert_eq!(db.close(), Err(Error::DBIsClosed));
        assert_eq!(db.sync(), Err(Error::DBIsClosed));
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_second_open_fails_on_locked_dir() {
        let dir = TempDir::new().expect("create temp dir");
        let _db = open_db(&dir);
        assert!(Db::open(Config::new(dir.path())).is_err());
    }

    #[test]
    fn test_store_rotates_segments() {
        let dir = TempDir::new().expect("create temp dir");
        let db = Db::open(Config::new(dir.path()).block_size(256)).expect("open db");

        for i in 0..20 {
            let e = Entry::no_extra(
                format!("key-{i}").into_bytes(),
                vec![b'x'; 40],
                DataType::String,
                StrOp::Set as u16,
            );
            db.store(&e).expect("store entry");
        }

        let set = db.segments[DataType::String.tag() as usize]
            .lock()
            .expect("lock segments");
        assert!(set.active.id() > 0);
        assert_eq!(set.archived.len(), set.active.id() as usize);
        for segment in set.archived.values() {
            assert!(segment.offset() <= 256);
        }
    }

    #[test]
    fn test_check_key_value_limits() {
        let dir = TempDir::new().expect("create temp dir");
        let db = Db::open(
            Config::new(dir.path()).max_key_size(4).max_value_size(4),
        )
        .expect("open db");

        assert_eq!(db.check_key(b""), Err(Error::EmptyKey));
        assert_eq!(db.check_key(b"toolong"), Err(Error::KeyTooLarge));
        assert_eq!(
            db.check_key_value(b"k", &[b"toolong"]),
            Err(Error::ValueTooLarge)
        );
        assert!(db.check_key_value(b"key", &[b"val"]).is_ok());
    }
}
