use crate::db::locks::TypeSet;
use crate::db::{recovery, unix_now, Db};
use crate::error::{Error, Result};
use crate::storage::entry::Entry;
use crate::storage::{DataType, HashOp, ListOp, SetOp, StrOp, ZSetOp};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread;

const TX_ID_LEN: u64 = 8;

/// The commit log: an append-only file of big-endian committed
/// transaction ids. Its contents decide which transactional entries are
/// replayed on open.
pub(crate) struct TxnMeta {
    /// High-water mark for id allocation.
    pub(crate) max_tx_id: u64,
    /// Ids recorded in the commit log.
    pub(crate) committed: HashSet<u64>,
    /// Tx ids observed in the active segments during the last replay.
    /// Reclaim keeps exactly these when it rewrites the log.
    pub(crate) active_tx_ids: HashSet<u64>,
    file: File,
    offset: u64,
}

impl TxnMeta {
    /// Loads the commit log, truncating a torn trailing id if present.
    pub(crate) fn load(path: &Path) -> Result<TxnMeta> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let mut len = file.metadata()?.len();
        if len % TX_ID_LEN != 0 {
            len -= len % TX_ID_LEN;
            tracing::warn!(path = %path.display(), len, "truncating short commit-log tail");
            file.set_len(len)?;
        }

        let mut committed = HashSet::new();
        let mut max_tx_id = 0;
        let mut reader = BufReader::new(file.try_clone()?);
        for _ in 0..(len / TX_ID_LEN) {
            let tx_id = reader.read_u64::<BigEndian>()?;
            max_tx_id = max_tx_id.max(tx_id);
            committed.insert(tx_id);
        }

        Ok(TxnMeta {
            max_tx_id,
            committed,
            active_tx_ids: HashSet::new(),
            file,
            offset: len,
        })
    }

    /// Allocates the next transaction id.
    pub(crate) fn next_tx_id(&mut self) -> u64 {
        self.max_tx_id += 1;
        self.max_tx_id
    }

    /// Appends `tx_id` to the commit log. Once this write (and its
    /// fsync, when configured) completes, the transaction is durable.
    pub(crate) fn mark_commit(&mut self, tx_id: u64, sync: bool) -> Result<()> {
        let mut buf = Vec::with_capacity(TX_ID_LEN as usize);
        buf.write_u64::<BigEndian>(tx_id)?;
        self.file.write_all_at(&buf, self.offset)?;
        self.offset += TX_ID_LEN;
        if sync {
            self.file.sync_all()?;
        }
        self.committed.insert(tx_id);
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Replaces the log contents with `keep`, preserving the id
    /// high-water mark so rolled-back ids are never reissued.
    pub(crate) fn rewrite(&mut self, keep: &HashSet<u64>, sync: bool) -> Result<()> {
        self.file.set_len(0)?;
        self.offset = 0;
        self.committed.clear();
        let ids: Vec<u64> = keep.iter().copied().collect();
        for tx_id in ids {
            self.mark_commit(tx_id, false)?;
        }
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// A transaction: a batch of entries staged in memory and made durable
/// as one unit by a commit-log append.
///
/// String operations stage into a last-writer-wins map; all other types
/// stage into an ordered list. Reads consult the staged entries first,
/// then the committed indexes.
pub struct Txn<'a> {
    db: &'a Db,
    id: u64,
    str_entries: HashMap<Vec<u8>, Entry>,
    write_entries: Vec<Entry>,
    /// Indices into `write_entries` superseded by a later operation on
    /// the same logical key; skipped when appending to disk.
    skip_ids: HashSet<usize>,
    /// Latest staged entry per (type, key, member-or-field).
    keys_map: HashMap<Vec<u8>, usize>,
    types: TypeSet,
    finished: bool,
}

impl Db {
    /// Runs a read-write transaction. The staged operations commit when
    /// the closure returns Ok and roll back when it returns Err.
    pub fn txn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Txn) -> Result<()>,
    {
        self.ensure_open()?;
        let mut tx = self.new_txn()?;
        match f(&mut tx) {
            Ok(()) => {
                if let Err(err) = tx.commit() {
                    tx.rollback();
                    return Err(err);
                }
                Ok(())
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Runs a read-only transaction. Staged writes are discarded when
    /// the closure returns.
    pub fn txn_view<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Txn) -> Result<()>,
    {
        self.ensure_open()?;
        let mut tx = self.new_txn()?;
        let result = f(&mut tx);
        tx.rollback();
        result
    }

    fn new_txn(&self) -> Result<Txn<'_>> {
        let mut meta = self.txn_meta.lock()?;
        Ok(Txn {
            db: self,
            id: meta.next_tx_id(),
            str_entries: HashMap::new(),
            write_entries: Vec::new(),
            skip_ids: HashSet::new(),
            keys_map: HashMap::new(),
            types: TypeSet::new(),
            finished: false,
        })
    }
}

impl<'a> Txn<'a> {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn put_entry(&mut self, entry: Entry) -> Result<()> {
        self.db.ensure_open()?;
        if self.finished {
            return Err(Error::TxFinished);
        }

        let dtype = entry.data_type()?;
        self.types.insert(dtype);
        match dtype {
            DataType::String => {
                self.str_entries.insert(entry.key.clone(), entry);
            }
            _ => self.write_entries.push(entry),
        }
        Ok(())
    }

    fn stage_keyed(&mut self, entry: Entry, staged: Vec<u8>) -> Result<()> {
        self.put_entry(entry)?;
        self.keys_map.insert(staged, self.write_entries.len() - 1);
        Ok(())
    }

    fn finish(&mut self) {
        self.str_entries.clear();
        self.write_entries.clear();
        self.skip_ids.clear();
        self.keys_map.clear();
        self.finished = true;
    }

    /// Discards every staged entry without touching segments or indexes.
    pub fn rollback(&mut self) {
        self.finish();
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.db.ensure_open()?;
        if self.finished {
            return Err(Error::TxFinished);
        }
        let result = self.commit_inner();
        self.finish();
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.types.is_empty() {
            return Ok(());
        }

        let db = self.db;
        let mut guards = db.write_guards(self.types)?;

        // Append the string bucket and the ordered bucket; a worker pair
        // runs them concurrently when both are non-empty.
        let str_entries = &self.str_entries;
        let write_entries = &self.write_entries;
        let skip_ids = &self.skip_ids;
        let positions;
        if !str_entries.is_empty() && !write_entries.is_empty() {
            let (str_result, other_result) = thread::scope(|scope| {
                let worker = scope.spawn(move || write_str_entries(db, str_entries));
                let other = write_other_entries(db, write_entries, skip_ids);
                let strs = worker
                    .join()
                    .map_err(|_| Error::IO("commit worker panicked".to_string()));
                (strs, other)
            });
            positions = str_result??;
            other_result?;
        } else {
            positions = write_str_entries(db, str_entries)?;
            write_other_entries(db, write_entries, skip_ids)?;
        }

        if db.config.sync {
            for dtype in DataType::ALL {
                if self.types.contains(dtype) {
                    db.segments[dtype.tag() as usize].lock()?.active.sync()?;
                }
            }
        }

        // Durability boundary: the transaction exists once its id is in
        // the commit log.
        {
            let mut meta = db.txn_meta.lock()?;
            meta.mark_commit(self.id, db.config.sync)?;
            meta.active_tx_ids.insert(self.id);
        }

        // Apply the staged entries to the in-memory indexes.
        if let Some(state) = guards.strings.as_mut() {
            for (key, entry) in str_entries {
                if let Some(&(file_id, offset)) = positions.get(key) {
                    recovery::apply_string(state, entry, file_id, offset);
                }
            }
        }
        for entry in write_entries {
            match entry.data_type()? {
                DataType::List => {
                    if let Some(state) = guards.lists.as_mut() {
                        recovery::apply_list(state, entry);
                    }
                }
                DataType::Hash => {
                    if let Some(state) = guards.hashes.as_mut() {
                        recovery::apply_hash(state, entry);
                    }
                }
                DataType::Set => {
                    if let Some(state) = guards.sets.as_mut() {
                        recovery::apply_set(state, entry);
                    }
                }
                DataType::ZSet => {
                    if let Some(state) = guards.zsets.as_mut() {
                        recovery::apply_zset(state, entry);
                    }
                }
                DataType::String => {}
            }
        }
        Ok(())
    }

    // ---- string operations ----

    /// Stages a string set.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.check_key_value(key, &[value])?;
        let e = Entry::with_txn(
            key.to_vec(),
            value.to_vec(),
            Vec::new(),
            DataType::String,
            StrOp::Set as u16,
            self.id,
        );
        self.put_entry(e)
    }

    /// Stages a string set unless the key already exists.
    pub fn set_nx(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.db.check_key_value(key, &[value])?;
        if self.str_exists(key)? {
            return Ok(false);
        }
        self.set(key, value)?;
        Ok(true)
    }

    /// Stages a string set with a time-to-live.
    pub fn set_ex(&mut self, key: &[u8], value: &[u8], duration: i64) -> Result<()> {
        self.db.check_key_value(key, &[value])?;
        if duration <= 0 {
            return Err(Error::InvalidTTL);
        }

        let deadline = unix_now() + duration;
        let mut e = Entry::with_expire(
            key.to_vec(),
            value.to_vec(),
            deadline,
            DataType::String,
            StrOp::Expire as u16,
        );
        e.tx_id = self.id;
        self.put_entry(e)
    }

    /// Reads a string, consulting the staged entries first.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.db.check_key(key)?;

        if let Some(entry) = self.str_entries.get(key) {
            if entry.mark() == StrOp::Rem as u16 {
                return Err(Error::KeyNotExist);
            }
            if entry.mark() == StrOp::Expire as u16 && (entry.timestamp as i64) < unix_now() {
                return Err(Error::KeyNotExist);
            }
            return Ok(entry.value.clone());
        }

        let state = self.db.strings.read()?;
        match state.expires.get(key) {
            Some(&deadline) if unix_now() > deadline => return Err(Error::KeyExpired),
            _ => {}
        }
        match state.index.get(key) {
            Some(record) => Ok(record.value.clone()),
            None => Err(Error::KeyNotExist),
        }
    }

    /// Stages a set and returns the previous value.
    pub fn get_set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let old = match self.get(key) {
            Ok(v) => Some(v),
            Err(Error::KeyNotExist) | Err(Error::KeyExpired) => None,
            Err(err) => return Err(err),
        };
        self.set(key, value)?;
        Ok(old)
    }

    /// Appends to a staged or committed string value.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.check_key_value(key, &[value])?;

        if let Some(entry) = self.str_entries.get_mut(key) {
            if entry.mark() != StrOp::Rem as u16 {
                entry.value.extend_from_slice(value);
                return Ok(());
            }
        }

        let mut combined = match self.get(key) {
            Ok(v) => v,
            Err(Error::KeyNotExist) | Err(Error::KeyExpired) => Vec::new(),
            Err(err) => return Err(err),
        };
        combined.extend_from_slice(value);
        self.set(key, &combined)
    }

    /// Whether the key exists, staged entries first.
    pub fn str_exists(&self, key: &[u8]) -> Result<bool> {
        self.db.check_key(key)?;

        if let Some(entry) = self.str_entries.get(key) {
            if entry.mark() == StrOp::Rem as u16 {
                return Ok(false);
            }
            if entry.mark() == StrOp::Expire as u16 && (entry.timestamp as i64) < unix_now() {
                return Ok(false);
            }
            return Ok(true);
        }

        let state = self.db.strings.read()?;
        match state.expires.get(key) {
            Some(&deadline) if unix_now() > deadline => return Ok(false),
            _ => {}
        }
        Ok(state.index.exists(key))
    }

    /// Stages a string removal.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.db.check_key(key)?;
        self.str_entries.remove(key);

        let e = Entry::with_txn(
            key.to_vec(),
            Vec::new(),
            Vec::new(),
            DataType::String,
            StrOp::Rem as u16,
            self.id,
        );
        self.put_entry(e)
    }

    // ---- list operations ----

    /// Stages pushes to the head of a list.
    pub fn lpush(&mut self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.db.check_key_value(key, values)?;
        for value in values {
            let e = Entry::with_txn(
                key.to_vec(),
                value.to_vec(),
                Vec::new(),
                DataType::List,
                ListOp::LPush as u16,
                self.id,
            );
            self.put_entry(e)?;
        }
        Ok(())
    }

    /// Stages pushes to the tail of a list.
    pub fn rpush(&mut self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.db.check_key_value(key, values)?;
        for value in values {
            let e = Entry::with_txn(
                key.to_vec(),
                value.to_vec(),
                Vec::new(),
                DataType::List,
                ListOp::RPush as u16,
                self.id,
            );
            self.put_entry(e)?;
        }
        Ok(())
    }

    // ---- hash operations ----

    /// Stages a hash field set; a no-op when the value is unchanged.
    pub fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> Result<()> {
        self.db.check_key_value(key, &[value])?;
        if self.hget(key, field)?.as_deref() == Some(value) {
            return Ok(());
        }

        let e = Entry::with_txn(
            key.to_vec(),
            value.to_vec(),
            field.to_vec(),
            DataType::Hash,
            HashOp::HSet as u16,
            self.id,
        );
        self.stage_keyed(e, staged_key(DataType::Hash, key, field))
    }

    /// Stages a hash field set only if the field is absent. Returns
    /// whether it staged.
    pub fn hset_nx(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        self.db.check_key_value(key, &[value])?;
        if self.hget(key, field)?.is_some() {
            return Ok(false);
        }

        let e = Entry::with_txn(
            key.to_vec(),
            value.to_vec(),
            field.to_vec(),
            DataType::Hash,
            HashOp::HSet as u16,
            self.id,
        );
        self.stage_keyed(e, staged_key(DataType::Hash, key, field))?;
        Ok(true)
    }

    /// Reads a hash field, staged entries first.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.check_key(key)?;

        if let Some(&idx) = self.keys_map.get(&staged_key(DataType::Hash, key, field)) {
            let entry = &self.write_entries[idx];
            if entry.mark() == HashOp::HDel as u16 {
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }

        let state = self.db.hashes.read()?;
        match state.expires.get(key) {
            Some(&deadline) if unix_now() > deadline => return Ok(None),
            _ => {}
        }
        Ok(state.index.hget(key, field).map(|v| v.to_vec()))
    }

    /// Stages hash field deletions.
    pub fn hdel(&mut self, key: &[u8], fields: &[&[u8]]) -> Result<()> {
        self.db.check_key(key)?;
        for field in fields {
            let staged = staged_key(DataType::Hash, key, field);
            if let Some(&idx) = self.keys_map.get(&staged) {
                self.skip_ids.insert(idx);
            }

            let e = Entry::with_txn(
                key.to_vec(),
                Vec::new(),
                field.to_vec(),
                DataType::Hash,
                HashOp::HDel as u16,
                self.id,
            );
            self.stage_keyed(e, staged)?;
        }
        Ok(())
    }

    /// Whether a hash field exists, staged entries first.
    pub fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool> {
        Ok(self.hget(key, field)?.is_some())
    }

    // ---- set operations ----

    /// Stages member additions, skipping members already present.
    pub fn sadd(&mut self, key: &[u8], members: &[&[u8]]) -> Result<()> {
        for member in members {
            self.db.check_key_value(key, &[*member])?;
            if self.sis_member(key, member)? {
                continue;
            }

            let e = Entry::with_txn(
                key.to_vec(),
                member.to_vec(),
                Vec::new(),
                DataType::Set,
                SetOp::SAdd as u16,
                self.id,
            );
            self.stage_keyed(e, staged_key(DataType::Set, key, member))?;
        }
        Ok(())
    }

    /// Whether a member is in the set, staged entries first.
    pub fn sis_member(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        self.db.check_key(key)?;

        if let Some(&idx) = self.keys_map.get(&staged_key(DataType::Set, key, member)) {
            let entry = &self.write_entries[idx];
            return Ok(entry.mark() != SetOp::SRem as u16);
        }

        let state = self.db.sets.read()?;
        match state.expires.get(key) {
            Some(&deadline) if unix_now() > deadline => return Ok(false),
            _ => {}
        }
        Ok(state.index.sis_member(key, member))
    }

    /// Stages member removals.
    pub fn srem(&mut self, key: &[u8], members: &[&[u8]]) -> Result<()> {
        self.db.check_key(key)?;
        for member in members {
            let staged = staged_key(DataType::Set, key, member);
            if let Some(&idx) = self.keys_map.get(&staged) {
                self.skip_ids.insert(idx);
            }

            let e = Entry::with_txn(
                key.to_vec(),
                member.to_vec(),
                Vec::new(),
                DataType::Set,
                SetOp::SRem as u16,
                self.id,
            );
            self.stage_keyed(e, staged)?;
        }
        Ok(())
    }

    // ---- sorted-set operations ----

    /// Stages a member insert or score update; a no-op when the score is
    /// unchanged.
    pub fn zadd(&mut self, key: &[u8], score: f64, member: &[u8]) -> Result<()> {
        self.db.check_key_value(key, &[member])?;
        if self.zscore(key, member)? == Some(score) {
            return Ok(());
        }

        let e = Entry::with_txn(
            key.to_vec(),
            member.to_vec(),
            recovery::format_score(score),
            DataType::ZSet,
            ZSetOp::ZAdd as u16,
            self.id,
        );
        self.stage_keyed(e, staged_key(DataType::ZSet, key, member))
    }

    /// Reads a member's score, staged entries first.
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        self.db.check_key(key)?;

        if let Some(&idx) = self.keys_map.get(&staged_key(DataType::ZSet, key, member)) {
            let entry = &self.write_entries[idx];
            if entry.mark() == ZSetOp::ZRem as u16 {
                return Ok(None);
            }
            return Ok(recovery::parse_score(&entry.extra));
        }

        let state = self.db.zsets.read()?;
        match state.expires.get(key) {
            Some(&deadline) if unix_now() > deadline => return Err(Error::KeyExpired),
            _ => {}
        }
        Ok(state.index.zscore(key, member))
    }

    /// Stages a member removal.
    pub fn zrem(&mut self, key: &[u8], member: &[u8]) -> Result<()> {
        self.db.check_key(key)?;

        let staged = staged_key(DataType::ZSet, key, member);
        if let Some(&idx) = self.keys_map.get(&staged) {
            self.skip_ids.insert(idx);
        }

        let e = Entry::with_txn(
            key.to_vec(),
            member.to_vec(),
            Vec::new(),
            DataType::ZSet,
            ZSetOp::ZRem as u16,
            self.id,
        );
        self.stage_keyed(e, staged)
    }
}

/// Appends the string bucket, returning where each key's entry landed.
fn write_str_entries(
    db: &Db,
    entries: &HashMap<Vec<u8>, Entry>,
) -> Result<HashMap<Vec<u8>, (u32, u64)>> {
    let mut positions = HashMap::with_capacity(entries.len());
    for (key, entry) in entries {
        let position = db.store(entry)?;
        positions.insert(key.clone(), position);
    }
    Ok(positions)
}

/// Appends the ordered bucket, skipping superseded indices.
fn write_other_entries(db: &Db, entries: &[Entry], skip_ids: &HashSet<usize>) -> Result<()> {
    for (i, entry) in entries.iter().enumerate() {
        if skip_ids.contains(&i) {
            continue;
        }
        db.store(entry)?;
    }
    Ok(())
}

/// Composite key identifying a staged (type, key, member-or-field).
fn staged_key(dtype: DataType, key: &[u8], extra: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + key.len() + extra.len());
    buf.extend_from_slice(&(dtype.tag() as u16).to_be_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(extra);
    buf
}
