use crate::db::recovery::parse_score;
use crate::db::{unix_now, Db, TypeState};
use crate::error::{Error, Result};
use crate::storage::entry::Entry;
use crate::storage::segment::Segment;
use crate::storage::{DataType, HashOp, ListOp, SetOp, StrOp, ZSetOp, RECLAIM_DIR};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::thread;

/// Scratch directory for rewritten segments; removed again on drop, so
/// an aborted reclaim leaves nothing behind.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(path: PathBuf) -> Result<ScratchDir> {
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(ScratchDir { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

struct ReclaimFlag<'a>(&'a AtomicBool);

impl<'a> ReclaimFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        ReclaimFlag(flag)
    }
}

impl Drop for ReclaimFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Db {
    /// Rewrites archived segments, dropping entries the indexes no
    /// longer reference, then swaps the fresh segments in and shrinks
    /// the commit log to the ids still present in active segments.
    ///
    /// Fails with [`Error::ReclaimUnreached`] unless some type has at
    /// least `reclaim_threshold` archived segments. A decode or checksum
    /// failure aborts the pass before any index or file mutation for
    /// that type.
    pub fn reclaim(&self) -> Result<()> {
        self.ensure_open()?;
        let _serial = self.reclaim_mu.lock()?;

        let mut reclaimable = false;
        for cell in &self.segments {
            if cell.lock()?.archived.len() >= self.config.reclaim_threshold {
                reclaimable = true;
                break;
            }
        }
        if !reclaimable {
            return Err(Error::ReclaimUnreached);
        }

        let scratch = ScratchDir::create(self.config.dir_path.join(RECLAIM_DIR))?;
        let _flag = ReclaimFlag::raise(&self.is_reclaiming);
        tracing::info!(dir = %self.config.dir_path.display(), "reclaim started");

        let committed = self.txn_meta.lock()?.committed.clone();
        let scratch_path = scratch.path();

        thread::scope(|scope| {
            let strings = scope.spawn(|| self.reclaim_strings(scratch_path, &committed));
            let lists = scope.spawn(|| self.reclaim_lists(scratch_path, &committed));
            let hashes = scope.spawn(|| self.reclaim_hashes(scratch_path, &committed));
            let sets = scope.spawn(|| self.reclaim_sets(scratch_path, &committed));
            let zsets = scope.spawn(|| self.reclaim_zsets(scratch_path, &committed));

            for handle in [strings, lists, hashes, sets, zsets] {
                handle
                    .join()
                    .map_err(|_| Error::IO("reclaim worker panicked".to_string()))??;
            }
            Ok::<(), Error>(())
        })?;

        // Archived segments that referenced old committed ids are gone;
        // only ids still present in active segments stay in the log.
        let mut meta = self.txn_meta.lock()?;
        let keep: HashSet<u64> = meta
            .active_tx_ids
            .intersection(&meta.committed)
            .copied()
            .collect();
        meta.rewrite(&keep, self.config.sync)?;

        tracing::info!(kept_tx_ids = keep.len(), "reclaim finished");
        Ok(())
    }

    fn reclaim_strings(&self, scratch: &Path, committed: &HashSet<u64>) -> Result<()> {
        self.reclaim_type(
            DataType::String,
            &self.strings,
            scratch,
            committed,
            |state, entry, file_id, offset| match StrOp::from_mark(entry.mark()) {
                Some(StrOp::Expire) => has_future_deadline(state, &entry.key),
                Some(StrOp::Set) | Some(StrOp::Persist) => {
                    match state.expires.get(&entry.key) {
                        Some(&deadline) if deadline <= unix_now() => return false,
                        _ => {}
                    }
                    // The Bitcask liveness test: the index must point at
                    // exactly this entry.
                    match state.index.get(&entry.key) {
                        Some(record) => record.file_id == file_id && record.offset == offset,
                        None => false,
                    }
                }
                _ => false,
            },
            |state, entry, (old_id, old_offset), (new_id, new_offset)| {
                let set_like = matches!(
                    StrOp::from_mark(entry.mark()),
                    Some(StrOp::Set) | Some(StrOp::Persist)
                );
                match state.index.get_mut(&entry.key) {
                    Some(record) => {
                        // Only the entry the index points at may move it.
                        if record.file_id == old_id && record.offset == old_offset {
                            record.file_id = new_id;
                            record.offset = new_offset;
                        }
                        Ok(())
                    }
                    // A set-like entry passed the liveness test, so its
                    // record must exist.
                    None if set_like => Err(Error::NilStrData),
                    None => Ok(()),
                }
            },
        )
    }

    fn reclaim_lists(&self, scratch: &Path, committed: &HashSet<u64>) -> Result<()> {
        self.reclaim_type(
            DataType::List,
            &self.lists,
            scratch,
            committed,
            |state, entry, _, _| match ListOp::from_mark(entry.mark()) {
                Some(ListOp::LExpire) => has_future_deadline(state, &entry.key),
                Some(ListOp::LPush)
                | Some(ListOp::RPush)
                | Some(ListOp::LInsert)
                | Some(ListOp::LSet) => state.index.lval_exists(&entry.key, &entry.value),
                _ => false,
            },
            |_, _, _, _| Ok::<(), Error>(()),
        )
    }

    fn reclaim_hashes(&self, scratch: &Path, committed: &HashSet<u64>) -> Result<()> {
        self.reclaim_type(
            DataType::Hash,
            &self.hashes,
            scratch,
            committed,
            |state, entry, _, _| match HashOp::from_mark(entry.mark()) {
                Some(HashOp::HExpire) => has_future_deadline(state, &entry.key),
                Some(HashOp::HSet) => {
                    state.index.hget(&entry.key, &entry.extra) == Some(entry.value.as_slice())
                }
                _ => false,
            },
            |_, _, _, _| Ok::<(), Error>(()),
        )
    }

    fn reclaim_sets(&self, scratch: &Path, committed: &HashSet<u64>) -> Result<()> {
        self.reclaim_type(
            DataType::Set,
            &self.sets,
            scratch,
            committed,
            |state, entry, _, _| match SetOp::from_mark(entry.mark()) {
                Some(SetOp::SExpire) => has_future_deadline(state, &entry.key),
                Some(SetOp::SMove) => state.index.sis_member(&entry.extra, &entry.value),
                Some(SetOp::SAdd) => state.index.sis_member(&entry.key, &entry.value),
                _ => false,
            },
            |_, _, _, _| Ok::<(), Error>(()),
        )
    }

    fn reclaim_zsets(&self, scratch: &Path, committed: &HashSet<u64>) -> Result<()> {
        self.reclaim_type(
            DataType::ZSet,
            &self.zsets,
            scratch,
            committed,
            |state, entry, _, _| match ZSetOp::from_mark(entry.mark()) {
                Some(ZSetOp::ZExpire) => has_future_deadline(state, &entry.key),
                Some(ZSetOp::ZAdd) => match parse_score(&entry.extra) {
                    Some(score) => state.index.zscore(&entry.key, &entry.value) == Some(score),
                    None => false,
                },
                _ => false,
            },
            |_, _, _, _| Ok::<(), Error>(()),
        )
    }

    /// Rewrites one type's archived segments under that type's write
    /// lock. Validation runs over all segments before any byte is
    /// written, so failures abort with the old segments intact.
    fn reclaim_type<I, F, G>(
        &self,
        dtype: DataType,
        cell: &RwLock<TypeState<I>>,
        scratch: &Path,
        committed: &HashSet<u64>,
        valid: F,
        mut repoint: G,
    ) -> Result<()>
    where
        F: Fn(&TypeState<I>, &Entry, u32, u64) -> bool,
        G: FnMut(&mut TypeState<I>, &Entry, (u32, u64), (u32, u64)) -> Result<()>,
    {
        let mut state = cell.write()?;
        let mut set = self.segments[dtype.tag() as usize].lock()?;
        if set.archived.len() < self.config.reclaim_threshold {
            return Ok(());
        }

        // Pass 1: decode everything and keep the live entries.
        let mut survivors = Vec::new();
        for segment in set.archived.values() {
            let end = segment.offset();
            let mut offset = 0u64;
            while offset < end {
                let mut entry = segment.read(offset)?;
                let at = offset;
                offset += entry.size();

                if entry.tx_id != 0 {
                    if !committed.contains(&entry.tx_id) {
                        continue;
                    }
                    entry.tx_id = 0;
                }
                if valid(&state, &entry, segment.id(), at) {
                    survivors.push((entry, segment.id(), at));
                }
            }
        }

        // Pass 2: rewrite survivors into scratch segments, repointing
        // the index while this type's lock is still held.
        let mut fresh: Vec<Segment> = Vec::new();
        for (entry, old_id, old_offset) in &survivors {
            let needs_new = fresh
                .last()
                .map_or(true, |seg| seg.offset() + entry.size() > self.config.block_size);
            if needs_new {
                fresh.push(Segment::open(scratch, fresh.len() as u32, dtype)?);
            }
            if let Some(segment) = fresh.last_mut() {
                let offset = segment.write(entry)?;
                repoint(
                    &mut state,
                    entry,
                    (*old_id, *old_offset),
                    (segment.id(), offset),
                )?;
            }
        }
        for segment in &fresh {
            segment.sync()?;
        }

        // Swap: unlink the old archived files, move the fresh ones in.
        let old_count = set.archived.len();
        let old_paths: Vec<PathBuf> = set
            .archived
            .values()
            .map(|segment| segment.path().to_path_buf())
            .collect();
        set.archived.clear();
        for path in &old_paths {
            fs::remove_file(path)?;
        }

        let fresh_count = fresh.len() as u32;
        drop(fresh);
        for id in 0..fresh_count {
            let from = scratch.join(dtype.file_name(id));
            let to = self.config.dir_path.join(dtype.file_name(id));
            fs::rename(&from, &to)?;
            set.archived
                .insert(id, Segment::open(&self.config.dir_path, id, dtype)?);
        }

        tracing::info!(
            dtype = dtype.suffix(),
            old_segments = old_count,
            new_segments = fresh_count,
            live_entries = survivors.len(),
            "reclaimed segments"
        );
        Ok(())
    }
}

fn has_future_deadline<I>(state: &TypeState<I>, key: &[u8]) -> bool {
    match state.expires.get(key) {
        Some(&deadline) => deadline > unix_now(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::db::Db;
    use crate::error::Error;
    use crate::storage::DataType;
    use tempfile::TempDir;

    fn small_db(dir: &TempDir) -> Db {
        // A tiny block size forces frequent rotation.
        Db::open(
            Config::new(dir.path())
                .block_size(512)
                .reclaim_threshold(2),
        )
        .expect("open db")
    }

    fn archived_count(db: &Db, dtype: DataType) -> usize {
        db.segments[dtype.tag() as usize]
            .lock()
            .expect("lock segments")
            .archived
            .len()
    }

    #[test]
    fn test_reclaim_below_threshold() {
        let dir = TempDir::new().expect("create temp dir");
        let db = Db::open(Config::new(dir.path())).expect("open db");
        assert_eq!(db.reclaim(), Err(Error::ReclaimUnreached));
    }

    #[test]
    fn test_reclaim_drops_dead_string_entries() {
        let dir = TempDir::new().expect("create temp dir");
        let db = small_db(&dir);

        // Overwrite a handful of keys many times to pile up dead data.
        for round in 0..40 {
            for key in 0..5 {
                let k = format!("key-{key}");
                let v = format!("value-{key}-{round}");
                db.set(k.as_bytes(), v.as_bytes()).expect("set");
            }
        }
        assert!(archived_count(&db, DataType::String) >= 2);

        db.reclaim().expect("reclaim");

        assert!(archived_count(&db, DataType::String) <= 1);
        for key in 0..5 {
            let k = format!("key-{key}");
            let expected = format!("value-{key}-39");
            assert_eq!(db.get(k.as_bytes()).expect("get"), expected.as_bytes());
        }
    }

    #[test]
    fn test_reclaim_preserves_values_across_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let db = small_db(&dir);
            for round in 0..40 {
                for key in 0..5 {
                    let k = format!("key-{key}");
                    let v = format!("value-{key}-{round}");
                    db.set(k.as_bytes(), v.as_bytes()).expect("set");
                }
            }
            db.reclaim().expect("reclaim");
            db.close().expect("close");
        }

        let db = small_db(&dir);
        for key in 0..5 {
            let k = format!("key-{key}");
            let expected = format!("value-{key}-39");
            assert_eq!(db.get(k.as_bytes()).expect("get"), expected.as_bytes());
        }
    }

    #[test]
    fn test_reclaim_collections_survive() {
        let dir = TempDir::new().expect("create temp dir");
        let db = small_db(&dir);

        // Hash churn: only the last value per field stays live.
        for round in 0..30 {
            for field in 0..4 {
                let f = format!("field-{field}");
                let v = format!("v-{field}-{round}");
                db.hset(b"h", f.as_bytes(), v.as_bytes()).expect("hset");
            }
        }
        // Set churn: add and remove to create garbage.
        for round in 0..30 {
            let m = format!("member-{round}");
            db.sadd(b"s", &[m.as_bytes()]).expect("sadd");
            if round % 2 == 0 {
                db.srem(b"s", &[m.as_bytes()]).expect("srem");
            }
        }
        // ZSet churn: score updates.
        for round in 0..30 {
            db.zadd(b"z", round as f64, b"m").expect("zadd");
        }

        db.reclaim().expect("reclaim");

        for field in 0..4 {
            let f = format!("field-{field}");
            let expected = format!("v-{field}-29");
            assert_eq!(
                db.hget(b"h", f.as_bytes()).expect("hget"),
                Some(expected.into_bytes())
            );
        }
        assert_eq!(db.scard(b"s").expect("scard"), 15);
        assert_eq!(db.zscore(b"z", b"m").expect("zscore"), Some(29.0));

        // The scratch directory is gone.
        assert!(!dir.path().join(super::RECLAIM_DIR).exists());
    }
}
