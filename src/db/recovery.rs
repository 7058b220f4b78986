use crate::db::txn::TxnMeta;
use crate::db::{unix_now, SegmentSet, TypeState};
use crate::error::{Error, Result};
use crate::index::{
    HashIndex, InsertOption, ListIndex, SetIndex, StrIndex, StrRecord, ZSetIndex,
};
use crate::storage::entry::{Entry, ENTRY_HEADER_SIZE};
use crate::storage::segment::Segment;
use crate::storage::{HashOp, ListOp, SetOp, StrOp, ZSetOp, EXTRA_SEPARATOR};
use std::collections::HashSet;
use std::thread;

/// The index state rebuilt by replaying every segment file.
pub(crate) struct Replayed {
    pub(crate) strings: TypeState<StrIndex>,
    pub(crate) lists: TypeState<ListIndex>,
    pub(crate) hashes: TypeState<HashIndex>,
    pub(crate) sets: TypeState<SetIndex>,
    pub(crate) zsets: TypeState<ZSetIndex>,
    /// Transaction ids seen in each type's active segment; reclaim keeps
    /// exactly these in the rewritten commit log.
    pub(crate) active_tx_ids: HashSet<u64>,
}

/// Replays all five types in parallel and assembles their states.
pub(crate) fn replay(sets: &[SegmentSet; 5], meta: &TxnMeta) -> Result<Replayed> {
    let committed = &meta.committed;

    thread::scope(|scope| {
        let strings = scope.spawn(move || replay_strings(&sets[0], committed));
        let lists = scope.spawn(move || replay_lists(&sets[1], committed));
        let hashes = scope.spawn(move || replay_hashes(&sets[2], committed));
        let set_idx = scope.spawn(move || replay_sets(&sets[3], committed));
        let zsets = scope.spawn(move || replay_zsets(&sets[4], committed));

        let (strings, ids_str) = join(strings)?;
        let (lists, ids_list) = join(lists)?;
        let (hashes, ids_hash) = join(hashes)?;
        let (sets_state, ids_set) = join(set_idx)?;
        let (zsets, ids_zset) = join(zsets)?;

        let mut active_tx_ids = ids_str;
        for ids in [ids_list, ids_hash, ids_set, ids_zset] {
            active_tx_ids.extend(ids);
        }

        Ok(Replayed {
            strings,
            lists,
            hashes,
            sets: sets_state,
            zsets,
            active_tx_ids,
        })
    })
}

type TypeReplay<I> = (TypeState<I>, HashSet<u64>);

fn join<I>(handle: thread::ScopedJoinHandle<'_, Result<TypeReplay<I>>>) -> Result<TypeReplay<I>> {
    handle
        .join()
        .map_err(|_| Error::IO("replay worker panicked".to_string()))?
}

/// Walks one type's segments in id order, filtering transactional
/// entries against the committed set and feeding the survivors to
/// `apply`. Returns the non-zero tx ids seen in the active segment.
fn replay_segments<F>(set: &SegmentSet, committed: &HashSet<u64>, mut apply: F) -> Result<HashSet<u64>>
where
    F: FnMut(&Entry, u32, u64),
{
    let mut active_tx_ids = HashSet::new();
    let segments: Vec<&Segment> = set
        .archived
        .values()
        .chain(std::iter::once(&set.active))
        .collect();
    let last = segments.len() - 1;

    for (i, segment) in segments.iter().enumerate() {
        let end = segment.offset();
        let mut offset = 0u64;

        while offset < end {
            if end - offset < ENTRY_HEADER_SIZE as u64 {
                // A torn tail from an interrupted append; everything
                // before it replayed cleanly.
                tracing::warn!(
                    file = segment.id(),
                    dtype = segment.data_type().suffix(),
                    offset,
                    "truncated entry header at segment tail"
                );
                break;
            }
            let header = segment.read_header(offset)?;
            if offset + header.entry_size() > end {
                tracing::warn!(
                    file = segment.id(),
                    dtype = segment.data_type().suffix(),
                    offset,
                    "truncated entry body at segment tail"
                );
                break;
            }

            let mut entry = segment.read(offset)?;
            let size = entry.size();

            if i == last && entry.tx_id != 0 {
                active_tx_ids.insert(entry.tx_id);
            }
            if entry.tx_id != 0 {
                if !committed.contains(&entry.tx_id) {
                    offset += size;
                    continue;
                }
                entry.tx_id = 0;
            }
            apply(&entry, segment.id(), offset);
            offset += size;
        }
    }
    Ok(active_tx_ids)
}

fn replay_strings(set: &SegmentSet, committed: &HashSet<u64>) -> Result<TypeReplay<StrIndex>> {
    let mut state = TypeState::new(StrIndex::new());
    let ids = replay_segments(set, committed, |entry, file_id, offset| {
        apply_string(&mut state, entry, file_id, offset);
    })?;
    Ok((state, ids))
}

fn replay_lists(set: &SegmentSet, committed: &HashSet<u64>) -> Result<TypeReplay<ListIndex>> {
    let mut state = TypeState::new(ListIndex::new());
    let ids = replay_segments(set, committed, |entry, _, _| {
        apply_list(&mut state, entry);
    })?;
    Ok((state, ids))
}

fn replay_hashes(set: &SegmentSet, committed: &HashSet<u64>) -> Result<TypeReplay<HashIndex>> {
    let mut state = TypeState::new(HashIndex::new());
    let ids = replay_segments(set, committed, |entry, _, _| {
        apply_hash(&mut state, entry);
    })?;
    Ok((state, ids))
}

fn replay_sets(set: &SegmentSet, committed: &HashSet<u64>) -> Result<TypeReplay<SetIndex>> {
    let mut state = TypeState::new(SetIndex::new());
    let ids = replay_segments(set, committed, |entry, _, _| {
        apply_set(&mut state, entry);
    })?;
    Ok((state, ids))
}

fn replay_zsets(set: &SegmentSet, committed: &HashSet<u64>) -> Result<TypeReplay<ZSetIndex>> {
    let mut state = TypeState::new(ZSetIndex::new());
    let ids = replay_segments(set, committed, |entry, _, _| {
        apply_zset(&mut state, entry);
    })?;
    Ok((state, ids))
}

/// Applies one string entry written at `(file_id, offset)` to the index.
/// Shared by replay and transaction commit.
pub(crate) fn apply_string(
    state: &mut TypeState<StrIndex>,
    entry: &Entry,
    file_id: u32,
    offset: u64,
) {
    let record = StrRecord {
        file_id,
        offset,
        value: entry.value.clone(),
    };
    match StrOp::from_mark(entry.mark()) {
        Some(StrOp::Set) => {
            state.index.put(entry.key.clone(), record);
            state.expires.remove(&entry.key);
        }
        Some(StrOp::Rem) => {
            state.index.remove(&entry.key);
            state.expires.remove(&entry.key);
        }
        Some(StrOp::Expire) => {
            let deadline = entry.timestamp as i64;
            if deadline < unix_now() {
                state.index.remove(&entry.key);
                state.expires.remove(&entry.key);
            } else {
                state.expires.insert(entry.key.clone(), deadline);
                state.index.put(entry.key.clone(), record);
            }
        }
        Some(StrOp::Persist) => {
            state.index.put(entry.key.clone(), record);
            state.expires.remove(&entry.key);
        }
        None => {}
    }
}

pub(crate) fn apply_list(state: &mut TypeState<ListIndex>, entry: &Entry) {
    let key = entry.key.as_slice();
    match ListOp::from_mark(entry.mark()) {
        Some(ListOp::LPush) => {
            state.index.lpush(key, entry.value.clone());
        }
        Some(ListOp::RPush) => {
            state.index.rpush(key, entry.value.clone());
        }
        Some(ListOp::LPop) => {
            state.index.lpop(key);
        }
        Some(ListOp::RPop) => {
            state.index.rpop(key);
        }
        Some(ListOp::LRem) => {
            if let Some(count) = parse_i64(&entry.extra) {
                state.index.lrem(key, &entry.value, count);
            }
        }
        Some(ListOp::LInsert) => {
            if let Some((pivot, option)) = split_insert_extra(&entry.extra) {
                state.index.linsert(key, option, &pivot, entry.value.clone());
            }
        }
        Some(ListOp::LSet) => {
            if let Some(index) = parse_i64(&entry.extra) {
                state.index.lset(key, index, entry.value.clone());
            }
        }
        Some(ListOp::LTrim) => {
            if let Some((start, end)) = split_trim_extra(&entry.extra) {
                state.index.ltrim(key, start, end);
            }
        }
        Some(ListOp::LClear) => {
            state.index.lclear(key);
            state.expires.remove(key);
        }
        Some(ListOp::LExpire) => {
            let deadline = entry.timestamp as i64;
            if deadline < unix_now() {
                state.index.lclear(key);
                state.expires.remove(key);
            } else {
                state.expires.insert(key.to_vec(), deadline);
            }
        }
        None => {}
    }
}

pub(crate) fn apply_hash(state: &mut TypeState<HashIndex>, entry: &Entry) {
    let key = entry.key.as_slice();
    match HashOp::from_mark(entry.mark()) {
        Some(HashOp::HSet) => {
            state
                .index
                .hset(key, entry.extra.clone(), entry.value.clone());
        }
        Some(HashOp::HDel) => {
            state.index.hdel(key, &entry.extra);
        }
        Some(HashOp::HClear) => {
            state.index.hclear(key);
            state.expires.remove(key);
        }
        Some(HashOp::HExpire) => {
            let deadline = entry.timestamp as i64;
            if deadline < unix_now() {
                state.index.hclear(key);
                state.expires.remove(key);
            } else {
                state.expires.insert(key.to_vec(), deadline);
            }
        }
        None => {}
    }
}

pub(crate) fn apply_set(state: &mut TypeState<SetIndex>, entry: &Entry) {
    let key = entry.key.as_slice();
    match SetOp::from_mark(entry.mark()) {
        Some(SetOp::SAdd) => {
            state.index.sadd(key, entry.value.clone());
        }
        Some(SetOp::SRem) => {
            state.index.srem(key, &entry.value);
        }
        Some(SetOp::SMove) => {
            state.index.smove(key, &entry.extra, &entry.value);
        }
        Some(SetOp::SClear) => {
            state.index.sclear(key);
            state.expires.remove(key);
        }
        Some(SetOp::SExpire) => {
            let deadline = entry.timestamp as i64;
            if deadline < unix_now() {
                state.index.sclear(key);
                state.expires.remove(key);
            } else {
                state.expires.insert(key.to_vec(), deadline);
            }
        }
        None => {}
    }
}

pub(crate) fn apply_zset(state: &mut TypeState<ZSetIndex>, entry: &Entry) {
    let key = entry.key.as_slice();
    match ZSetOp::from_mark(entry.mark()) {
        Some(ZSetOp::ZAdd) => {
            if let Some(score) = parse_score(&entry.extra) {
                state.index.zadd(key, score, entry.value.clone());
            }
        }
        Some(ZSetOp::ZRem) => {
            state.index.zrem(key, &entry.value);
        }
        Some(ZSetOp::ZClear) => {
            state.index.zclear(key);
            state.expires.remove(key);
        }
        Some(ZSetOp::ZExpire) => {
            let deadline = entry.timestamp as i64;
            if deadline < unix_now() {
                state.index.zclear(key);
                state.expires.remove(key);
            } else {
                state.expires.insert(key.to_vec(), deadline);
            }
        }
        None => {}
    }
}

pub(crate) fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

pub(crate) fn parse_score(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Renders a score the way it is persisted in the `extra` section.
pub(crate) fn format_score(score: f64) -> Vec<u8> {
    format!("{score}").into_bytes()
}

/// Packs an linsert pivot and option into the `extra` section.
pub(crate) fn join_insert_extra(pivot: &[u8], option: InsertOption) -> Vec<u8> {
    let mut extra = pivot.to_vec();
    extra.extend_from_slice(EXTRA_SEPARATOR.as_bytes());
    extra.extend_from_slice((option as u8).to_string().as_bytes());
    extra
}

fn split_insert_extra(extra: &[u8]) -> Option<(Vec<u8>, InsertOption)> {
    let text = std::str::from_utf8(extra).ok()?;
    let (pivot, option) = text.split_once(EXTRA_SEPARATOR)?;
    let option = InsertOption::from_u8(option.parse().ok()?)?;
    Some((pivot.as_bytes().to_vec(), option))
}

/// Packs an ltrim start/end pair into the `extra` section.
pub(crate) fn join_trim_extra(start: i64, end: i64) -> Vec<u8> {
    format!("{start}{EXTRA_SEPARATOR}{end}").into_bytes()
}

fn split_trim_extra(extra: &[u8]) -> Option<(i64, i64)> {
    let text = std::str::from_utf8(extra).ok()?;
    let (start, end) = text.split_once(EXTRA_SEPARATOR)?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DataType;

    #[test]
    fn test_apply_string_set_then_rem() {
        let mut state = TypeState::new(StrIndex::new());

        let set = Entry::no_extra(b"k".to_vec(), b"v".to_vec(), DataType::String, 0);
        apply_string(&mut state, &set, 1, 0);
        assert_eq!(state.index.get(b"k").unwrap().value, b"v");
        assert_eq!(state.index.get(b"k").unwrap().file_id, 1);

        let rem = Entry::no_extra(b"k".to_vec(), Vec::new(), DataType::String, 1);
        apply_string(&mut state, &rem, 1, set.size());
        assert!(state.index.get(b"k").is_none());
    }

    #[test]
    fn test_apply_string_expire_past_and_future() {
        let mut state = TypeState::new(StrIndex::new());

        let future = Entry::with_expire(
            b"k".to_vec(),
            b"v".to_vec(),
            unix_now() + 100,
            DataType::String,
            StrOp::Expire as u16,
        );
        apply_string(&mut state, &future, 0, 0);
        assert!(state.index.exists(b"k"));
        assert!(state.expires.contains_key(b"k".as_slice()));

        let past = Entry::with_expire(
            b"k".to_vec(),
            b"v".to_vec(),
            unix_now() - 100,
            DataType::String,
            StrOp::Expire as u16,
        );
        apply_string(&mut state, &past, 0, 0);
        assert!(!state.index.exists(b"k"));
        assert!(!state.expires.contains_key(b"k".as_slice()));
    }

    #[test]
    fn test_apply_string_set_clears_deadline() {
        let mut state = TypeState::new(StrIndex::new());
        state.expires.insert(b"k".to_vec(), unix_now() + 100);

        let set = Entry::no_extra(b"k".to_vec(), b"v".to_vec(), DataType::String, 0);
        apply_string(&mut state, &set, 0, 0);
        assert!(!state.expires.contains_key(b"k".as_slice()));
    }

    #[test]
    fn test_apply_list_round_trip_marks() {
        let mut state = TypeState::new(ListIndex::new());

        for value in [b"a", b"b", b"c"] {
            let push = Entry::no_extra(
                b"l".to_vec(),
                value.to_vec(),
                DataType::List,
                ListOp::RPush as u16,
            );
            apply_list(&mut state, &push);
        }
        let insert = Entry::new(
            b"l".to_vec(),
            b"x".to_vec(),
            join_insert_extra(b"b", InsertOption::After),
            DataType::List,
            ListOp::LInsert as u16,
        );
        apply_list(&mut state, &insert);
        let trim = Entry::new(
            b"l".to_vec(),
            Vec::new(),
            join_trim_extra(1, 2),
            DataType::List,
            ListOp::LTrim as u16,
        );
        apply_list(&mut state, &trim);

        assert_eq!(
            state.index.lrange(b"l", 0, -1),
            vec![b"b".to_vec(), b"x".to_vec()]
        );
    }

    #[test]
    fn test_apply_zset_parses_score() {
        let mut state = TypeState::new(ZSetIndex::new());
        let add = Entry::new(
            b"z".to_vec(),
            b"m".to_vec(),
            format_score(2.5),
            DataType::ZSet,
            ZSetOp::ZAdd as u16,
        );
        apply_zset(&mut state, &add);
        assert_eq!(state.index.zscore(b"z", b"m"), Some(2.5));
    }

    #[test]
    fn test_score_format_round_trip() {
        for score in [0.0, -1.5, 42.0, 1e9, 0.1] {
            assert_eq!(parse_score(&format_score(score)), Some(score));
        }
    }
}
