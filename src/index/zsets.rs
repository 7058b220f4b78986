use crate::index::skiplist::{MAX_LEVEL, PROBABILITY};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// A forward link. `span` is the number of elements the link skips;
/// for a link with no successor it is the distance to the end of the
/// list. Spans make rank queries O(log n).
#[derive(Clone, Copy)]
struct Link {
    next: Option<u32>,
    span: usize,
}

struct ZNode {
    member: Vec<u8>,
    score: f64,
    links: Vec<Link>,
}

/// Orders elements by (score ascending, member lexicographic ascending).
fn before(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> bool {
    a_score < b_score || (a_score == b_score && a_member < b_member)
}

/// The ordered half of a sorted set: an arena-allocated skiplist over
/// (score, member) pairs with per-link spans.
struct ZSkipList {
    head: [Link; MAX_LEVEL],
    slots: Vec<Option<ZNode>>,
    free: Vec<u32>,
    len: usize,
    rng: SmallRng,
    prob_table: [f64; MAX_LEVEL],
}

impl ZSkipList {
    fn new() -> Self {
        let mut prob_table = [0.0; MAX_LEVEL];
        for (i, p) in prob_table.iter_mut().enumerate() {
            *p = PROBABILITY.powi(i as i32);
        }

        ZSkipList {
            head: [Link {
                next: None,
                span: 0,
            }; MAX_LEVEL],
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            rng: SmallRng::from_entropy(),
            prob_table,
        }
    }

    fn node(&self, idx: u32) -> &ZNode {
        self.slots[idx as usize].as_ref().expect("zset slot is live")
    }

    fn link_of(&self, from: Option<u32>, level: usize) -> Link {
        match from {
            None => self.head[level],
            Some(idx) => self.node(idx).links[level],
        }
    }

    fn set_link(&mut self, from: Option<u32>, level: usize, link: Link) {
        match from {
            None => self.head[level] = link,
            Some(idx) => {
                self.slots[idx as usize]
                    .as_mut()
                    .expect("zset slot is live")
                    .links[level] = link;
            }
        }
    }

    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        let mut level = 1;
        while level < MAX_LEVEL && r < self.prob_table[level] {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, node: ZNode) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// For every level, the last position ordered before (score, member)
    /// and the number of elements crossed to reach it.
    fn search(&self, score: f64, member: &[u8]) -> ([Option<u32>; MAX_LEVEL], [usize; MAX_LEVEL]) {
        let mut update = [None; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];
        let mut prev: Option<u32> = None;
        let mut traversed = 0usize;

        for level in (0..MAX_LEVEL).rev() {
            loop {
                let link = self.link_of(prev, level);
                match link.next {
                    Some(next)
                        if before(
                            self.node(next).score,
                            &self.node(next).member,
                            score,
                            member,
                        ) =>
                    {
                        traversed += link.span;
                        prev = Some(next);
                    }
                    _ => break,
                }
            }
            rank[level] = traversed;
            update[level] = prev;
        }
        (update, rank)
    }

    /// Inserts (score, member). The caller guarantees the pair is not
    /// already present.
    fn insert(&mut self, score: f64, member: Vec<u8>) {
        let (update, rank) = self.search(score, &member);
        let height = self.random_level();

        let idx = self.alloc(ZNode {
            member,
            score,
            links: vec![
                Link {
                    next: None,
                    span: 0,
                };
                height
            ],
        });

        for level in 0..height {
            let old = self.link_of(update[level], level);
            let ahead = rank[0] - rank[level];
            self.slots[idx as usize]
                .as_mut()
                .expect("zset slot is live")
                .links[level] = Link {
                next: old.next,
                span: old.span - ahead,
            };
            self.set_link(
                update[level],
                level,
                Link {
                    next: Some(idx),
                    span: ahead + 1,
                },
            );
        }
        for level in height..MAX_LEVEL {
            let mut link = self.link_of(update[level], level);
            link.span += 1;
            self.set_link(update[level], level, link);
        }
        self.len += 1;
    }

    /// Removes (score, member) if present.
    fn delete(&mut self, score: f64, member: &[u8]) -> bool {
        let (update, _) = self.search(score, member);
        let target = match self.link_of(update[0], 0).next {
            Some(idx)
                if self.node(idx).score == score && self.node(idx).member == member =>
            {
                idx
            }
            _ => return false,
        };

        let height = self.node(target).links.len();
        for level in 0..MAX_LEVEL {
            let mut link = self.link_of(update[level], level);
            if level < height && link.next == Some(target) {
                let target_link = self.node(target).links[level];
                link.next = target_link.next;
                link.span += target_link.span;
            }
            link.span -= 1;
            self.set_link(update[level], level, link);
        }

        self.slots[target as usize] = None;
        self.free.push(target);
        self.len -= 1;
        true
    }

    /// 0-based rank of (score, member), low to high.
    fn rank(&self, score: f64, member: &[u8]) -> Option<usize> {
        let (update, rank) = self.search(score, member);
        match self.link_of(update[0], 0).next {
            Some(idx)
                if self.node(idx).score == score && self.node(idx).member == member =>
            {
                Some(rank[0])
            }
            _ => None,
        }
    }

    /// The slot holding the element at a 0-based rank.
    fn node_by_rank(&self, target: usize) -> Option<u32> {
        if target >= self.len {
            return None;
        }
        // Ranks count elements crossed; the target is the (target+1)-th.
        let want = target + 1;
        let mut prev: Option<u32> = None;
        let mut traversed = 0usize;

        for level in (0..MAX_LEVEL).rev() {
            loop {
                let link = self.link_of(prev, level);
                match link.next {
                    Some(next) if traversed + link.span <= want => {
                        traversed += link.span;
                        prev = Some(next);
                        if traversed == want {
                            return Some(next);
                        }
                    }
                    _ => break,
                }
            }
        }
        None
    }

    /// First slot with score ≥ `min`.
    fn first_at_or_above(&self, min: f64) -> Option<u32> {
        let mut prev: Option<u32> = None;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let link = self.link_of(prev, level);
                match link.next {
                    Some(next) if self.node(next).score < min => prev = Some(next),
                    _ => break,
                }
            }
        }
        self.link_of(prev, 0).next
    }

    fn next0(&self, from: u32) -> Option<u32> {
        self.node(from).links[0].next
    }
}

/// One sorted set: member → score dict for O(1) score lookups plus the
/// ordered skiplist.
struct ZSet {
    dict: HashMap<Vec<u8>, f64>,
    list: ZSkipList,
}

impl ZSet {
    fn new() -> Self {
        ZSet {
            dict: HashMap::new(),
            list: ZSkipList::new(),
        }
    }
}

/// The in-memory sorted-set index.
#[derive(Default)]
pub struct ZSetIndex {
    records: HashMap<Vec<u8>, ZSet>,
}

impl Default for ZSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ZSetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the member or updates its score.
    pub fn zadd(&mut self, key: &[u8], score: f64, member: Vec<u8>) {
        let zset = self.records.entry(key.to_vec()).or_default();
        if let Some(&old) = zset.dict.get(&member) {
            if old == score {
                return;
            }
            zset.list.delete(old, &member);
        }
        zset.dict.insert(member.clone(), score);
        zset.list.insert(score, member);
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Option<f64> {
        self.records
            .get(key)
            .and_then(|zset| zset.dict.get(member))
            .copied()
    }

    pub fn zcard(&self, key: &[u8]) -> usize {
        self.records.get(key).map_or(0, |zset| zset.list.len)
    }

    /// 0-based rank low→high, or -1 when absent.
    pub fn zrank(&self, key: &[u8], member: &[u8]) -> i64 {
        let Some(zset) = self.records.get(key) else {
            return -1;
        };
        let Some(&score) = zset.dict.get(member) else {
            return -1;
        };
        zset.list
            .rank(score, member)
            .map_or(-1, |rank| rank as i64)
    }

    /// 0-based rank high→low, or -1 when absent.
    pub fn zrevrank(&self, key: &[u8], member: &[u8]) -> i64 {
        let Some(zset) = self.records.get(key) else {
            return -1;
        };
        let rank = self.zrank(key, member);
        if rank < 0 {
            return -1;
        }
        zset.list.len as i64 - 1 - rank
    }

    /// Adds `increment` to the member's score (0.0 when absent) and
    /// returns the resulting score.
    pub fn zincrby(&mut self, key: &[u8], increment: f64, member: &[u8]) -> f64 {
        let current = self.zscore(key, member).unwrap_or(0.0);
        let updated = current + increment;
        self.zadd(key, updated, member.to_vec());
        updated
    }

    /// Members in the normalized `[start, stop]` rank range, low→high.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Vec<Vec<u8>> {
        self.range_pairs(key, start, stop)
            .into_iter()
            .map(|(member, _)| member)
            .collect()
    }

    pub fn zrange_with_scores(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Vec<u8>, f64)> {
        self.range_pairs(key, start, stop)
    }

    /// Members in the normalized `[start, stop]` rank range, high→low.
    pub fn zrevrange(&self, key: &[u8], start: i64, stop: i64) -> Vec<Vec<u8>> {
        self.rev_range_pairs(key, start, stop)
            .into_iter()
            .map(|(member, _)| member)
            .collect()
    }

    pub fn zrevrange_with_scores(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Vec<u8>, f64)> {
        self.rev_range_pairs(key, start, stop)
    }

    /// The member at a 0-based rank, low→high.
    pub fn zget_by_rank(&self, key: &[u8], rank: i64) -> Option<(Vec<u8>, f64)> {
        let zset = self.records.get(key)?;
        if rank < 0 {
            return None;
        }
        let idx = zset.list.node_by_rank(rank as usize)?;
        let node = zset.list.node(idx);
        Some((node.member.clone(), node.score))
    }

    /// The member at a 0-based rank, high→low.
    pub fn zrevget_by_rank(&self, key: &[u8], rank: i64) -> Option<(Vec<u8>, f64)> {
        let zset = self.records.get(key)?;
        if rank < 0 || rank as usize >= zset.list.len {
            return None;
        }
        self.zget_by_rank(key, zset.list.len as i64 - 1 - rank)
    }

    /// Members with min ≤ score ≤ max, low→high.
    pub fn zscore_range(&self, key: &[u8], min: f64, max: f64) -> Vec<(Vec<u8>, f64)> {
        let Some(zset) = self.records.get(key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cur = zset.list.first_at_or_above(min);
        while let Some(idx) = cur {
            let node = zset.list.node(idx);
            if node.score > max {
                break;
            }
            out.push((node.member.clone(), node.score));
            cur = zset.list.next0(idx);
        }
        out
    }

    /// Members with min ≤ score ≤ max, high→low.
    pub fn zrevscore_range(&self, key: &[u8], max: f64, min: f64) -> Vec<(Vec<u8>, f64)> {
        let mut out = self.zscore_range(key, min, max);
        out.reverse();
        out
    }

    /// Removes a member. Returns whether it was present.
    pub fn zrem(&mut self, key: &[u8], member: &[u8]) -> bool {
        let Some(zset) = self.records.get_mut(key) else {
            return false;
        };
        let Some(score) = zset.dict.remove(member) else {
            return false;
        };
        zset.list.delete(score, member)
    }

    pub fn zkey_exists(&self, key: &[u8]) -> bool {
        self.records.contains_key(key)
    }

    pub fn zclear(&mut self, key: &[u8]) {
        self.records.remove(key);
    }

    fn range_pairs(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Vec<u8>, f64)> {
        let Some(zset) = self.records.get(key) else {
            return Vec::new();
        };
        let Some((start, stop)) = clamp_rank_range(zset.list.len, start, stop) else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(stop - start + 1);
        let mut cur = zset.list.node_by_rank(start);
        let mut rank = start;
        while let Some(idx) = cur {
            if rank > stop {
                break;
            }
            let node = zset.list.node(idx);
            out.push((node.member.clone(), node.score));
            cur = zset.list.next0(idx);
            rank += 1;
        }
        out
    }

    fn rev_range_pairs(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Vec<u8>, f64)> {
        let Some(zset) = self.records.get(key) else {
            return Vec::new();
        };
        let len = zset.list.len;
        let Some((start, stop)) = clamp_rank_range(len, start, stop) else {
            return Vec::new();
        };

        // Reverse ranks map onto forward ranks from the other end.
        let mut out = self.range_pairs(
            key,
            (len - 1 - stop) as i64,
            (len - 1 - start) as i64,
        );
        out.reverse();
        out
    }
}

/// Normalizes a `[start, stop]` rank range the same way list ranges are
/// normalized. None means the range selects nothing.
fn clamp_rank_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let mut start = if start < 0 { start + len as i64 } else { start };
    let mut stop = if stop < 0 { stop + len as i64 } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len as i64 {
        stop = len as i64 - 1;
    }
    if start > stop || start >= len as i64 {
        return None;
    }
    Some((start as usize, stop as usize))
}
