use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Maximum tower height. Enough for tens of millions of keys.
pub const MAX_LEVEL: usize = 18;

/// Branching probability.
pub const PROBABILITY: f64 = 1.0 / std::f64::consts::E;

struct Node<V> {
    key: Vec<u8>,
    value: V,
    // Forward links, one per level of this node's tower.
    next: Vec<Option<usize>>,
}

/// An ordered map from byte keys to values, backed by a skiplist.
///
/// Keys are ordered by unsigned byte comparison. Nodes live in an arena
/// indexed by `usize`, with removed slots recycled through a free list,
/// so the structure owns all of its memory without shared references.
pub struct SkipList<V> {
    head: [Option<usize>; MAX_LEVEL],
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    len: usize,
    rng: SmallRng,
    prob_table: [f64; MAX_LEVEL],
}

impl<V> Default for SkipList<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SkipList<V> {
    pub fn new() -> Self {
        let mut prob_table = [0.0; MAX_LEVEL];
        for (i, p) in prob_table.iter_mut().enumerate() {
            *p = PROBABILITY.powi(i as i32);
        }

        SkipList {
            head: [None; MAX_LEVEL],
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            rng: SmallRng::from_entropy(),
            prob_table,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, idx: usize) -> &Node<V> {
        self.slots[idx].as_ref().expect("skiplist slot is live")
    }

    /// Forward link at `level`, from the head when `from` is None.
    fn next_of(&self, from: Option<usize>, level: usize) -> Option<usize> {
        match from {
            None => self.head[level],
            Some(idx) => self.node(idx).next[level],
        }
    }

    fn set_next(&mut self, from: Option<usize>, level: usize, target: Option<usize>) {
        match from {
            None => self.head[level] = target,
            Some(idx) => {
                self.slots[idx]
                    .as_mut()
                    .expect("skiplist slot is live")
                    .next[level] = target;
            }
        }
    }

    /// For every level, the last node whose key is strictly less than
    /// `key` (None meaning the head).
    fn prev_links(&self, key: &[u8]) -> [Option<usize>; MAX_LEVEL] {
        let mut prevs = [None; MAX_LEVEL];
        let mut prev: Option<usize> = None;

        for level in (0..MAX_LEVEL).rev() {
            while let Some(next) = self.next_of(prev, level) {
                if self.node(next).key.as_slice() < key {
                    prev = Some(next);
                } else {
                    break;
                }
            }
            prevs[level] = prev;
        }
        prevs
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        let mut prev: Option<usize> = None;
        for level in (0..MAX_LEVEL).rev() {
            while let Some(next) = self.next_of(prev, level) {
                if self.node(next).key.as_slice() < key {
                    prev = Some(next);
                } else {
                    break;
                }
            }
        }
        self.next_of(prev, 0)
            .filter(|&idx| self.node(idx).key == key)
    }

    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        let mut level = 1;
        while level < MAX_LEVEL && r < self.prob_table[level] {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Inserts `key`, replacing the value of an existing equal key.
    pub fn put(&mut self, key: Vec<u8>, value: V) {
        let prevs = self.prev_links(&key);

        if let Some(idx) = self.next_of(prevs[0], 0) {
            if self.node(idx).key == key {
                self.slots[idx]
                    .as_mut()
                    .expect("skiplist slot is live")
                    .value = value;
                return;
            }
        }

        let level = self.random_level();
        let idx = self.alloc(Node {
            key,
            value,
            next: vec![None; level],
        });
        for l in 0..level {
            let after = self.next_of(prevs[l], l);
            self.slots[idx].as_mut().expect("skiplist slot is live").next[l] = after;
            self.set_next(prevs[l], l, Some(idx));
        }
        self.len += 1;
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.find(key).map(|idx| &self.node(idx).value)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let idx = self.find(key)?;
        self.slots[idx].as_mut().map(|node| &mut node.value)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let prevs = self.prev_links(key);
        let target = self.next_of(prevs[0], 0)?;
        if self.node(target).key != key {
            return None;
        }

        let height = self.node(target).next.len();
        for l in 0..height {
            let after = self.node(target).next[l];
            self.set_next(prevs[l], l, after);
        }

        let node = self.slots[target].take().expect("skiplist slot is live");
        self.free.push(target);
        self.len -= 1;
        Some(node.value)
    }

    /// In-order iteration over all entries.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            list: self,
            node: self.head[0],
        }
    }

    /// In-order iteration starting at the first key ≥ `start`. Returns
    /// an exhausted iterator when every key is smaller.
    pub fn range_from(&self, start: &[u8]) -> Iter<'_, V> {
        let prevs = self.prev_links(start);
        Iter {
            list: self,
            node: self.next_of(prevs[0], 0),
        }
    }

    /// The first entry whose key is ≥ `prefix`, if any.
    pub fn seek(&self, prefix: &[u8]) -> Option<(&[u8], &V)> {
        self.range_from(prefix).next()
    }
}

pub struct Iter<'a, V> {
    list: &'a SkipList<V>,
    node: Option<usize>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.node?;
        let node = self.list.node(idx);
        self.node = node.next[0];
        Some((node.key.as_slice(), &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let mut list = SkipList::new();
        list.put(b"b".to_vec(), 2);
        list.put(b"a".to_vec(), 1);
        list.put(b"c".to_vec(), 3);

        assert_eq!(list.len(), 3);
        assert_eq!(list.get(b"a"), Some(&1));
        assert_eq!(list.get(b"b"), Some(&2));
        assert_eq!(list.get(b"d"), None);
        assert!(list.exists(b"c"));

        assert_eq!(list.remove(b"b"), Some(2));
        assert_eq!(list.remove(b"b"), None);
        assert_eq!(list.len(), 2);
        assert!(!list.exists(b"b"));
    }

    #[test]
    fn test_put_replaces_on_equal_key() {
        let mut list = SkipList::new();
        list.put(b"key".to_vec(), 1);
        list.put(b"key".to_vec(), 2);

        assert_eq!(list.len(), 1);
        assert_eq!(list.get(b"key"), Some(&2));
    }

    #[test]
    fn test_iteration_is_byte_ordered() {
        let mut list = SkipList::new();
        // 0xff must sort after ASCII under unsigned comparison.
        let keys: Vec<Vec<u8>> = vec![
            b"banana".to_vec(),
            vec![0xff, 0x01],
            b"apple".to_vec(),
            b"app".to_vec(),
            vec![0x00],
        ];
        for (i, key) in keys.iter().enumerate() {
            list.put(key.clone(), i);
        }

        let collected: Vec<Vec<u8>> = list.iter().map(|(k, _)| k.to_vec()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(collected, sorted);
    }

    #[test]
    fn test_seek_finds_first_at_or_after() {
        let mut list = SkipList::new();
        list.put(b"apple".to_vec(), 1);
        list.put(b"apricot".to_vec(), 2);
        list.put(b"banana".to_vec(), 3);

        let (key, _) = list.seek(b"ap").expect("seek ap");
        assert_eq!(key, b"apple");

        let (key, _) = list.seek(b"apricot").expect("seek exact");
        assert_eq!(key, b"apricot");

        assert!(list.seek(b"cherry").is_none());
    }

    #[test]
    fn test_range_from() {
        let mut list = SkipList::new();
        for key in [b"a", b"c", b"e"] {
            list.put(key.to_vec(), ());
        }

        let keys: Vec<Vec<u8>> = list.range_from(b"b").map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let mut list = SkipList::new();
        for i in 0..100u32 {
            list.put(format!("key-{i:03}").into_bytes(), i);
        }
        for i in (0..100u32).step_by(2) {
            assert_eq!(list.remove(format!("key-{i:03}").as_bytes()), Some(i));
        }
        let slots_before = list.slots.len();
        for i in (0..100u32).step_by(2) {
            list.put(format!("key-{i:03}").into_bytes(), i + 1000);
        }

        // Freed slots were recycled, not appended.
        assert_eq!(list.slots.len(), slots_before);
        assert_eq!(list.len(), 100);
        assert_eq!(list.get(b"key-004"), Some(&1004));
        assert_eq!(list.get(b"key-005"), Some(&5));
    }

    #[test]
    fn test_large_insert_ordered() {
        let mut list = SkipList::new();
        for i in (0..1000u32).rev() {
            list.put(i.to_be_bytes().to_vec(), i);
        }
        assert_eq!(list.len(), 1000);

        let values: Vec<u32> = list.iter().map(|(_, v)| *v).collect();
        let expected: Vec<u32> = (0..1000).collect();
        assert_eq!(values, expected);
    }
}
