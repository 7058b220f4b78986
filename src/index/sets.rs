use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};

type Members = HashSet<Vec<u8>>;

/// The in-memory set index: key → unique members.
#[derive(Default)]
pub struct SetIndex {
    records: HashMap<Vec<u8>, Members>,
}

impl SetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member, returning the resulting cardinality.
    pub fn sadd(&mut self, key: &[u8], member: Vec<u8>) -> usize {
        let members = self.records.entry(key.to_vec()).or_default();
        members.insert(member);
        members.len()
    }

    /// Removes and returns up to `count` arbitrary members.
    pub fn spop(&mut self, key: &[u8], count: usize) -> Vec<Vec<u8>> {
        let Some(members) = self.records.get_mut(key) else {
            return Vec::new();
        };
        let mut rng = rand::thread_rng();
        let picked: Vec<Vec<u8>> = members
            .iter()
            .cloned()
            .choose_multiple(&mut rng, count.min(members.len()));
        for member in &picked {
            members.remove(member);
        }
        picked
    }

    pub fn sis_member(&self, key: &[u8], member: &[u8]) -> bool {
        self.records
            .get(key)
            .map_or(false, |members| members.contains(member))
    }

    /// Random members without removal. `count` > 0 returns up to `count`
    /// distinct members; `count` < 0 returns `|count|` samples that may
    /// repeat; `count` == 0 returns nothing.
    pub fn srand_member(&self, key: &[u8], count: i64) -> Vec<Vec<u8>> {
        let Some(members) = self.records.get(key) else {
            return Vec::new();
        };
        if members.is_empty() || count == 0 {
            return Vec::new();
        }

        let mut rng = rand::thread_rng();
        if count > 0 {
            members
                .iter()
                .cloned()
                .choose_multiple(&mut rng, count as usize)
        } else {
            let pool: Vec<&Vec<u8>> = members.iter().collect();
            (0..count.unsigned_abs())
                .map(|_| pool[rng.gen_range(0..pool.len())].clone())
                .collect()
        }
    }

    /// Removes a member. Returns whether it was present.
    pub fn srem(&mut self, key: &[u8], member: &[u8]) -> bool {
        self.records
            .get_mut(key)
            .map_or(false, |members| members.remove(member))
    }

    /// Moves a member from `src` to `dst`. Returns whether it moved.
    pub fn smove(&mut self, src: &[u8], dst: &[u8], member: &[u8]) -> bool {
        let removed = match self.records.get_mut(src) {
            Some(members) => members.remove(member),
            None => false,
        };
        if !removed {
            return false;
        }
        self.records
            .entry(dst.to_vec())
            .or_default()
            .insert(member.to_vec());
        true
    }

    pub fn scard(&self, key: &[u8]) -> usize {
        self.records.get(key).map_or(0, |members| members.len())
    }

    pub fn smembers(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.records
            .get(key)
            .map_or_else(Vec::new, |members| members.iter().cloned().collect())
    }

    /// Members of the union of all given keys.
    pub fn sunion(&self, keys: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut union = HashSet::new();
        for key in keys {
            if let Some(members) = self.records.get(*key) {
                for member in members {
                    union.insert(member.clone());
                }
            }
        }
        union.into_iter().collect()
    }

    /// Members of the first key that are in none of the successors.
    pub fn sdiff(&self, keys: &[&[u8]]) -> Vec<Vec<u8>> {
        let Some((first, rest)) = keys.split_first() else {
            return Vec::new();
        };
        let Some(members) = self.records.get(*first) else {
            return Vec::new();
        };

        members
            .iter()
            .filter(|member| !rest.iter().any(|key| self.sis_member(key, member)))
            .cloned()
            .collect()
    }

    pub fn skey_exists(&self, key: &[u8]) -> bool {
        self.records.contains_key(key)
    }

    pub fn sclear(&mut self, key: &[u8]) {
        self.records.remove(key);
    }
}
