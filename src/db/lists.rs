use crate::db::recovery::{join_insert_extra, join_trim_extra};
use crate::db::{unix_now, Db};
use crate::error::{Error, Result};
use crate::index::InsertOption;
use crate::storage::entry::Entry;
use crate::storage::{DataType, ListOp, EXTRA_SEPARATOR};

impl Db {
    /// Pushes values to the head of the list, creating it when absent.
    /// Returns the resulting length.
    pub fn lpush(&self, key: &[u8], values: &[&[u8]]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key_value(key, values)?;

        let mut state = self.lists.write()?;
        self.check_expired(&mut state, key)?;

        let mut len = 0;
        for value in values {
            let e = Entry::no_extra(
                key.to_vec(),
                value.to_vec(),
                DataType::List,
                ListOp::LPush as u16,
            );
            self.store(&e)?;
            len = state.index.lpush(key, value.to_vec());
        }
        Ok(len)
    }

    /// Pushes values to the tail of the list, creating it when absent.
    /// Returns the resulting length.
    pub fn rpush(&self, key: &[u8], values: &[&[u8]]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key_value(key, values)?;

        let mut state = self.lists.write()?;
        self.check_expired(&mut state, key)?;

        let mut len = 0;
        for value in values {
            let e = Entry::no_extra(
                key.to_vec(),
                value.to_vec(),
                DataType::List,
                ListOp::RPush as u16,
            );
            self.store(&e)?;
            len = state.index.rpush(key, value.to_vec());
        }
        Ok(len)
    }

    /// Removes and returns the first element.
    pub fn lpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.lists.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }

        match state.index.lpop(key) {
            Some(value) => {
                let e = Entry::no_extra(
                    key.to_vec(),
                    value.clone(),
                    DataType::List,
                    ListOp::LPop as u16,
                );
                self.store(&e)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Removes and returns the last element.
    pub fn rpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.lists.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }

        match state.index.rpop(key) {
            Some(value) => {
                let e = Entry::no_extra(
                    key.to_vec(),
                    value.clone(),
                    DataType::List,
                    ListOp::RPop as u16,
                );
                self.store(&e)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// The element at `index`, negative indices counting from the tail.
    pub fn lindex(&self, key: &[u8], index: i64) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.lists, key)? {
            return Ok(None);
        }
        let state = self.lists.read()?;
        Ok(state.index.lindex(key, index).map(|v| v.to_vec()))
    }

    /// Removes occurrences of `value` (count > 0 head→tail, < 0
    /// tail→head, 0 all). Returns how many were removed.
    pub fn lrem(&self, key: &[u8], value: &[u8], count: i64) -> Result<usize> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        let mut state = self.lists.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }

        let removed = state.index.lrem(key, value, count);
        if removed > 0 {
            let e = Entry::new(
                key.to_vec(),
                value.to_vec(),
                count.to_string().into_bytes(),
                DataType::List,
                ListOp::LRem as u16,
            );
            self.store(&e)?;
        }
        Ok(removed)
    }

    /// Inserts `value` before or after the first occurrence of `pivot`.
    /// Returns the new length, or -1 when the pivot is missing.
    pub fn linsert(
        &self,
        key: &[u8],
        option: InsertOption,
        pivot: &[u8],
        value: &[u8],
    ) -> Result<i64> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;
        if contains_separator(pivot) {
            return Err(Error::ExtraContainsSeparator);
        }

        let mut state = self.lists.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }

        let len = state.index.linsert(key, option, pivot, value.to_vec());
        if len != -1 {
            let e = Entry::new(
                key.to_vec(),
                value.to_vec(),
                join_insert_extra(pivot, option),
                DataType::List,
                ListOp::LInsert as u16,
            );
            self.store(&e)?;
        }
        Ok(len)
    }

    /// Replaces the element at `index`. Returns whether it succeeded.
    pub fn lset(&self, key: &[u8], index: i64, value: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        let mut state = self.lists.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }

        let ok = state.index.lset(key, index, value.to_vec());
        if ok {
            let e = Entry::new(
                key.to_vec(),
                value.to_vec(),
                index.to_string().into_bytes(),
                DataType::List,
                ListOp::LSet as u16,
            );
            self.store(&e)?;
        }
        Ok(ok)
    }

    /// Trims the list to the normalized `[start, end]` range.
    pub fn ltrim(&self, key: &[u8], start: i64, end: i64) -> Result<()> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.lists.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }

        if state.index.ltrim(key, start, end) {
            let e = Entry::new(
                key.to_vec(),
                Vec::new(),
                join_trim_extra(start, end),
                DataType::List,
                ListOp::LTrim as u16,
            );
            self.store(&e)?;
        }
        Ok(())
    }

    /// The elements in the normalized `[start, end]` range.
    pub fn lrange(&self, key: &[u8], start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.lists, key)? {
            return Ok(Vec::new());
        }
        Ok(self.lists.read()?.index.lrange(key, start, end))
    }

    /// The length of the list; 0 when the key is absent.
    pub fn llen(&self, key: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.lists, key)? {
            return Ok(0);
        }
        Ok(self.lists.read()?.index.llen(key))
    }

    /// Whether the list key exists.
    pub fn lkey_exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.lists, key)? {
            return Ok(false);
        }
        Ok(self.lists.read()?.index.lkey_exists(key))
    }

    /// Whether `value` occurs in the list, answered from the companion
    /// count map.
    pub fn lval_exists(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        if self.expire_if_due(&self.lists, key)? {
            return Ok(false);
        }
        Ok(self.lists.read()?.index.lval_exists(key, value))
    }

    /// Removes the whole list.
    pub fn lclear(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.lists.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }
        if !state.index.lkey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let e = Entry::no_extra(key.to_vec(), Vec::new(), DataType::List, ListOp::LClear as u16);
        self.store(&e)?;
        state.index.lclear(key);
        state.expires.remove(key);
        Ok(())
    }

    /// Sets the list's time-to-live to `duration` seconds from now.
    pub fn lexpire(&self, key: &[u8], duration: i64) -> Result<()> {
        self.ensure_open()?;
        if duration <= 0 {
            return Err(Error::InvalidTTL);
        }
        self.check_key(key)?;

        let mut state = self.lists.write()?;
        self.check_expired(&mut state, key)?;
        if !state.index.lkey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let deadline = unix_now() + duration;
        let e = Entry::with_expire(
            key.to_vec(),
            Vec::new(),
            deadline,
            DataType::List,
            ListOp::LExpire as u16,
        );
        self.store(&e)?;
        state.expires.insert(key.to_vec(), deadline);
        Ok(())
    }

    /// Remaining seconds of the list's time-to-live; 0 when none.
    pub fn lttl(&self, key: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        self.check_key(key)?;
        self.ttl_of(&self.lists, key)
    }
}

fn contains_separator(bytes: &[u8]) -> bool {
    bytes
        .windows(EXTRA_SEPARATOR.len())
        .any(|w| w == EXTRA_SEPARATOR.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(Config::new(dir.path())).expect("open db")
    }

    #[test]
    fn test_push_range_pop() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        assert_eq!(db.lpush(b"l", &[b"x", b"y", b"z"]).expect("lpush"), 3);
        assert_eq!(
            db.lrange(b"l", 0, -1).expect("lrange"),
            vec![b"z".to_vec(), b"y".to_vec(), b"x".to_vec()]
        );
        assert_eq!(db.rpop(b"l").expect("rpop"), Some(b"x".to_vec()));
        assert_eq!(db.llen(b"l").expect("llen"), 2);
        assert_eq!(db.lpop(b"empty").expect("lpop missing"), None);
    }

    #[test]
    fn test_lindex_lset() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.rpush(b"l", &[b"a", b"b", b"c"]).expect("rpush");
        assert_eq!(db.lindex(b"l", 0).expect("lindex"), Some(b"a".to_vec()));
        assert_eq!(db.lindex(b"l", -1).expect("lindex"), Some(b"c".to_vec()));
        assert_eq!(db.lindex(b"l", 9).expect("lindex"), None);

        assert!(db.lset(b"l", 1, b"B").expect("lset"));
        assert!(!db.lset(b"l", 9, b"X").expect("lset out of range"));
        assert_eq!(db.lindex(b"l", 1).expect("lindex"), Some(b"B".to_vec()));
    }

    #[test]
    fn test_lrem_and_lval_exists() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.rpush(b"l", &[b"a", b"b", b"a", b"a"]).expect("rpush");
        assert!(db.lval_exists(b"l", b"a").expect("lval"));
        assert_eq!(db.lrem(b"l", b"a", 0).expect("lrem"), 3);
        assert!(!db.lval_exists(b"l", b"a").expect("lval after"));
        assert_eq!(db.llen(b"l").expect("llen"), 1);
    }

    #[test]
    fn test_linsert_rejects_separator_in_pivot() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.rpush(b"l", &[b"a"]).expect("rpush");
        assert_eq!(
            db.linsert(b"l", InsertOption::Before, b"piv\\0ot", b"v"),
            Err(Error::ExtraContainsSeparator)
        );
        assert_eq!(
            db.linsert(b"l", InsertOption::After, b"a", b"b").expect("linsert"),
            2
        );
        assert_eq!(
            db.linsert(b"l", InsertOption::After, b"missing", b"x").expect("linsert"),
            -1
        );
    }

    #[test]
    fn test_ltrim() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.rpush(b"l", &[b"a", b"b", b"c", b"d"]).expect("rpush");
        db.ltrim(b"l", 1, 2).expect("ltrim");
        assert_eq!(
            db.lrange(b"l", 0, -1).expect("lrange"),
            vec![b"b".to_vec(), b"c".to_vec()]
        );

        // start > end empties the list but keeps the key.
        db.ltrim(b"l", 3, 1).expect("ltrim empty");
        assert_eq!(db.llen(b"l").expect("llen"), 0);
        assert!(db.lkey_exists(b"l").expect("exists"));
    }

    #[test]
    fn test_lclear() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        assert_eq!(db.lclear(b"l"), Err(Error::KeyNotExist));
        db.rpush(b"l", &[b"a"]).expect("rpush");
        db.lclear(b"l").expect("lclear");
        assert!(!db.lkey_exists(b"l").expect("exists"));
    }

    #[test]
    fn test_lexpire_lttl() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        assert_eq!(db.lexpire(b"l", 10), Err(Error::KeyNotExist));
        db.rpush(b"l", &[b"a"]).expect("rpush");
        assert_eq!(db.lexpire(b"l", 0), Err(Error::InvalidTTL));

        db.lexpire(b"l", 50).expect("lexpire");
        let ttl = db.lttl(b"l").expect("lttl");
        assert!(ttl > 40 && ttl <= 50, "unexpected ttl {ttl}");
    }
}
