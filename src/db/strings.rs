use crate::db::{unix_now, Db};
use crate::error::{Error, Result};
use crate::index::StrRecord;
use crate::storage::entry::Entry;
use crate::storage::{DataType, StrOp};

impl Db {
    /// Sets `key` to hold `value`, overwriting any previous value and
    /// discarding any time-to-live. Setting the value a key already
    /// holds appends nothing.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        let mut state = self.strings.write()?;
        self.check_expired(&mut state, key)?;
        if let Some(record) = state.index.get(key) {
            if record.value == value {
                return Ok(());
            }
        }

        let e = Entry::no_extra(
            key.to_vec(),
            value.to_vec(),
            DataType::String,
            StrOp::Set as u16,
        );
        let (file_id, offset) = self.store(&e)?;
        state.expires.remove(key);
        state.index.put(
            key.to_vec(),
            StrRecord {
                file_id,
                offset,
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    /// Sets `key` only if it does not exist. Returns whether it was set.
    /// An expired key counts as absent.
    pub fn set_nx(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        if self.str_exists(key)? {
            return Ok(false);
        }
        self.set(key, value)?;
        Ok(true)
    }

    /// Sets `key` with a time-to-live of `duration` seconds.
    pub fn set_ex(&self, key: &[u8], value: &[u8], duration: i64) -> Result<()> {
        self.ensure_open()?;
        if duration <= 0 {
            return Err(Error::InvalidTTL);
        }
        self.check_key_value(key, &[value])?;

        let mut state = self.strings.write()?;
        let deadline = unix_now() + duration;
        let e = Entry::with_expire(
            key.to_vec(),
            value.to_vec(),
            deadline,
            DataType::String,
            StrOp::Expire as u16,
        );
        let (file_id, offset) = self.store(&e)?;
        state.index.put(
            key.to_vec(),
            StrRecord {
                file_id,
                offset,
                value: value.to_vec(),
            },
        );
        state.expires.insert(key.to_vec(), deadline);
        Ok(())
    }

    /// The value of `key`. Fails with [`Error::KeyNotExist`] or
    /// [`Error::KeyExpired`]; the latter also performs lazy cleanup.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.strings, key)? {
            return Err(Error::KeyExpired);
        }
        let state = self.strings.read()?;
        match state.index.get(key) {
            Some(record) => Ok(record.value.clone()),
            None => Err(Error::KeyNotExist),
        }
    }

    /// Sets `key` to `value` and returns the value it held before, if
    /// any.
    pub fn get_set(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let old = match self.get(key) {
            Ok(v) => Some(v),
            Err(Error::KeyNotExist) | Err(Error::KeyExpired) => None,
            Err(err) => return Err(err),
        };
        self.set(key, value)?;
        Ok(old)
    }

    /// Appends `value` to the string at `key`, creating it when absent.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        let mut combined = match self.get(key) {
            Ok(v) => v,
            Err(Error::KeyNotExist) | Err(Error::KeyExpired) => Vec::new(),
            Err(err) => return Err(err),
        };
        combined.extend_from_slice(value);
        self.set(key, &combined)
    }

    /// Whether `key` holds a live string value.
    pub fn str_exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.strings, key)? {
            return Ok(false);
        }
        Ok(self.strings.read()?.index.exists(key))
    }

    /// Removes the value stored at `key`.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.strings.write()?;
        let e = Entry::no_extra(key.to_vec(), Vec::new(), DataType::String, StrOp::Rem as u16);
        self.store(&e)?;
        state.index.remove(key);
        state.expires.remove(key);
        Ok(())
    }

    /// Values of the keys matching `prefix`, in key order, skipping
    /// expired keys. `offset` skips that many matches; a negative
    /// `limit` returns all remaining matches.
    pub fn prefix_scan(&self, prefix: &[u8], limit: i64, offset: i64) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(prefix)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let offset = offset.max(0) as usize;

        let state = self.strings.read()?;
        let now = unix_now();
        let mut out = Vec::new();
        let mut remaining = limit;

        for (key, record) in state.index.range_from(prefix).skip(offset) {
            if !key.starts_with(prefix) {
                break;
            }
            if remaining == 0 {
                break;
            }
            // Scans hold the read lock, so expired keys are skipped here
            // and cleaned up by the next keyed access.
            match state.expires.get(key) {
                Some(&deadline) if now > deadline => continue,
                _ => {}
            }
            out.push(record.value.clone());
            if remaining > 0 {
                remaining -= 1;
            }
        }
        Ok(out)
    }

    /// Values of the keys in `[start, end]`, in key order, skipping
    /// expired keys.
    pub fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(start)?;
        self.check_key(end)?;

        let state = self.strings.read()?;
        let now = unix_now();
        let mut out = Vec::new();

        for (key, record) in state.index.range_from(start) {
            if key > end {
                break;
            }
            match state.expires.get(key) {
                Some(&deadline) if now > deadline => continue,
                _ => {}
            }
            out.push(record.value.clone());
        }
        Ok(out)
    }

    /// Sets the key's time-to-live to `duration` seconds from now.
    pub fn expire(&self, key: &[u8], duration: i64) -> Result<()> {
        self.ensure_open()?;
        if duration <= 0 {
            return Err(Error::InvalidTTL);
        }
        self.check_key(key)?;

        let mut state = self.strings.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }
        let value = match state.index.get(key) {
            Some(record) => record.value.clone(),
            None => return Err(Error::KeyNotExist),
        };

        let deadline = unix_now() + duration;
        let e = Entry::with_expire(
            key.to_vec(),
            value,
            deadline,
            DataType::String,
            StrOp::Expire as u16,
        );
        self.store(&e)?;
        state.expires.insert(key.to_vec(), deadline);
        Ok(())
    }

    /// Clears the key's time-to-live.
    pub fn persist(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.strings.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }
        let value = match state.index.get(key) {
            Some(record) => record.value.clone(),
            None => return Err(Error::KeyNotExist),
        };

        let e = Entry::no_extra(key.to_vec(), value, DataType::String, StrOp::Persist as u16);
        self.store(&e)?;
        state.expires.remove(key);
        Ok(())
    }

    /// Remaining seconds of the key's time-to-live; 0 when none.
    pub fn ttl(&self, key: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        self.check_key(key)?;
        self.ttl_of(&self.strings, key)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::db::Db;
    use crate::error::Error;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(Config::new(dir.path())).expect("open db")
    }

    #[test]
    fn test_set_get_overwrite() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.set(b"a", b"1").expect("set a=1");
        db.set(b"a", b"2").expect("set a=2");
        assert_eq!(db.get(b"a").expect("get a"), b"2");
        assert_eq!(db.get(b"missing"), Err(Error::KeyNotExist));
    }

    #[test]
    fn test_set_same_value_appends_nothing() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.set(b"a", b"1").expect("set");
        let before = db.segments[0].lock().expect("lock").active.offset();
        db.set(b"a", b"1").expect("set again");
        let after = db.segments[0].lock().expect("lock").active.offset();
        assert_eq!(before, after);
    }

    #[test]
    fn test_set_nx() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        assert!(db.set_nx(b"k", b"v1").expect("first setnx"));
        assert!(!db.set_nx(b"k", b"v2").expect("second setnx"));
        assert_eq!(db.get(b"k").expect("get"), b"v1");
    }

    #[test]
    fn test_get_set() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        assert_eq!(db.get_set(b"k", b"v1").expect("first"), None);
        assert_eq!(db.get_set(b"k", b"v2").expect("second"), Some(b"v1".to_vec()));
        assert_eq!(db.get(b"k").expect("get"), b"v2");
    }

    #[test]
    fn test_append() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.append(b"k", b"foo").expect("append to missing");
        db.append(b"k", b"bar").expect("append to existing");
        assert_eq!(db.get(b"k").expect("get"), b"foobar");
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.set(b"k", b"v").expect("set");
        db.remove(b"k").expect("remove");
        assert_eq!(db.get(b"k"), Err(Error::KeyNotExist));
        assert!(!db.str_exists(b"k").expect("exists"));
    }

    #[test]
    fn test_prefix_scan() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.set(b"user:1", b"alice").expect("set");
        db.set(b"user:2", b"bob").expect("set");
        db.set(b"user:3", b"carol").expect("set");
        db.set(b"game:1", b"chess").expect("set");

        let all = db.prefix_scan(b"user:", -1, 0).expect("scan all");
        assert_eq!(all, vec![b"alice".to_vec(), b"bob".to_vec(), b"carol".to_vec()]);

        let limited = db.prefix_scan(b"user:", 2, 0).expect("scan limited");
        assert_eq!(limited, vec![b"alice".to_vec(), b"bob".to_vec()]);

        let offset = db.prefix_scan(b"user:", -1, 1).expect("scan offset");
        assert_eq!(offset, vec![b"bob".to_vec(), b"carol".to_vec()]);

        assert!(db.prefix_scan(b"nothing", -1, 0).expect("scan none").is_empty());
        assert!(db.prefix_scan(b"user:", 0, 0).expect("scan zero").is_empty());
    }

    #[test]
    fn test_range_scan() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        for (key, value) in [(b"a", b"1"), (b"c", b"3"), (b"e", b"5")] {
            db.set(key, value).expect("set");
        }

        let range = db.range_scan(b"b", b"e").expect("range scan");
        assert_eq!(range, vec![b"3".to_vec(), b"5".to_vec()]);
    }

    #[test]
    fn test_expire_errors() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        assert_eq!(db.expire(b"k", 0), Err(Error::InvalidTTL));
        assert_eq!(db.expire(b"k", 10), Err(Error::KeyNotExist));
        assert_eq!(db.persist(b"k"), Err(Error::KeyNotExist));
    }

    #[test]
    fn test_ttl_and_persist() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.set(b"k", b"v").expect("set");
        assert_eq!(db.ttl(b"k").expect("ttl without deadline"), 0);

        db.expire(b"k", 100).expect("expire");
        let ttl = db.ttl(b"k").expect("ttl");
        assert!(ttl > 90 && ttl <= 100, "unexpected ttl {ttl}");

        db.persist(b"k").expect("persist");
        assert_eq!(db.ttl(b"k").expect("ttl after persist"), 0);
        assert_eq!(db.get(b"k").expect("get"), b"v");
    }

    #[test]
    fn test_set_clears_ttl() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.set(b"k", b"v").expect("set");
        db.expire(b"k", 100).expect("expire");
        db.set(b"k", b"v2").expect("overwrite");
        assert_eq!(db.ttl(b"k").expect("ttl"), 0);
    }
}
