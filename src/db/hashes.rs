use crate::db::{unix_now, Db};
use crate::error::{Error, Result};
use crate::storage::entry::Entry;
use crate::storage::{DataType, HashOp};

impl Db {
    /// Sets a hash field. Returns 1 when the field was created, 0 when
    /// it was overwritten. Re-setting the current value appends nothing.
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        let mut state = self.hashes.write()?;
        self.check_expired(&mut state, key)?;
        if state.index.hget(key, field) == Some(value) {
            return Ok(0);
        }

        let e = Entry::new(
            key.to_vec(),
            value.to_vec(),
            field.to_vec(),
            DataType::Hash,
            HashOp::HSet as u16,
        );
        self.store(&e)?;
        Ok(state.index.hset(key, field.to_vec(), value.to_vec()))
    }

    /// Sets a hash field only if it does not exist yet. Returns 1 when
    /// it was created.
    pub fn hset_nx(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key_value(key, &[value])?;

        let mut state = self.hashes.write()?;
        self.check_expired(&mut state, key)?;

        let created = state.index.hset_nx(key, field.to_vec(), value.to_vec());
        if created == 1 {
            let e = Entry::new(
                key.to_vec(),
                value.to_vec(),
                field.to_vec(),
                DataType::Hash,
                HashOp::HSet as u16,
            );
            self.store(&e)?;
        }
        Ok(created)
    }

    /// The value of a hash field, if present.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.hashes, key)? {
            return Ok(None);
        }
        Ok(self.hashes.read()?.index.hget(key, field).map(|v| v.to_vec()))
    }

    /// All fields and values interleaved; order unspecified.
    pub fn hget_all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.hashes, key)? {
            return Ok(Vec::new());
        }
        Ok(self.hashes.read()?.index.hget_all(key))
    }

    /// Deletes fields; returns how many existed.
    pub fn hdel(&self, key: &[u8], fields: &[&[u8]]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.hashes.write()?;
        self.check_expired(&mut state, key)?;

        let mut removed = 0;
        for field in fields {
            if state.index.hdel(key, field) == 1 {
                let e = Entry::new(
                    key.to_vec(),
                    Vec::new(),
                    field.to_vec(),
                    DataType::Hash,
                    HashOp::HDel as u16,
                );
                self.store(&e)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Whether the hash key exists.
    pub fn hkey_exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.hashes, key)? {
            return Ok(false);
        }
        Ok(self.hashes.read()?.index.hkey_exists(key))
    }

    /// Whether a field exists in the hash.
    pub fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.hashes, key)? {
            return Ok(false);
        }
        Ok(self.hashes.read()?.index.hexists(key, field))
    }

    /// Number of fields in the hash.
    pub fn hlen(&self, key: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.hashes, key)? {
            return Ok(0);
        }
        Ok(self.hashes.read()?.index.hlen(key))
    }

    /// All field names.
    pub fn hkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.hashes, key)? {
            return Ok(Vec::new());
        }
        Ok(self.hashes.read()?.index.hkeys(key))
    }

    /// All field values.
    pub fn hvals(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.hashes, key)? {
            return Ok(Vec::new());
        }
        Ok(self.hashes.read()?.index.hvals(key))
    }

    /// Removes the whole hash.
    pub fn hclear(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.hashes.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }
        if !state.index.hkey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let e = Entry::no_extra(key.to_vec(), Vec::new(), DataType::Hash, HashOp::HClear as u16);
        self.store(&e)?;
        state.index.hclear(key);
        state.expires.remove(key);
        Ok(())
    }

    /// Sets the hash's time-to-live to `duration` seconds from now.
    pub fn hexpire(&self, key: &[u8], duration: i64) -> Result<()> {
        self.ensure_open()?;
        if duration <= 0 {
            return Err(Error::InvalidTTL);
        }
        self.check_key(key)?;

        let mut state = self.hashes.write()?;
        self.check_expired(&mut state, key)?;
        if !state.index.hkey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let deadline = unix_now() + duration;
        let e = Entry::with_expire(
            key.to_vec(),
            Vec::new(),
            deadline,
            DataType::Hash,
            HashOp::HExpire as u16,
        );
        self.store(&e)?;
        state.expires.insert(key.to_vec(), deadline);
        Ok(())
    }

    /// Remaining seconds of the hash's time-to-live; 0 when none.
    pub fn httl(&self, key: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        self.check_key(key)?;
        self.ttl_of(&self.hashes, key)
    }
}
