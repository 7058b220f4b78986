use crate::db::{unix_now, Db};
use crate::error::{Error, Result};
use crate::storage::entry::Entry;
use crate::storage::{DataType, SetOp};

impl Db {
    /// Adds members to the set, ignoring members already present (no
    /// disk append for duplicates). Returns the resulting cardinality.
    pub fn sadd(&self, key: &[u8], members: &[&[u8]]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key_value(key, members)?;

        let mut state = self.sets.write()?;
        self.check_expired(&mut state, key)?;

        for member in members {
            if state.index.sis_member(key, member) {
                continue;
            }
            let e = Entry::no_extra(
                key.to_vec(),
                member.to_vec(),
                DataType::Set,
                SetOp::SAdd as u16,
            );
            self.store(&e)?;
            state.index.sadd(key, member.to_vec());
        }
        Ok(state.index.scard(key))
    }

    /// Removes and returns up to `count` arbitrary members.
    pub fn spop(&self, key: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.sets.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }

        let popped = state.index.spop(key, count);
        for member in &popped {
            let e = Entry::no_extra(
                key.to_vec(),
                member.clone(),
                DataType::Set,
                SetOp::SRem as u16,
            );
            self.store(&e)?;
        }
        Ok(popped)
    }

    /// Whether `member` is in the set.
    pub fn sis_member(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.sets, key)? {
            return Ok(false);
        }
        Ok(self.sets.read()?.index.sis_member(key, member))
    }

    /// Random members without removal; negative counts may repeat.
    pub fn srand_member(&self, key: &[u8], count: i64) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.sets, key)? {
            return Ok(Vec::new());
        }
        Ok(self.sets.read()?.index.srand_member(key, count))
    }

    /// Removes members; returns how many were present.
    pub fn srem(&self, key: &[u8], members: &[&[u8]]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key_value(key, members)?;

        let mut state = self.sets.write()?;
        if self.check_expired(&mut state, key)? {
            return Ok(0);
        }

        let mut removed = 0;
        for member in members {
            if state.index.srem(key, member) {
                let e = Entry::no_extra(
                    key.to_vec(),
                    member.to_vec(),
                    DataType::Set,
                    SetOp::SRem as u16,
                );
                self.store(&e)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Moves `member` from the set at `src` to the set at `dst`.
    pub fn smove(&self, src: &[u8], dst: &[u8], member: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key_value(src, &[member])?;
        self.check_key(dst)?;

        let mut state = self.sets.write()?;
        if self.check_expired(&mut state, src)? {
            return Err(Error::KeyExpired);
        }
        if self.check_expired(&mut state, dst)? {
            return Err(Error::KeyExpired);
        }

        let moved = state.index.smove(src, dst, member);
        if moved {
            let e = Entry::new(
                src.to_vec(),
                member.to_vec(),
                dst.to_vec(),
                DataType::Set,
                SetOp::SMove as u16,
            );
            self.store(&e)?;
        }
        Ok(moved)
    }

    /// The set cardinality; 0 when the key is absent.
    pub fn scard(&self, key: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.sets, key)? {
            return Ok(0);
        }
        Ok(self.sets.read()?.index.scard(key))
    }

    /// All members of the set.
    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.sets, key)? {
            return Ok(Vec::new());
        }
        Ok(self.sets.read()?.index.smembers(key))
    }

    /// Members of the union of all given sets; expired keys contribute
    /// nothing.
    pub fn sunion(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.sets.write()?;
        let mut live = Vec::with_capacity(keys.len());
        for key in keys {
            self.check_key(key)?;
            if !self.check_expired(&mut state, key)? {
                live.push(*key);
            }
        }
        Ok(state.index.sunion(&live))
    }

    /// Members of the first set that are in none of the successors.
    pub fn sdiff(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.sets.write()?;
        let mut live = Vec::with_capacity(keys.len());
        for key in keys {
            self.check_key(key)?;
            if !self.check_expired(&mut state, key)? {
                live.push(*key);
            }
        }
        Ok(state.index.sdiff(&live))
    }

    /// Whether the set key exists.
    pub fn skey_exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.sets, key)? {
            return Ok(false);
        }
        Ok(self.sets.read()?.index.skey_exists(key))
    }

    /// Removes the whole set.
    pub fn sclear(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.sets.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }
        if !state.index.skey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let e = Entry::no_extra(key.to_vec(), Vec::new(), DataType::Set, SetOp::SClear as u16);
        self.store(&e)?;
        state.index.sclear(key);
        state.expires.remove(key);
        Ok(())
    }

    /// Sets the set's time-to-live to `duration` seconds from now.
    pub fn sexpire(&self, key: &[u8], duration: i64) -> Result<()> {
        self.ensure_open()?;
        if duration <= 0 {
            return Err(Error::InvalidTTL);
        }
        self.check_key(key)?;

        let mut state = self.sets.write()?;
        self.check_expired(&mut state, key)?;
        if !state.index.skey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let deadline = unix_now() + duration;
        let e = Entry::with_expire(
            key.to_vec(),
            Vec::new(),
            deadline,
            DataType::Set,
            SetOp::SExpire as u16,
        );
        self.store(&e)?;
        state.expires.insert(key.to_vec(), deadline);
        Ok(())
    }

    /// Remaining seconds of the set's time-to-live; 0 when none.
    pub fn sttl(&self, key: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        self.check_key(key)?;
        self.ttl_of(&self.sets, key)
    }
}
