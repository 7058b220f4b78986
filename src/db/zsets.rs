use crate::db::recovery::format_score;
use crate::db::{unix_now, Db};
use crate::error::{Error, Result};
use crate::storage::entry::Entry;
use crate::storage::{DataType, ZSetOp};

impl Db {
    /// Adds `member` with `score`, or updates its score. Re-adding with
    /// the same score appends nothing.
    pub fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key_value(key, &[member])?;

        let mut state = self.zsets.write()?;
        self.check_expired(&mut state, key)?;
        if state.index.zscore(key, member) == Some(score) {
            return Ok(());
        }

        let e = Entry::new(
            key.to_vec(),
            member.to_vec(),
            format_score(score),
            DataType::ZSet,
            ZSetOp::ZAdd as u16,
        );
        self.store(&e)?;
        state.index.zadd(key, score, member.to_vec());
        Ok(())
    }

    /// The member's score, if present.
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(None);
        }
        Ok(self.zsets.read()?.index.zscore(key, member))
    }

    /// The sorted-set cardinality; 0 when the key is absent.
    pub fn zcard(&self, key: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(0);
        }
        Ok(self.zsets.read()?.index.zcard(key))
    }

    /// 0-based rank with scores ordered low→high; -1 when absent.
    pub fn zrank(&self, key: &[u8], member: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        self.check_key_value(key, &[member])?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(-1);
        }
        Ok(self.zsets.read()?.index.zrank(key, member))
    }

    /// 0-based rank with scores ordered high→low; -1 when absent.
    pub fn zrevrank(&self, key: &[u8], member: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        self.check_key_value(key, &[member])?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(-1);
        }
        Ok(self.zsets.read()?.index.zrevrank(key, member))
    }

    /// Adds `increment` to the member's score (0 when absent) and
    /// returns the resulting score.
    pub fn zincrby(&self, key: &[u8], increment: f64, member: &[u8]) -> Result<f64> {
        self.ensure_open()?;
        self.check_key_value(key, &[member])?;

        let mut state = self.zsets.write()?;
        self.check_expired(&mut state, key)?;

        let score = state.index.zincrby(key, increment, member);
        let e = Entry::new(
            key.to_vec(),
            member.to_vec(),
            format_score(score),
            DataType::ZSet,
            ZSetOp::ZAdd as u16,
        );
        self.store(&e)?;
        Ok(score)
    }

    /// Members in the normalized `[start, stop]` rank range, low→high.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(Vec::new());
        }
        Ok(self.zsets.read()?.index.zrange(key, start, stop))
    }

    /// Like [`zrange`](Db::zrange), with scores.
    pub fn zrange_with_scores(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(Vec::new());
        }
        Ok(self.zsets.read()?.index.zrange_with_scores(key, start, stop))
    }

    /// Members in the normalized `[start, stop]` rank range, high→low.
    pub fn zrevrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(Vec::new());
        }
        Ok(self.zsets.read()?.index.zrevrange(key, start, stop))
    }

    /// Like [`zrevrange`](Db::zrevrange), with scores.
    pub fn zrevrange_with_scores(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(Vec::new());
        }
        Ok(self
            .zsets
            .read()?
            .index
            .zrevrange_with_scores(key, start, stop))
    }

    /// Removes a member. Returns whether it was present.
    pub fn zrem(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key_value(key, &[member])?;

        let mut state = self.zsets.write()?;
        if self.check_expired(&mut state, key)? {
            return Ok(false);
        }

        let removed = state.index.zrem(key, member);
        if removed {
            let e = Entry::no_extra(
                key.to_vec(),
                member.to_vec(),
                DataType::ZSet,
                ZSetOp::ZRem as u16,
            );
            self.store(&e)?;
        }
        Ok(removed)
    }

    /// The member at a 0-based rank, low→high.
    pub fn zget_by_rank(&self, key: &[u8], rank: i64) -> Result<Option<(Vec<u8>, f64)>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(None);
        }
        Ok(self.zsets.read()?.index.zget_by_rank(key, rank))
    }

    /// The member at a 0-based rank, high→low.
    pub fn zrevget_by_rank(&self, key: &[u8], rank: i64) -> Result<Option<(Vec<u8>, f64)>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(None);
        }
        Ok(self.zsets.read()?.index.zrevget_by_rank(key, rank))
    }

    /// Members with min ≤ score ≤ max, low→high.
    pub fn zscore_range(&self, key: &[u8], min: f64, max: f64) -> Result<Vec<(Vec<u8>, f64)>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(Vec::new());
        }
        Ok(self.zsets.read()?.index.zscore_range(key, min, max))
    }

    /// Members with min ≤ score ≤ max, high→low.
    pub fn zrevscore_range(&self, key: &[u8], max: f64, min: f64) -> Result<Vec<(Vec<u8>, f64)>> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(Vec::new());
        }
        Ok(self.zsets.read()?.index.zrevscore_range(key, max, min))
    }

    /// Whether the sorted-set key exists.
    pub fn zkey_exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.check_key(key)?;

        if self.expire_if_due(&self.zsets, key)? {
            return Ok(false);
        }
        Ok(self.zsets.read()?.index.zkey_exists(key))
    }

    /// Removes the whole sorted set.
    pub fn zclear(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_key(key)?;

        let mut state = self.zsets.write()?;
        if self.check_expired(&mut state, key)? {
            return Err(Error::KeyExpired);
        }
        if !state.index.zkey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let e = Entry::no_extra(key.to_vec(), Vec::new(), DataType::ZSet, ZSetOp::ZClear as u16);
        self.store(&e)?;
        state.index.zclear(key);
        state.expires.remove(key);
        Ok(())
    }

    /// Sets the sorted set's time-to-live to `duration` seconds from
    /// now.
    pub fn zexpire(&self, key: &[u8], duration: i64) -> Result<()> {
        self.ensure_open()?;
        if duration <= 0 {
            return Err(Error::InvalidTTL);
        }
        self.check_key(key)?;

        let mut state = self.zsets.write()?;
        self.check_expired(&mut state, key)?;
        if !state.index.zkey_exists(key) {
            return Err(Error::KeyNotExist);
        }

        let deadline = unix_now() + duration;
        let e = Entry::with_expire(
            key.to_vec(),
            Vec::new(),
            deadline,
            DataType::ZSet,
            ZSetOp::ZExpire as u16,
        );
        self.store(&e)?;
        state.expires.insert(key.to_vec(), deadline);
        Ok(())
    }

    /// Remaining seconds of the sorted set's time-to-live; 0 when none.
    pub fn zttl(&self, key: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        self.check_key(key)?;
        self.ttl_of(&self.zsets, key)
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
    fn test_zadd_zscore_zcard() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.zadd(b"z", 1.0, b"a").expect("zadd a");
        db.zadd(b"z", 2.0, b"b").expect("zadd b");
        assert_eq!(db.zscore(b"z", b"a").expect("zscore"), Some(1.0));
        assert_eq!(db.zscore(b"z", b"x").expect("zscore missing"), None);
        assert_eq!(db.zcard(b"z").expect("zcard"), 2);
    }

    #[test]
    fn test_zadd_same_score_appends_nothing() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.zadd(b"z", 1.0, b"a").expect("zadd");
        let before = db.segments[4].lock().expect("lock").active.offset();
        db.zadd(b"z", 1.0, b"a").expect("zadd same");
        let after = db.segments[4].lock().expect("lock").active.offset();
        assert_eq!(before, after);
    }

    #[test]
    fn test_zrange_with_scores() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.zadd(b"z", 1.0, b"a").expect("zadd");
        db.zadd(b"z", 2.0, b"b").expect("zadd");
        db.zadd(b"z", 1.0, b"a").expect("zadd same again");

        assert_eq!(
            db.zrange_with_scores(b"z", 0, -1).expect("zrange"),
            vec![(b"a".to_vec(), 1.0), (b"b".to_vec(), 2.0)]
        );
        assert_eq!(
            db.zrevrange(b"z", 0, -1).expect("zrevrange"),
            vec![b"b".to_vec(), b"a".to_vec()]
        );
    }

    #[test]
    fn test_zrank_and_incr() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.zadd(b"z", 1.0, b"a").expect("zadd");
        db.zadd(b"z", 2.0, b"b").expect("zadd");
        assert_eq!(db.zrank(b"z", b"a").expect("zrank"), 0);
        assert_eq!(db.zrevrank(b"z", b"a").expect("zrevrank"), 1);
        assert_eq!(db.zrank(b"z", b"x").expect("zrank missing"), -1);

        assert_eq!(db.zincrby(b"z", 5.0, b"a").expect("zincrby"), 6.0);
        assert_eq!(db.zrank(b"z", b"a").expect("zrank after"), 1);
    }

    #[test]
    fn test_zrem_and_ranks() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        db.zadd(b"z", 1.0, b"a").expect("zadd");
        db.zadd(b"z", 2.0, b"b").expect("zadd");
        assert!(db.zrem(b"z", b"a").expect("zrem"));
        assert!(!db.zrem(b"z", b"a").expect("zrem again"));
        assert_eq!(db.zget_by_rank(b"z", 0).expect("byrank"), Some((b"b".to_vec(), 2.0)));
        assert_eq!(db.zrevget_by_rank(b"z", 0).expect("revbyrank"), Some((b"b".to_vec(), 2.0)));
    }

    #[test]
    fn test_zscore_range() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        for (score, member) in [(1.0, b"a"), (2.0, b"b"), (3.0, b"c")] {
            db.zadd(b"z", score, member).expect("zadd");
        }
        assert_eq!(
            db.zscore_range(b"z", 1.5, 3.0).expect("zscore range"),
            vec![(b"b".to_vec(), 2.0), (b"c".to_vec(), 3.0)]
        );
        assert_eq!(
            db.zrevscore_range(b"z", 2.5, 0.5).expect("zrev score range"),
            vec![(b"b".to_vec(), 2.0), (b"a".to_vec(), 1.0)]
        );
    }

    #[test]
    fn test_zclear_zexpire() {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_db(&dir);

        assert_eq!(db.zclear(b"z"), Err(Error::KeyNotExist));
        assert_eq!(db.zexpire(b"z", 10), Err(Error::KeyNotExist));

        db.zadd(b"z", 1.0, b"a").expect("zadd");
        db.zexpire(b"z", 25).expect("zexpire");
        let ttl = db.zttl(b"z").expect("zttl");
        assert!(ttl > 15 && ttl <= 25, "unexpected ttl {ttl}");

        db.zclear(b"z").expect("zclear");
        assert!(!db.zkey_exists(b"z").expect("exists"));
        assert_eq!(db.zttl(b"z").expect("ttl after clear"), 0);
    }
}
