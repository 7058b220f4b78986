use std::time::Duration;
use tempfile::TempDir;
use zerokv::storage::entry::Entry;
use zerokv::storage::segment::Segment;
use zerokv::storage::{DataType, StrOp};
use zerokv::{Config, Db, Error};

fn open_db(dir: &TempDir) -> Db {
    Db::open(Config::new(dir.path())).expect("open db")
}

fn data_files(dir: &TempDir, suffix: &str) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir.path())
        .expect("read data dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(suffix))
        .collect();
    files.sort();
    files
}

#[test]
fn test_last_write_wins_and_survives_reopen() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let db = open_db(&dir);
        db.set(b"a", b"1").expect("set a=1");
        db.set(b"a", b"2").expect("set a=2");
        assert_eq!(db.get(b"a").expect("get"), b"2");
        db.close().expect("close");
    }

    // Both writes are on disk; the index reflects the last.
    let db = open_db(&dir);
    assert_eq!(db.get(b"a").expect("get after reopen"), b"2");
}

#[test]
fn test_list_scenario() {
    let dir = TempDir::new().expect("create temp dir");
    let db = open_db(&dir);

    db.lpush(b"l", &[b"x", b"y", b"z"]).expect("lpush");
    assert_eq!(
        db.lrange(b"l", 0, -1).expect("lrange"),
        vec![b"z".to_vec(), b"y".to_vec(), b"x".to_vec()]
    );
    assert_eq!(db.rpop(b"l").expect("rpop"), Some(b"x".to_vec()));
    assert_eq!(db.llen(b"l").expect("llen"), 2);
}

#[test]
fn test_set_scenario() {
    let dir = TempDir::new().expect("create temp dir");
    let db = open_db(&dir);

    db.sadd(b"s", &[b"a", b"b"]).expect("sadd");
    db.sadd(b"s", &[b"a"]).expect("sadd dup");
    assert_eq!(db.scard(b"s").expect("scard"), 2);

    let mut diff = db.sdiff(&[b"s", b"t"]).expect("sdiff");
    diff.sort();
    assert_eq!(diff, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn test_zset_scenario() {
    let dir = TempDir::new().expect("create temp dir");
    let db = open_db(&dir);

    db.zadd(b"z", 1.0, b"a").expect("zadd a");
    db.zadd(b"z", 2.0, b"b").expect("zadd b");
    db.zadd(b"z", 1.0, b"a").expect("zadd a again");

    assert_eq!(
        db.zrange_with_scores(b"z", 0, -1).expect("zrange"),
        vec![(b"a".to_vec(), 1.0), (b"b".to_vec(), 2.0)]
    );
}

#[test]
fn test_committed_txn_survives_crash() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let db = open_db(&dir);
        db.txn(|tx| {
            tx.set(b"k1", b"v1")?;
            tx.hset(b"h1", b"f1", b"v1")
        })
        .expect("commit txn");
        // Simulated crash: no close.
        drop(db);
    }

    let db = open_db(&dir);
    assert_eq!(db.get(b"k1").expect("get"), b"v1");
    assert_eq!(db.hget(b"h1", b"f1").expect("hget"), Some(b"v1".to_vec()));
}

#[test]
fn test_rolled_back_txn_invisible_after_reopen() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let db = open_db(&dir);
        let result = db.txn(|tx| {
            tx.set(b"gone", b"v")?;
            Err(Error::InvalidTTL)
        });
        assert!(result.is_err());
        drop(db);
    }

    let db = open_db(&dir);
    assert_eq!(db.get(b"gone"), Err(Error::KeyNotExist));
}

#[test]
fn test_uncommitted_entry_on_disk_is_filtered() {
    // A crash after segment appends but before the commit-log write
    // leaves transactional entries on disk with no matching id.
    let dir = TempDir::new().expect("create temp dir");
    let mut segment = Segment::open(dir.path(), 0, DataType::String).expect("create segment");
    let entry = Entry::with_txn(
        b"k2".to_vec(),
        b"v2".to_vec(),
        Vec::new(),
        DataType::String,
        StrOp::Set as u16,
        99,
    );
    segment.write(&entry).expect("write entry");
    segment.sync().expect("sync segment");
    drop(segment);

    let db = open_db(&dir);
    assert_eq!(db.get(b"k2"), Err(Error::KeyNotExist));
}

#[test]
fn test_entry_with_logged_tx_id_is_replayed() {
    let dir = TempDir::new().expect("create temp dir");
    let mut segment = Segment::open(dir.path(), 0, DataType::String).expect("create segment");
    let entry = Entry::with_txn(
        b"k3".to_vec(),
        b"v3".to_vec(),
        Vec::new(),
        DataType::String,
        StrOp::Set as u16,
        7,
    );
    segment.write(&entry).expect("write entry");
    segment.sync().expect("sync segment");
    drop(segment);
    std::fs::write(dir.path().join("DB.TX.META"), 7u64.to_be_bytes()).expect("write commit log");

    let db = open_db(&dir);
    assert_eq!(db.get(b"k3").expect("get"), b"v3");
}

#[test]
fn test_lazy_expiration() {
    let dir = TempDir::new().expect("create temp dir");
    let db = open_db(&dir);

    db.set(b"k", b"v").expect("set");
    db.expire(b"k", 1).expect("expire");
    std::thread::sleep(Duration::from_millis(2100));

    assert_eq!(db.get(b"k"), Err(Error::KeyExpired));
    assert!(!db.str_exists(b"k").expect("exists after expiry"));
    assert_eq!(db.ttl(b"k").expect("ttl"), 0);

    // The expired key behaves as absent for setnx.
    assert!(db.set_nx(b"k", b"v2").expect("setnx"));
    assert_eq!(db.get(b"k").expect("get"), b"v2");
}

#[test]
fn test_expired_key_stays_gone_after_reopen() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let db = open_db(&dir);
        db.set_ex(b"k", b"v", 1).expect("setex");
        db.close().expect("close");
    }
    std::thread::sleep(Duration::from_millis(2100));

    let db = open_db(&dir);
    assert!(!db.str_exists(b"k").expect("exists"));
}

#[test]
fn test_reopen_restores_every_type() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let db = open_db(&dir);
        db.set(b"str", b"value").expect("set");
        db.rpush(b"list", &[b"a", b"b", b"c"]).expect("rpush");
        db.lpop(b"list").expect("lpop");
        db.hset(b"hash", b"f1", b"v1").expect("hset");
        db.hset(b"hash", b"f2", b"v2").expect("hset");
        db.hdel(b"hash", &[b"f2"]).expect("hdel");
        db.sadd(b"set", &[b"m1", b"m2"]).expect("sadd");
        db.srem(b"set", &[b"m1"]).expect("srem");
        db.zadd(b"zset", 2.0, b"b").expect("zadd");
        db.zadd(b"zset", 1.0, b"a").expect("zadd");
        db.zrem(b"zset", b"b").expect("zrem");
        db.close().expect("close");
    }

    let db = open_db(&dir);
    assert_eq!(db.get(b"str").expect("get"), b"value");
    assert_eq!(
        db.lrange(b"list", 0, -1).expect("lrange"),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
    assert_eq!(db.hget(b"hash", b"f1").expect("hget"), Some(b"v1".to_vec()));
    assert_eq!(db.hget(b"hash", b"f2").expect("hget"), None);
    assert_eq!(db.smembers(b"set").expect("smembers"), vec![b"m2".to_vec()]);
    assert_eq!(
        db.zrange_with_scores(b"zset", 0, -1).expect("zrange"),
        vec![(b"a".to_vec(), 1.0)]
    );
}

#[test]
fn test_reclaim_end_to_end() {
    let dir = TempDir::new().expect("create temp dir");
    let config = Config::new(dir.path()).block_size(512).reclaim_threshold(2);
    let db = Db::open(config.clone()).expect("open db");

    // Pile up overwrites until several segments are archived.
    for round in 0..60 {
        for key in 0..4 {
            let k = format!("key-{key}");
            let v = format!("value-{key}-{round}");
            db.set(k.as_bytes(), v.as_bytes()).expect("set");
        }
    }
    let before = data_files(&dir, ".data.str");
    assert!(before.len() > 3, "expected several segments, got {before:?}");

    db.reclaim().expect("reclaim");

    let after = data_files(&dir, ".data.str");
    assert!(after.len() < before.len(), "{after:?} vs {before:?}");

    for key in 0..4 {
        let k = format!("key-{key}");
        let expected = format!("value-{key}-59");
        assert_eq!(db.get(k.as_bytes()).expect("get"), expected.as_bytes());
    }

    // Everything still reads correctly after close and replay.
    db.close().expect("close");
    let db = Db::open(config).expect("reopen db");
    for key in 0..4 {
        let k = format!("key-{key}");
        let expected = format!("value-{key}-59");
        assert_eq!(db.get(k.as_bytes()).expect("get"), expected.as_bytes());
    }
}

#[test]
fn test_txn_then_reclaim_keeps_data() {
    let dir = TempDir::new().expect("create temp dir");
    let config = Config::new(dir.path()).block_size(256).reclaim_threshold(2);
    let db = Db::open(config.clone()).expect("open db");

    for i in 0..50 {
        let key = format!("tk-{}", i % 5);
        let value = format!("tv-{i}");
        db.txn(|tx| tx.set(key.as_bytes(), value.as_bytes()))
            .expect("txn set");
    }
    db.reclaim().expect("reclaim");

    for key in 0..5 {
        let k = format!("tk-{key}");
        let expected = format!("tv-{}", 45 + key);
        assert_eq!(db.get(k.as_bytes()).expect("get"), expected.as_bytes());
    }

    db.close().expect("close");
    let db = Db::open(config).expect("reopen db");
    for key in 0..5 {
        let k = format!("tk-{key}");
        let expected = format!("tv-{}", 45 + key);
        assert_eq!(db.get(k.as_bytes()).expect("get"), expected.as_bytes());
    }
}

#[test]
fn test_prefix_and_range_scans_survive_reopen() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let db = open_db(&dir);
        for i in 0..10 {
            let key = format!("scan:{i:02}");
            let value = format!("v{i}");
            db.set(key.as_bytes(), value.as_bytes()).expect("set");
        }
        db.close().expect("close");
    }

    let db = open_db(&dir);
    let values = db.prefix_scan(b"scan:", -1, 0).expect("prefix scan");
    assert_eq!(values.len(), 10);
    assert_eq!(values[0], b"v0");

    let range = db.range_scan(b"scan:03", b"scan:05").expect("range scan");
    assert_eq!(
        range,
        vec![b"v3".to_vec(), b"v4".to_vec(), b"v5".to_vec()]
    );
}
