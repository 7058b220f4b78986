//! zerokv: an embeddable, single-node, persistent key-value engine
//! serving five Redis-style value types (strings, lists, hashes, sets
//! and sorted sets).
//!
//! The design is Bitcask-shaped: every mutation is appended to a
//! per-type segment file, every lookup is answered from in-memory
//! indexes, `open` rebuilds the indexes by replaying the segments, and
//! a reclaim pass rewrites segments to drop dead entries.
//!
//! ```no_run
//! use zerokv::{Config, Db};
//!
//! let db = Db::open(Config::new("/tmp/zerokv-demo"))?;
//! db.set(b"name", b"zero")?;
//! assert_eq!(db.get(b"name")?, b"zero");
//!
//! db.txn(|tx| {
//!     tx.set(b"k1", b"v1")?;
//!     tx.hset(b"h1", b"f1", b"v1")
//! })?;
//! db.close()?;
//! # Ok::<(), zerokv::Error>(())
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod flock;
pub mod index;
pub mod storage;

pub use config::Config;
pub use db::txn::Txn;
pub use db::Db;
pub use error::{Error, Result};
pub use index::InsertOption;
