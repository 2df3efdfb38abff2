//! Versioned store on top of LMDB
//!
//! Every put and delete is given a [`Timestamp`] and recorded in three
//! indices living in one LMDB environment:
//!
//! ```text
//! key_to_time   table key -> timestamp of its newest mutation
//! time_to_key   timestamp -> table key        (append-only log)
//! time_to_data  timestamp -> value            (puts only)
//! ```
//!
//! Two more databases carry the replication bookkeeping: `nodes`, the
//! registry of known peers, and `node_time`, each peer's backlog of
//! mutations it has not been confirmed to hold.
//!
//! Deletes never erase rows. They are tombstones in the log so that a
//! peer joining late still learns about them.

pub mod cursor;
pub mod keys;
pub mod nodes;
pub mod ops;
pub mod pending;
pub mod timestamp;
pub mod txn;

pub use cursor::TableCursor;
pub use keys::TableKey;
pub use ops::{ApplyOutcome, MAX_RECORD_SIZE, Mutation};
pub use pending::{PendingFlag, Received, Record};
pub use timestamp::{OpKind, Timestamp, TxnClock};
pub use txn::WriteTxn;

use crate::Result;
use heed::types::{Bytes, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use parking_lot::Mutex;
use pending::PendingFlagCodec;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use timestamp::wall_clock;
use tracing::info;

const DB_KEY_TO_TIME: &str = "key_to_time";
const DB_TIME_TO_KEY: &str = "time_to_key";
const DB_TIME_TO_DATA: &str = "time_to_data";
const DB_NODES: &str = "nodes";
const DB_NODE_TIME: &str = "node_time";

/// Default LMDB map size (1 GiB)
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Options for opening a [`Store`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum size of the LMDB memory map in bytes
    pub map_size: usize,
    /// Origin id stamped into every local timestamp; random when `None`
    pub origin: Option<u32>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            origin: None,
        }
    }
}

impl StoreOptions {
    /// Set the map size
    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    /// Pin the origin id
    pub fn with_origin(mut self, origin: u32) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Counters reported by [`Store::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Rows in the mutation log
    pub log_len: u64,
    /// Keys ever written, tombstoned ones included
    pub keys: u64,
    /// Keys whose newest mutation is a put
    pub live_keys: u64,
    /// Registered peers
    pub nodes: u64,
    /// Pending entries across all peers
    pub pending: u64,
}

/// Handle to an opened store
///
/// Cloning is cheap and every clone shares the same environment. All
/// access goes through transactions, so the handle can be shared freely
/// between threads.
#[derive(Clone)]
pub struct Store {
    env: Env,
    path: PathBuf,
    origin: u32,
    last_instant: Arc<Mutex<u64>>,
    key_to_time: Database<Bytes, Bytes>,
    time_to_key: Database<Bytes, Bytes>,
    time_to_data: Database<Bytes, Bytes>,
    nodes: Database<Str, Unit>,
    node_time: Database<Bytes, PendingFlagCodec>,
}

impl Store {
    /// Open or create a store in the directory at `path`
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chronokv_core::store::{Store, StoreOptions};
    ///
    /// let store = Store::open("./data/node-a", StoreOptions::default()).unwrap();
    /// let mut txn = store.write_txn().unwrap();
    /// store.put(&mut txn, b"users", b"alice", b"admin").unwrap();
    /// txn.commit().unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size)
                .max_dbs(5)
                .open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let key_to_time = env.create_database(&mut wtxn, Some(DB_KEY_TO_TIME))?;
        let time_to_key = env.create_database(&mut wtxn, Some(DB_TIME_TO_KEY))?;
        let time_to_data = env.create_database(&mut wtxn, Some(DB_TIME_TO_DATA))?;
        let nodes = env.create_database(&mut wtxn, Some(DB_NODES))?;
        let node_time = env.create_database(&mut wtxn, Some(DB_NODE_TIME))?;
        wtxn.commit()?;

        let origin = options.origin.unwrap_or_else(rand::random);
        info!(path = %path.display(), origin = format_args!("{origin:08x}"), "opened store");

        Ok(Self {
            env,
            path,
            origin,
            last_instant: Arc::new(Mutex::new(0)),
            key_to_time,
            time_to_key,
            time_to_data,
            nodes,
            node_time,
        })
    }

    /// Directory holding the LMDB files
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Origin id of timestamps produced by this store
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Begin a read-only transaction
    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    /// Begin a read/write transaction whose clock samples the current time
    ///
    /// The sample is taken once the write lock is held and never repeats
    /// within this process, so transactions committed one after another
    /// carry increasing timestamps even when the system clock stalls.
    pub fn write_txn(&self) -> Result<WriteTxn<'_>> {
        let txn = self.env.write_txn()?;
        let instant = {
            let mut last = self.last_instant.lock();
            let next = wall_clock().max(last.saturating_add(1));
            *last = next;
            next
        };
        Ok(WriteTxn::new(txn, TxnClock::from_instant(instant, self.origin)))
    }

    /// Begin a read/write transaction driven by an explicit clock
    pub fn write_txn_with_clock(&self, clock: TxnClock) -> Result<WriteTxn<'_>> {
        Ok(WriteTxn::new(self.env.write_txn()?, clock))
    }

    /// Begin a child transaction of `parent`
    ///
    /// The child continues the parent's clock. Committing it folds its
    /// changes and its counter into the parent; dropping it discards both.
    pub fn nested_write_txn<'p>(&'p self, parent: &'p mut WriteTxn<'_>) -> Result<WriteTxn<'p>> {
        let (parent_txn, parent_clock) = parent.parts_mut();
        let child = self.env.nested_write_txn(parent_txn)?;
        Ok(WriteTxn::nested(child, parent_clock))
    }

    /// Number of rows in the mutation log
    pub fn log_len(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.time_to_key.len(txn)?)
    }

    /// Gather store-wide counters
    pub fn stats(&self, txn: &RoTxn) -> Result<StoreStats> {
        let mut stats = StoreStats {
            log_len: self.time_to_key.len(txn)?,
            keys: 0,
            live_keys: 0,
            nodes: self.nodes.len(txn)?,
            pending: self.node_time.len(txn)?,
        };
        for entry in self.key_to_time.iter(txn)? {
            let (_, ts) = entry?;
            stats.keys += 1;
            if Timestamp::from_slice(ts)?.is_put() {
                stats.live_keys += 1;
            }
        }
        Ok(stats)
    }
}
