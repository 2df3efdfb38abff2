//! chronokv core
//!
//! A multi-table key-value store on LMDB where every mutation carries a
//! globally ordered timestamp, plus a peer-to-peer replicator that keeps
//! several stores eventually consistent with last-writer-wins per key.
//!
//! # Architecture
//!
//! - **store**: timestamps, table keys, the three mutation indices,
//!   tombstone-aware cursors, the peer registry and per-peer backlogs
//! - **replication**: wire codec, session state machine, TCP service and
//!   its configuration
//!
//! # Example
//!
//! ```no_run
//! use chronokv_core::store::{Store, StoreOptions};
//!
//! let store = Store::open("./data", StoreOptions::default())?;
//!
//! let mut txn = store.write_txn()?;
//! store.put(&mut txn, b"users", b"alice", b"admin")?;
//! store.put(&mut txn, b"users", b"bob", b"viewer")?;
//! store.del(&mut txn, b"users", b"bob")?;
//! txn.commit()?;
//!
//! let txn = store.read_txn()?;
//! let mut cursor = store.cursor(&txn, b"users")?;
//! let mut more = cursor.first()?;
//! while more {
//!     if let Some((key, value)) = cursor.get()? {
//!         println!("{} = {}", String::from_utf8_lossy(key), String::from_utf8_lossy(value));
//!     }
//!     more = cursor.next()?;
//! }
//! # Ok::<(), chronokv_core::Error>(())
//! ```

pub mod error;
pub mod replication;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, Result};
pub use store::{Store, StoreOptions, Timestamp};
