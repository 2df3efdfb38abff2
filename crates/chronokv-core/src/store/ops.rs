//! Reads, local writes and the shared mutation path

use super::keys::{TableKey, table_prefix};
use super::timestamp::{OpKind, Timestamp};
use super::txn::WriteTxn;
use super::Store;
use crate::replication::protocol::{FULL_RECORD_OVERHEAD, MAX_FRAME_SIZE};
use crate::{Error, Result};
use heed::{RoTxn, RwTxn};
use std::ops::Bound;

/// Largest encoded table key plus value a mutation may carry
///
/// Anything larger could never be sent to a peer in one frame.
pub const MAX_RECORD_SIZE: usize = MAX_FRAME_SIZE - FULL_RECORD_OVERHEAD;

fn check_record_size(table_key: &[u8], value: Option<&[u8]>) -> Result<()> {
    let size = table_key.len() + value.map_or(0, <[u8]>::len);
    if size > MAX_RECORD_SIZE {
        return Err(Error::resource_exhausted(format!(
            "record of {size} bytes exceeds the {MAX_RECORD_SIZE} byte limit"
        )));
    }
    Ok(())
}

/// One logged mutation: a timestamp, the table key it touched and, for
/// puts, the value written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    timestamp: Timestamp,
    key: TableKey,
    value: Option<Vec<u8>>,
}

impl Mutation {
    /// Build a mutation, checking that the timestamp's operation bit
    /// agrees with the presence of a value
    pub fn new(timestamp: Timestamp, key: TableKey, value: Option<Vec<u8>>) -> Result<Self> {
        match (timestamp.op(), value.is_some()) {
            (OpKind::Put, false) => Err(Error::invalid_mutation(format!(
                "put {timestamp} carries no value"
            ))),
            (OpKind::Delete, true) => Err(Error::invalid_mutation(format!(
                "delete {timestamp} carries a value"
            ))),
            _ => Ok(Self {
                timestamp,
                key,
                value,
            }),
        }
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    /// Value written, `None` for tombstones
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn is_put(&self) -> bool {
        self.value.is_some()
    }
}

/// Result of applying a mutation that may have been produced elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Logged and now the newest mutation of its key
    Current,
    /// Logged, but the key already holds a newer mutation
    Superseded,
    /// The log already held this exact mutation; nothing changed
    Duplicate,
}

pub(crate) fn stored_timestamp(bytes: &[u8]) -> Result<Timestamp> {
    Timestamp::from_slice(bytes)
        .map_err(|_| Error::storage(format!("index holds a malformed timestamp {}", hex::encode(bytes))))
}

impl Store {
    /// Current value of `key` in `table`; `None` if absent or deleted
    pub fn get<'t>(&self, txn: &'t RoTxn, table: &[u8], key: &[u8]) -> Result<Option<&'t [u8]>> {
        let table_key = TableKey::new(table, key)?;
        self.get_encoded(txn, table_key.as_bytes())
    }

    pub(crate) fn get_encoded<'t>(&self, txn: &'t RoTxn, table_key: &[u8]) -> Result<Option<&'t [u8]>> {
        let Some(ts) = self.key_to_time.get(txn, table_key)? else {
            return Ok(None);
        };
        let ts = stored_timestamp(ts)?;
        if !ts.is_put() {
            return Ok(None);
        }
        self.value_at(txn, &ts).map(Some)
    }

    pub(crate) fn value_at<'t>(&self, txn: &'t RoTxn, ts: &Timestamp) -> Result<&'t [u8]> {
        self.time_to_data
            .get(txn, ts.as_bytes())?
            .ok_or_else(|| Error::storage(format!("no value recorded for put {ts}")))
    }

    /// Timestamp of the newest mutation of `key`, tombstones included
    pub fn version(&self, txn: &RoTxn, table: &[u8], key: &[u8]) -> Result<Option<Timestamp>> {
        let table_key = TableKey::new(table, key)?;
        self.key_to_time
            .get(txn, table_key.as_bytes())?
            .map(stored_timestamp)
            .transpose()
    }

    /// Write `value` under `key` in `table`
    pub fn put(&self, txn: &mut WriteTxn, table: &[u8], key: &[u8], value: &[u8]) -> Result<Timestamp> {
        let table_key = TableKey::new(table, key)?;
        check_record_size(table_key.as_bytes(), Some(value))?;
        let ts = txn.tick(OpKind::Put);
        self.record(txn, &ts, table_key.as_bytes(), Some(value))?;
        Ok(ts)
    }

    /// Delete `key` from `table` by logging a tombstone
    ///
    /// Returns `None` without touching the clock when the key is absent or
    /// already deleted.
    pub fn del(&self, txn: &mut WriteTxn, table: &[u8], key: &[u8]) -> Result<Option<Timestamp>> {
        let table_key = TableKey::new(table, key)?;
        let live = match self.key_to_time.get(txn, table_key.as_bytes())? {
            Some(ts) => stored_timestamp(ts)?.is_put(),
            None => false,
        };
        if !live {
            return Ok(None);
        }
        let ts = txn.tick(OpKind::Delete);
        self.record(txn, &ts, table_key.as_bytes(), None)?;
        Ok(Some(ts))
    }

    /// Apply a mutation stamped elsewhere
    ///
    /// The mutation always enters the log; it only becomes the key's
    /// current version when its timestamp is newer than the one recorded.
    pub fn apply_mutation(&self, txn: &mut WriteTxn, mutation: &Mutation) -> Result<ApplyOutcome> {
        check_record_size(mutation.key().as_bytes(), mutation.value())?;
        let ts = mutation.timestamp();
        match self.time_to_key.get(txn, ts.as_bytes())? {
            Some(existing) if existing == mutation.key().as_bytes() => {
                return Ok(ApplyOutcome::Duplicate);
            }
            Some(_) => {
                return Err(Error::invalid_mutation(format!(
                    "timestamp {ts} is already logged for another key"
                )));
            }
            None => {}
        }
        let current = self.record(txn, ts, mutation.key().as_bytes(), mutation.value())?;
        Ok(if current {
            ApplyOutcome::Current
        } else {
            ApplyOutcome::Superseded
        })
    }

    /// Read back the logged mutation stamped `ts`
    pub fn mutation(&self, txn: &RoTxn, ts: &Timestamp) -> Result<Option<Mutation>> {
        let Some(key) = self.time_to_key.get(txn, ts.as_bytes())? else {
            return Ok(None);
        };
        let key = TableKey::from_encoded(key.to_vec())
            .map_err(|_| Error::storage(format!("log entry {ts} names a malformed key")))?;
        let value = if ts.is_put() {
            Some(self.value_at(txn, ts)?.to_vec())
        } else {
            None
        };
        Ok(Some(Mutation {
            timestamp: *ts,
            key,
            value,
        }))
    }

    /// Up to `limit` logged mutations in timestamp order, starting after
    /// `after`
    pub fn log_range(&self, txn: &RoTxn, after: Option<&Timestamp>, limit: usize) -> Result<Vec<Mutation>> {
        let lower = match after {
            Some(ts) => Bound::Excluded(&ts.as_bytes()[..]),
            None => Bound::Unbounded,
        };
        let range = (lower, Bound::<&[u8]>::Unbounded);
        let mut out = Vec::new();
        for entry in self.time_to_key.range(txn, &range)?.take(limit) {
            let (ts, _) = entry?;
            let ts = stored_timestamp(ts)?;
            if let Some(mutation) = self.mutation(txn, &ts)? {
                out.push(mutation);
            }
        }
        Ok(out)
    }

    /// Whether any key of `table` has ever been written
    pub fn table_exists(&self, txn: &RoTxn, table: &[u8]) -> Result<bool> {
        let prefix = table_prefix(table)?;
        Ok(self.key_to_time.prefix_iter(txn, &prefix)?.next().is_some())
    }

    /// Log, index and fan out one mutation inside a child transaction
    fn record(&self, txn: &mut WriteTxn, ts: &Timestamp, table_key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let mut child = self.nested_write_txn(txn)?;
        let current = self.write_indices(&mut child, ts, table_key, value)?;
        child.commit()?;
        Ok(current)
    }

    fn write_indices(&self, txn: &mut RwTxn, ts: &Timestamp, table_key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.time_to_key.put(txn, ts.as_bytes(), table_key)?;
        if let Some(value) = value {
            self.time_to_data.put(txn, ts.as_bytes(), value)?;
        }

        let newer = match self.key_to_time.get(txn, table_key)? {
            Some(existing) => &ts.as_bytes()[..] > existing,
            None => true,
        };
        if newer {
            self.key_to_time.put(txn, table_key, ts.as_bytes())?;
        }

        self.fan_out(txn, ts)?;
        Ok(newer)
    }
}
