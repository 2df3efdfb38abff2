//! Tombstone-aware cursors over one table

use super::keys::{SEPARATOR, prefix_upper_bound, table_prefix};
use super::ops::stored_timestamp;
use super::timestamp::Timestamp;
use super::Store;
use crate::Result;
use heed::types::Bytes;
use heed::{Database, RoTxn};
use std::ops::Bound;

/// Bidirectional cursor over the live keys of a table
///
/// Only keys whose newest mutation is a put are visited. A move that finds
/// nothing returns `false` and leaves the cursor where it was. Calling
/// [`next`](Self::next) or [`prev`](Self::prev) before any positioning
/// behaves like [`first`](Self::first) or [`last`](Self::last).
pub struct TableCursor<'t> {
    store: &'t Store,
    txn: &'t RoTxn<'t>,
    db: Database<Bytes, Bytes>,
    prefix: Vec<u8>,
    upper: Vec<u8>,
    current: Option<(&'t [u8], Timestamp)>,
}

impl Store {
    /// Open a cursor over `table`
    pub fn cursor<'t>(&'t self, txn: &'t RoTxn<'t>, table: &[u8]) -> Result<TableCursor<'t>> {
        let prefix = table_prefix(table)?;
        let upper = prefix_upper_bound(&prefix);
        Ok(TableCursor {
            store: self,
            txn,
            db: self.key_to_time,
            prefix,
            upper,
            current: None,
        })
    }
}

type Entry<'t> = heed::Result<(&'t [u8], &'t [u8])>;

fn first_live<'t>(entries: impl Iterator<Item = Entry<'t>>) -> Result<Option<(&'t [u8], Timestamp)>> {
    for entry in entries {
        let (key, ts) = entry?;
        let ts = stored_timestamp(ts)?;
        if ts.is_put() {
            return Ok(Some((key, ts)));
        }
    }
    Ok(None)
}

impl<'t> TableCursor<'t> {
    /// Move to the smallest live key
    pub fn first(&mut self) -> Result<bool> {
        let found = self.forward(Bound::Included(self.prefix.as_slice()))?;
        Ok(self.settle(found))
    }

    /// Move to the largest live key
    pub fn last(&mut self) -> Result<bool> {
        let found = self.backward(Bound::Excluded(self.upper.as_slice()))?;
        Ok(self.settle(found))
    }

    /// Move to the next live key
    pub fn next(&mut self) -> Result<bool> {
        let Some((key, _)) = self.current else {
            return self.first();
        };
        let found = self.forward(Bound::Excluded(key))?;
        Ok(self.settle(found))
    }

    /// Move to the previous live key
    pub fn prev(&mut self) -> Result<bool> {
        let Some((key, _)) = self.current else {
            return self.last();
        };
        let found = self.backward(Bound::Excluded(key))?;
        Ok(self.settle(found))
    }

    /// Move to the first live key greater than or equal to `key`
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        let mut target = self.prefix.clone();
        target.extend_from_slice(key);
        let found = self.forward(Bound::Included(target.as_slice()))?;
        Ok(self.settle(found))
    }

    /// User key and value at the current position
    pub fn get(&self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        let Some((table_key, ts)) = self.current else {
            return Ok(None);
        };
        let value = self.store.value_at(self.txn, &ts)?;
        Ok(Some((&table_key[self.prefix.len()..], value)))
    }

    /// Timestamp of the value at the current position
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.current.map(|(_, ts)| ts)
    }

    fn forward(&self, lower: Bound<&[u8]>) -> Result<Option<(&'t [u8], Timestamp)>> {
        let range = (lower, Bound::Excluded(self.upper.as_slice()));
        first_live(self.db.range(self.txn, &range)?)
    }

    fn backward(&self, upper: Bound<&[u8]>) -> Result<Option<(&'t [u8], Timestamp)>> {
        let range = (Bound::Included(self.prefix.as_slice()), upper);
        first_live(self.db.rev_range(self.txn, &range)?)
    }

    fn settle(&mut self, found: Option<(&'t [u8], Timestamp)>) -> bool {
        match found {
            Some(hit) => {
                debug_assert_eq!(hit.0.get(self.prefix.len() - 1), Some(&SEPARATOR));
                self.current = Some(hit);
                true
            }
            None => false,
        }
    }
}
