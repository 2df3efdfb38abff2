//! Registry of peer nodes

use super::keys::{pending_key, pending_prefix, prefix_upper_bound, validate_node_name};
use super::ops::stored_timestamp;
use super::pending::PendingFlag;
use super::Store;
use crate::Result;
use heed::{RoTxn, RwTxn};
use std::ops::Bound;
use tracing::{debug, info};

/// Timestamps copied per batch while backfilling a new peer
const BACKFILL_BATCH: usize = 1024;

impl Store {
    /// Register a peer
    ///
    /// Returns `false` if it was already known. A new peer gets a pending
    /// entry for every mutation already in the log.
    pub fn add_node(&self, txn: &mut RwTxn, name: &str) -> Result<bool> {
        validate_node_name(name)?;
        if self.nodes.get(txn, name)?.is_some() {
            return Ok(false);
        }
        self.nodes.put(txn, name, &())?;

        let prefix = pending_prefix(name)?;
        let mut last: Option<[u8; 20]> = None;
        let mut backfilled = 0usize;
        loop {
            let lower = match &last {
                Some(ts) => Bound::Excluded(&ts[..]),
                None => Bound::Unbounded,
            };
            let range = (lower, Bound::<&[u8]>::Unbounded);
            let mut batch = Vec::with_capacity(BACKFILL_BATCH);
            for entry in self.time_to_key.range(txn, &range)?.take(BACKFILL_BATCH) {
                let (ts, _) = entry?;
                batch.push(stored_timestamp(ts)?);
            }

            let Some(tail) = batch.last() else {
                break;
            };
            last = Some(*tail.as_bytes());
            for ts in &batch {
                self.node_time.put(txn, &pending_key(&prefix, ts), &PendingFlag::Full)?;
            }
            backfilled += batch.len();
            if batch.len() < BACKFILL_BATCH {
                break;
            }
        }

        info!(node = %name, backfilled, "registered node");
        Ok(true)
    }

    /// Forget a peer and everything still queued for it
    pub fn del_node(&self, txn: &mut RwTxn, name: &str) -> Result<bool> {
        validate_node_name(name)?;
        if !self.nodes.delete(txn, name)? {
            return Ok(false);
        }
        let prefix = pending_prefix(name)?;
        let upper = prefix_upper_bound(&prefix);
        let range = (
            Bound::Included(prefix.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );
        let purged = self.node_time.delete_range(txn, &range)?;
        debug!(node = %name, purged, "removed node");
        Ok(true)
    }

    /// Whether `name` is a registered peer
    pub fn node_exists(&self, txn: &RoTxn, name: &str) -> Result<bool> {
        validate_node_name(name)?;
        Ok(self.nodes.get(txn, name)?.is_some())
    }

    /// All registered peers in name order
    pub fn nodes(&self, txn: &RoTxn) -> Result<Vec<String>> {
        self.nodes
            .iter(txn)?
            .map(|entry| entry.map(|(name, _)| name.to_owned()).map_err(Into::into))
            .collect()
    }
}
