//! Per-peer backlog of mutations awaiting delivery or acknowledgement
//!
//! Each `node_time` entry `(peer, ts)` holds one [`PendingFlag`]:
//!
//! - `Full`: the peer may not have the mutation; send the whole record
//! - `Sent`: the record went out on the current session, no answer yet
//! - `Ack`: the peer sent us the mutation and is waiting for our ack
//!
//! An entry disappears once an acknowledgement has been sent (for `Ack`)
//! or received (for `Full`/`Sent`).

use super::keys::{pending_key, pending_prefix, pending_timestamp, prefix_upper_bound};
use super::ops::{ApplyOutcome, Mutation};
use super::timestamp::Timestamp;
use super::Store;
use crate::{Error, Result};
use heed::{BoxedError, BytesDecode, BytesEncode, RoTxn, RwTxn};
use std::borrow::Cow;
use std::fmt;
use std::ops::Bound;
use tracing::{debug, trace};

/// State of one pending entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFlag {
    Full,
    Ack,
    Sent,
}

impl PendingFlag {
    fn as_byte(self) -> u8 {
        match self {
            Self::Full => b'F',
            Self::Ack => b'A',
            Self::Sent => b'S',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'F' => Some(Self::Full),
            b'A' => Some(Self::Ack),
            b'S' => Some(Self::Sent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Ack => "ack",
            Self::Sent => "sent",
        }
    }
}

impl fmt::Display for PendingFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// heed codec storing a [`PendingFlag`] as a single byte
pub(crate) enum PendingFlagCodec {}

impl<'a> BytesEncode<'a> for PendingFlagCodec {
    type EItem = PendingFlag;

    fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, BoxedError> {
        Ok(Cow::Owned(vec![item.as_byte()]))
    }
}

impl<'a> BytesDecode<'a> for PendingFlagCodec {
    type DItem = PendingFlag;

    fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, BoxedError> {
        match bytes {
            [byte] => PendingFlag::from_byte(*byte)
                .ok_or_else(|| format!("unknown pending flag {byte:#04x}").into()),
            _ => Err(format!("pending flag of {} bytes", bytes.len()).into()),
        }
    }
}

/// Unit of replication traffic for one timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// The whole mutation; the receiver must acknowledge it
    Full(Mutation),
    /// Confirmation that the sender holds the mutation
    Ack(Timestamp),
}

impl Record {
    pub fn timestamp(&self) -> &Timestamp {
        match self {
            Self::Full(mutation) => mutation.timestamp(),
            Self::Ack(ts) => ts,
        }
    }
}

/// What [`Store::apply_incoming`] did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A full record went through mutation-apply
    Applied(ApplyOutcome),
    /// An acknowledgement cleared the peer's entry
    Acknowledged,
}

impl Store {
    pub(crate) fn fan_out(&self, txn: &mut RwTxn, ts: &Timestamp) -> Result<()> {
        let mut names = Vec::new();
        for entry in self.nodes.iter(txn)? {
            let (name, _) = entry?;
            names.push(name.to_owned());
        }
        for name in names {
            let key = pending_key(&pending_prefix(&name)?, ts);
            self.node_time.put(txn, &key, &PendingFlag::Full)?;
        }
        Ok(())
    }

    /// Take the next record to send to `peer`
    ///
    /// Scans the peer's backlog strictly after `after` for the first entry
    /// not already in flight. A `Full` entry is marked `Sent` and returned
    /// as a full record; an `Ack` entry is removed and returned as an
    /// acknowledgement. Returns `None` once nothing is left to send.
    pub fn drain_next(&self, peer: &str, after: Option<&Timestamp>) -> Result<Option<Record>> {
        let prefix = pending_prefix(peer)?;
        let upper = prefix_upper_bound(&prefix);
        let start = match after {
            Some(ts) => pending_key(&prefix, ts),
            None => prefix.clone(),
        };
        let lower = match after {
            Some(_) => Bound::Excluded(start.as_slice()),
            None => Bound::Included(start.as_slice()),
        };

        let mut txn = self.write_txn()?;
        let mut next = None;
        for entry in self
            .node_time
            .range(&txn, &(lower, Bound::Excluded(upper.as_slice())))?
        {
            let (key, flag) = entry?;
            if flag != PendingFlag::Sent {
                next = Some((pending_timestamp(&prefix, key)?, flag == PendingFlag::Full));
                break;
            }
        }

        let Some((ts, full)) = next else {
            return Ok(None);
        };
        let key = pending_key(&prefix, &ts);
        let record = if full {
            let mutation = self
                .mutation(&txn, &ts)?
                .ok_or_else(|| Error::storage(format!("pending entry {ts} for {peer} is not in the log")))?;
            self.node_time.put(&mut txn, &key, &PendingFlag::Sent)?;
            Record::Full(mutation)
        } else {
            self.node_time.delete(&mut txn, &key)?;
            Record::Ack(ts)
        };
        txn.commit()?;

        trace!(peer = %peer, ts = %ts, full, "drained pending entry");
        Ok(Some(record))
    }

    /// Apply a record received from `peer`
    pub fn apply_incoming(&self, peer: &str, record: &Record) -> Result<Received> {
        let prefix = pending_prefix(peer)?;
        let mut txn = self.write_txn()?;
        if !self.node_exists(&txn, peer)? {
            return Err(Error::replication(format!("{peer} is not a registered node")));
        }

        let received = match record {
            Record::Full(mutation) => {
                let outcome = self.apply_mutation(&mut txn, mutation)?;
                let key = pending_key(&prefix, mutation.timestamp());
                self.node_time.put(&mut txn, &key, &PendingFlag::Ack)?;
                Received::Applied(outcome)
            }
            Record::Ack(ts) => {
                self.node_time.delete(&mut txn, &pending_key(&prefix, ts))?;
                Received::Acknowledged
            }
        };
        txn.commit()?;
        Ok(received)
    }

    /// Turn every in-flight entry of `peer` back into `Full`
    pub fn rearm_pending(&self, peer: &str) -> Result<u64> {
        let prefix = pending_prefix(peer)?;
        let mut txn = self.write_txn()?;

        let mut in_flight = Vec::new();
        for entry in self.node_time.prefix_iter(&txn, &prefix)? {
            let (key, flag) = entry?;
            if flag == PendingFlag::Sent {
                in_flight.push(key.to_vec());
            }
        }
        for key in &in_flight {
            self.node_time.put(&mut txn, key, &PendingFlag::Full)?;
        }
        txn.commit()?;

        if !in_flight.is_empty() {
            debug!(peer = %peer, count = in_flight.len(), "re-armed in-flight entries");
        }
        Ok(in_flight.len() as u64)
    }

    /// Number of backlog entries for `peer`
    pub fn pending_count(&self, txn: &RoTxn, peer: &str) -> Result<u64> {
        let prefix = pending_prefix(peer)?;
        let mut count = 0;
        for entry in self.node_time.prefix_iter(txn, &prefix)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Up to `limit` backlog entries of `peer` in timestamp order
    pub fn pending_entries(&self, txn: &RoTxn, peer: &str, limit: usize) -> Result<Vec<(Timestamp, PendingFlag)>> {
        let prefix = pending_prefix(peer)?;
        let mut out = Vec::new();
        for entry in self.node_time.prefix_iter(txn, &prefix)?.take(limit) {
            let (key, flag) = entry?;
            out.push((pending_timestamp(&prefix, key)?, flag));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TableKey, TxnClock};
    use crate::testing::TestContext;

    #[test]
    fn test_flag_codec_roundtrip() {
        for flag in [PendingFlag::Full, PendingFlag::Ack, PendingFlag::Sent] {
            let bytes = PendingFlagCodec::bytes_encode(&flag).unwrap();
            assert_eq!(PendingFlagCodec::bytes_decode(&bytes).unwrap(), flag);
        }
        assert!(PendingFlagCodec::bytes_decode(b"X").is_err());
        assert!(PendingFlagCodec::bytes_decode(b"FA").is_err());
    }

    #[test]
    fn test_mutations_fan_out_to_registered_nodes() {
        let ctx = TestContext::new();
        let store = ctx.open_store("fanout");

        let mut txn = store.write_txn().unwrap();
        store.add_node(&mut txn, "b").unwrap();
        store.add_node(&mut txn, "c").unwrap();
        store.put(&mut txn, b"t", b"k", b"v").unwrap();
        store.del(&mut txn, b"t", b"k").unwrap();
        txn.commit().unwrap();

        let txn = store.read_txn().unwrap();
        assert_eq!(store.pending_count(&txn, "b").unwrap(), 2);
        assert_eq!(store.pending_count(&txn, "c").unwrap(), 2);
        let entries = store.pending_entries(&txn, "b", 10).unwrap();
        assert!(entries.iter().all(|(_, flag)| *flag == PendingFlag::Full));
    }

    #[test]
    fn test_drain_marks_sent_then_ack_clears() {
        let ctx = TestContext::new();
        let store = ctx.open_store("drain");

        let mut txn = store.write_txn().unwrap();
        store.add_node(&mut txn, "peer").unwrap();
        let ts = store.put(&mut txn, b"t", b"k", b"v").unwrap();
        txn.commit().unwrap();

        let record = store.drain_next("peer", None).unwrap().unwrap();
        match &record {
            Record::Full(mutation) => {
                assert_eq!(mutation.timestamp(), &ts);
                assert_eq!(mutation.value(), Some(&b"v"[..]));
            }
            other => panic!("expected a full record, got {other:?}"),
        }
        // in flight entries are skipped
        assert!(store.drain_next("peer", None).unwrap().is_none());

        let received = store.apply_incoming("peer", &Record::Ack(ts)).unwrap();
        assert_eq!(received, Received::Acknowledged);
        let txn = store.read_txn().unwrap();
        assert_eq!(store.pending_count(&txn, "peer").unwrap(), 0);
    }

    #[test]
    fn test_incoming_full_record_queues_an_ack() {
        let ctx = TestContext::new();
        let store = ctx.open_store("incoming");

        let mut txn = store.write_txn().unwrap();
        store.add_node(&mut txn, "peer").unwrap();
        store.add_node(&mut txn, "third").unwrap();
        txn.commit().unwrap();

        let ts = Timestamp::new(50, 0, 77, 1);
        let mutation = Mutation::new(ts, TableKey::new(b"t", b"k").unwrap(), Some(b"remote".to_vec())).unwrap();
        let record = Record::Full(mutation);

        let received = store.apply_incoming("peer", &record).unwrap();
        assert_eq!(received, Received::Applied(ApplyOutcome::Current));

        let txn = store.read_txn().unwrap();
        assert_eq!(store.get(&txn, b"t", b"k").unwrap(), Some(&b"remote"[..]));
        assert_eq!(store.pending_entries(&txn, "peer", 10).unwrap(), vec![(ts, PendingFlag::Ack)]);
        assert_eq!(store.pending_entries(&txn, "third", 10).unwrap(), vec![(ts, PendingFlag::Full)]);
        drop(txn);

        // a replay is a duplicate, still answered with an ack
        let received = store.apply_incoming("peer", &record).unwrap();
        assert_eq!(received, Received::Applied(ApplyOutcome::Duplicate));

        assert_eq!(store.drain_next("peer", None).unwrap(), Some(Record::Ack(ts)));
        assert!(store.drain_next("peer", None).unwrap().is_none());
    }

    #[test]
    fn test_unknown_peer_is_rejected() {
        let ctx = TestContext::new();
        let store = ctx.open_store("incoming-unknown");
        let err = store
            .apply_incoming("stranger", &Record::Ack(Timestamp::new(1, 0, 0, 1)))
            .unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
    }

    #[test]
    fn test_drain_resumes_after_cursor_and_rearm_resets() {
        let ctx = TestContext::new();
        let store = ctx.open_store("rearm");

        let mut txn = store.write_txn_with_clock(TxnClock::at(10, 0, 1)).unwrap();
        store.add_node(&mut txn, "peer").unwrap();
        let first = store.put(&mut txn, b"t", b"a", b"1").unwrap();
        let second = store.put(&mut txn, b"t", b"b", b"2").unwrap();
        txn.commit().unwrap();

        let record = store.drain_next("peer", Some(&first)).unwrap().unwrap();
        assert_eq!(record.timestamp(), &second);
        let record = store.drain_next("peer", None).unwrap().unwrap();
        assert_eq!(record.timestamp(), &first);
        assert!(store.drain_next("peer", None).unwrap().is_none());

        assert_eq!(store.rearm_pending("peer").unwrap(), 2);
        let txn = store.read_txn().unwrap();
        let entries = store.pending_entries(&txn, "peer", 10).unwrap();
        assert_eq!(entries, vec![(first, PendingFlag::Full), (second, PendingFlag::Full)]);
    }
}
