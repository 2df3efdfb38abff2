//! Write transactions carrying a mutation clock

use super::timestamp::{OpKind, Timestamp, TxnClock};
use crate::Result;
use heed::RwTxn;
use std::ops::{Deref, DerefMut};

/// A read/write transaction together with the clock that stamps its
/// mutations
///
/// Dereferences to [`heed::RwTxn`], so it can be handed to every read
/// operation of the store as well.
pub struct WriteTxn<'p> {
    txn: RwTxn<'p>,
    clock: TxnClock,
    parent_clock: Option<&'p mut TxnClock>,
}

impl<'p> WriteTxn<'p> {
    pub(crate) fn new(txn: RwTxn<'p>, clock: TxnClock) -> Self {
        Self {
            txn,
            clock,
            parent_clock: None,
        }
    }

    pub(crate) fn nested(txn: RwTxn<'p>, parent_clock: &'p mut TxnClock) -> Self {
        Self {
            txn,
            clock: parent_clock.clone(),
            parent_clock: Some(parent_clock),
        }
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut RwTxn<'p>, &mut TxnClock) {
        (&mut self.txn, &mut self.clock)
    }

    pub(crate) fn tick(&mut self, op: OpKind) -> Timestamp {
        self.clock.tick(op)
    }

    /// The clock stamping this transaction's mutations
    pub fn clock(&self) -> &TxnClock {
        &self.clock
    }

    /// Whether this is a child of another write transaction
    pub fn is_nested(&self) -> bool {
        self.parent_clock.is_some()
    }

    /// Commit the transaction
    ///
    /// A child hands its counter back to the parent so later mutations of
    /// the parent keep strictly increasing timestamps.
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        if let Some(parent) = self.parent_clock {
            parent.resume_from(&self.clock);
        }
        Ok(())
    }

    /// Discard every change made in the transaction
    ///
    /// Unlike [`commit`](Self::commit), an aborted child leaves the parent's
    /// counter untouched: none of its timestamps were stored, so the parent
    /// may hand them out again.
    pub fn abort(self) {
        self.txn.abort();
    }
}

impl<'p> Deref for WriteTxn<'p> {
    type Target = RwTxn<'p>;

    fn deref(&self) -> &Self::Target {
        &self.txn
    }
}

impl DerefMut for WriteTxn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.txn
    }
}
