//! 20-byte mutation timestamps
//!
//! Layout (all big-endian):
//!
//! ```text
//! [seconds:4][fraction:4][origin:4][counter:8]
//! ```
//!
//! `fraction` counts units of 1/2^32 s. The least significant bit of the
//! counter is the operation kind (1 = put, 0 = delete). Comparing two
//! timestamps byte-wise orders them by wall clock, then origin, then
//! position inside the writing transaction.

use crate::{Error, Result};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encoded size of a timestamp
pub const TIMESTAMP_LEN: usize = 20;

/// Operation recorded by a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Value written
    Put,
    /// Tombstone
    Delete,
}

/// Totally ordered identifier of one mutation
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp([u8; TIMESTAMP_LEN]);

impl Timestamp {
    /// Assemble a timestamp from its components
    pub fn new(seconds: u32, fraction: u32, origin: u32, counter: u64) -> Self {
        let mut bytes = [0u8; TIMESTAMP_LEN];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..8].copy_from_slice(&fraction.to_be_bytes());
        bytes[8..12].copy_from_slice(&origin.to_be_bytes());
        bytes[12..20].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; TIMESTAMP_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a stored or received timestamp
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; TIMESTAMP_LEN] = bytes.try_into().map_err(|_| {
            Error::invalid_message(format!(
                "timestamp must be {} bytes, got {}",
                TIMESTAMP_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; TIMESTAMP_LEN] {
        &self.0
    }

    /// Whole seconds since the Unix epoch
    pub fn seconds(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Sub-second part in units of 1/2^32 s
    pub fn fraction(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    /// Store instance that produced the mutation
    pub fn origin(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    /// Intra-transaction counter, operation bit included
    pub fn counter(&self) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[12..20]);
        u64::from_be_bytes(counter)
    }

    /// Operation kind encoded in the low bit
    pub fn op(&self) -> OpKind {
        if self.is_put() {
            OpKind::Put
        } else {
            OpKind::Delete
        }
    }

    /// Returns `true` for puts, `false` for tombstones
    pub fn is_put(&self) -> bool {
        self.0[TIMESTAMP_LEN - 1] & 1 == 1
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timestamp({}.{:08x} origin={:08x} counter={})",
            self.seconds(),
            self.fraction(),
            self.origin(),
            self.counter()
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Clock owned by one write transaction
///
/// The wall-clock part is sampled once when the transaction begins; every
/// mutation inside the transaction then advances the counter by two.
#[derive(Debug, Clone)]
pub struct TxnClock {
    seconds: u32,
    fraction: u32,
    origin: u32,
    counter: u64,
}

/// Current wall-clock time as `seconds << 32 | fraction`
pub(crate) fn wall_clock() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let fraction = (u64::from(elapsed.subsec_nanos()) << 32) / 1_000_000_000;
    (elapsed.as_secs() << 32) | fraction
}

impl TxnClock {
    /// Sample the system clock for a new top-level transaction
    pub fn now(origin: u32) -> Self {
        Self::from_instant(wall_clock(), origin)
    }

    pub(crate) fn from_instant(instant: u64, origin: u32) -> Self {
        Self::at((instant >> 32) as u32, instant as u32, origin)
    }

    /// Clock pinned to an explicit instant
    pub fn at(seconds: u32, fraction: u32, origin: u32) -> Self {
        Self {
            seconds,
            fraction,
            origin,
            counter: 0,
        }
    }

    /// Allocate the timestamp for the next mutation
    pub fn tick(&mut self, op: OpKind) -> Timestamp {
        let bit = match op {
            OpKind::Put => 1,
            OpKind::Delete => 0,
        };
        let ts = Timestamp::new(self.seconds, self.fraction, self.origin, self.counter + bit);
        self.counter += 2;
        ts
    }

    /// Counter value the next mutation will start from
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub(crate) fn resume_from(&mut self, child: &TxnClock) {
        self.counter = self.counter.max(child.counter);
    }
}
