//! Key layouts for the multiplexed keyspace
//!
//! ```text
//! table key:   [table name][0x00][user key]
//! pending key: [node name][0x00][timestamp:20]
//! ```
//!
//! The separator keeps every table (and every peer's backlog) contiguous
//! in LMDB's byte order, even when one name is a prefix of another.

use super::timestamp::{TIMESTAMP_LEN, Timestamp};
use crate::{Error, Result};

/// Separator between a name and the rest of a composite key
pub const SEPARATOR: u8 = 0x00;

/// Check a table name: non-empty, no separator byte
pub fn validate_table(table: &[u8]) -> Result<()> {
    if table.is_empty() {
        return Err(Error::InvalidTable("table name is empty".into()));
    }
    if table.contains(&SEPARATOR) {
        return Err(Error::InvalidTable(format!(
            "table name {:?} contains a NUL byte",
            String::from_utf8_lossy(table)
        )));
    }
    Ok(())
}

/// Check a node name: non-empty, no separator, no whitespace
pub fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidNodeName("node name is empty".into()));
    }
    if name.bytes().any(|b| b == SEPARATOR || b.is_ascii_whitespace()) {
        return Err(Error::InvalidNodeName(format!(
            "node name {:?} contains NUL or whitespace",
            name
        )));
    }
    Ok(())
}

/// `table || 0x00`, the prefix shared by every key of a table
pub fn table_prefix(table: &[u8]) -> Result<Vec<u8>> {
    validate_table(table)?;
    let mut prefix = Vec::with_capacity(table.len() + 1);
    prefix.extend_from_slice(table);
    prefix.push(SEPARATOR);
    Ok(prefix)
}

/// Smallest key sorting after every key carrying `prefix`
///
/// Only valid for prefixes produced by [`table_prefix`] or
/// [`pending_prefix`], which end in the separator.
pub fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    if let Some(last) = upper.last_mut() {
        *last += 1;
    }
    upper
}

/// A table name joined with a user key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey(Vec<u8>);

impl TableKey {
    /// Join `table` and `key`
    pub fn new(table: &[u8], key: &[u8]) -> Result<Self> {
        let mut bytes = table_prefix(table)?;
        bytes.extend_from_slice(key);
        Ok(Self(bytes))
    }

    /// Wrap an already encoded table key after checking its shape
    pub fn from_encoded(bytes: Vec<u8>) -> Result<Self> {
        match bytes.iter().position(|&b| b == SEPARATOR) {
            Some(0) | None => Err(Error::InvalidTable(format!(
                "encoded key {} has no table name",
                hex::encode(&bytes)
            ))),
            Some(_) => Ok(Self(bytes)),
        }
    }

    /// Encoded form as stored in the indices
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the encoded bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The table part
    pub fn table(&self) -> &[u8] {
        split_table_key(&self.0).map(|(t, _)| t).unwrap_or(&[])
    }

    /// The user key part
    pub fn key(&self) -> &[u8] {
        split_table_key(&self.0).map(|(_, k)| k).unwrap_or(&[])
    }
}

/// Split an encoded table key at its first separator
pub fn split_table_key(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|&b| b == SEPARATOR)?;
    Some((&bytes[..pos], &bytes[pos + 1..]))
}

/// `node || 0x00`, the prefix of a peer's pending entries
pub fn pending_prefix(node: &str) -> Result<Vec<u8>> {
    validate_node_name(node)?;
    let mut prefix = Vec::with_capacity(node.len() + 1);
    prefix.extend_from_slice(node.as_bytes());
    prefix.push(SEPARATOR);
    Ok(prefix)
}

/// Pending entry key for `(node, ts)`
pub fn pending_key(prefix: &[u8], ts: &Timestamp) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + TIMESTAMP_LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(ts.as_bytes());
    key
}

/// Timestamp suffix of a pending entry key
pub fn pending_timestamp(prefix: &[u8], key: &[u8]) -> Result<Timestamp> {
    key.strip_prefix(prefix)
        .ok_or_else(|| Error::storage("pending entry outside of its node prefix"))
        .and_then(|suffix| {
            Timestamp::from_slice(suffix)
                .map_err(|_| Error::storage("pending entry with a malformed timestamp"))
        })
}
