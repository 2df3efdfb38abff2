//! Replication wire protocol
//!
//! A frame is a list of length-prefixed elements behind a total length
//! that counts itself (all lengths 8-byte big-endian):
//!
//! ```text
//! [frame_len:8] ([elem_len:8][elem bytes])*
//! ```
//!
//! Two messages exist:
//!
//! ```text
//! identity:  ["node", name]
//! log entry: ["time", flag:2, timestamp:20, key?, value?]
//! ```
//!
//! Flag byte 0 says whether the key (and for puts, the value) follows,
//! flag byte 1 whether the sender wants an acknowledgement. Full records
//! are sent as `[1, 1]`, acknowledgements as `[0, 0]`.

use crate::store::keys::validate_node_name;
use crate::store::timestamp::TIMESTAMP_LEN;
use crate::store::{Mutation, Record, TableKey, Timestamp};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of every length prefix
pub const LEN_PREFIX: usize = 8;

/// Largest frame accepted from a peer (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const TAG_IDENTITY: &[u8] = b"node";
const TAG_LOG_ENTRY: &[u8] = b"time";

/// Bytes a full put record adds around its table key and value: the
/// frame prefix, five element prefixes, the tag, the flag and the
/// timestamp
pub const FULL_RECORD_OVERHEAD: usize =
    LEN_PREFIX + 5 * LEN_PREFIX + TAG_LOG_ENTRY.len() + FLAG_FULL.len() + TIMESTAMP_LEN;

const FLAG_FULL: [u8; 2] = [1, 1];
const FLAG_ACK: [u8; 2] = [0, 0];

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// First message of every session: the sender's node name
    Identity(String),
    /// One full record or acknowledgement
    LogEntry(Record),
}

/// Outcome of [`decode_frame`]
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A whole frame was parsed; the second field is the bytes consumed
    Complete(Message, usize),
    /// More bytes are needed
    Incomplete,
}

/// Decode the frame at the start of `buf` with the default size limit
pub fn decode_frame(buf: &[u8]) -> Result<Decoded> {
    decode_frame_limited(buf, MAX_FRAME_SIZE)
}

/// Decode the frame at the start of `buf`, rejecting frames over
/// `max_frame` bytes
///
/// Nothing is consumed unless a whole frame is present.
pub fn decode_frame_limited(buf: &[u8], max_frame: usize) -> Result<Decoded> {
    if buf.len() < LEN_PREFIX {
        return Ok(Decoded::Incomplete);
    }
    let frame_len = read_len(&buf[..LEN_PREFIX])?;
    if frame_len < LEN_PREFIX {
        return Err(Error::invalid_message(format!(
            "frame length {frame_len} is shorter than its own prefix"
        )));
    }
    if frame_len > max_frame {
        return Err(Error::resource_exhausted(format!(
            "frame of {frame_len} bytes exceeds the {max_frame} byte limit"
        )));
    }
    if buf.len() < frame_len {
        return Ok(Decoded::Incomplete);
    }

    let elements = split_elements(&buf[LEN_PREFIX..frame_len])?;
    let message = parse_message(&elements)?;
    Ok(Decoded::Complete(message, frame_len))
}

fn read_len(bytes: &[u8]) -> Result<usize> {
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(bytes);
    usize::try_from(u64::from_be_bytes(prefix))
        .map_err(|_| Error::resource_exhausted("length prefix does not fit in memory"))
}

fn split_elements(mut body: &[u8]) -> Result<Vec<&[u8]>> {
    let mut elements = Vec::new();
    while !body.is_empty() {
        if body.len() < LEN_PREFIX {
            return Err(Error::invalid_message("truncated element length"));
        }
        let len = read_len(&body[..LEN_PREFIX])?;
        body = &body[LEN_PREFIX..];
        if body.len() < len {
            return Err(Error::invalid_message(format!(
                "element of {len} bytes overruns its frame"
            )));
        }
        elements.push(&body[..len]);
        body = &body[len..];
    }
    Ok(elements)
}

fn parse_message(elements: &[&[u8]]) -> Result<Message> {
    match elements {
        [TAG_IDENTITY, name] => {
            let name = std::str::from_utf8(name)
                .map_err(|_| Error::invalid_message("node name is not UTF-8"))?;
            validate_node_name(name).map_err(|e| Error::invalid_message(e.to_string()))?;
            Ok(Message::Identity(name.to_owned()))
        }
        [TAG_IDENTITY, ..] => Err(Error::invalid_message(format!(
            "identity message with {} elements",
            elements.len()
        ))),
        [TAG_LOG_ENTRY, flag, ts, rest @ ..] => {
            let ts = Timestamp::from_slice(ts)?;
            parse_log_entry(flag, ts, rest).map(Message::LogEntry)
        }
        [TAG_LOG_ENTRY, ..] => Err(Error::invalid_message(format!(
            "log entry with {} elements",
            elements.len()
        ))),
        [tag, ..] => Err(Error::invalid_message(format!(
            "unknown message tag {:?}",
            String::from_utf8_lossy(tag)
        ))),
        [] => Err(Error::invalid_message("empty frame")),
    }
}

fn parse_log_entry(flag: &[u8], ts: Timestamp, rest: &[&[u8]]) -> Result<Record> {
    match (flag, rest) {
        (f, []) if f == FLAG_ACK => Ok(Record::Ack(ts)),
        (f, [key, value @ ..]) if f == FLAG_FULL && value.len() <= 1 => {
            let key = TableKey::from_encoded(key.to_vec())
                .map_err(|e| Error::invalid_message(e.to_string()))?;
            let value = value.first().map(|v| v.to_vec());
            Mutation::new(ts, key, value)
                .map(Record::Full)
                .map_err(|e| Error::invalid_message(e.to_string()))
        }
        (f, _) if f == FLAG_ACK || f == FLAG_FULL => Err(Error::invalid_message(format!(
            "log entry {ts} has {} trailing elements for flag {f:?}",
            rest.len()
        ))),
        (f, _) => Err(Error::invalid_message(format!(
            "unsupported log entry flag {f:?}"
        ))),
    }
}

/// Append the frame for `message` to `dst`
pub fn encode_message(message: &Message, dst: &mut BytesMut) {
    let mut elements: Vec<&[u8]> = Vec::with_capacity(5);
    match message {
        Message::Identity(name) => {
            elements.push(TAG_IDENTITY);
            elements.push(name.as_bytes());
        }
        Message::LogEntry(Record::Ack(ts)) => {
            elements.push(TAG_LOG_ENTRY);
            elements.push(&FLAG_ACK);
            elements.push(ts.as_bytes());
        }
        Message::LogEntry(Record::Full(mutation)) => {
            elements.push(TAG_LOG_ENTRY);
            elements.push(&FLAG_FULL);
            elements.push(mutation.timestamp().as_bytes());
            elements.push(mutation.key().as_bytes());
            if let Some(value) = mutation.value() {
                elements.push(value);
            }
        }
    }

    let frame_len = LEN_PREFIX + elements.iter().map(|e| LEN_PREFIX + e.len()).sum::<usize>();
    dst.reserve(frame_len);
    dst.put_u64(frame_len as u64);
    for element in elements {
        dst.put_u64(element.len() as u64);
        dst.put_slice(element);
    }
}

/// `tokio_util` codec over [`Message`] frames
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match decode_frame_limited(src, self.max_frame)? {
            Decoded::Complete(message, consumed) => {
                src.advance(consumed);
                Ok(Some(message))
            }
            Decoded::Incomplete => {
                if src.len() >= LEN_PREFIX {
                    let frame_len = read_len(&src[..LEN_PREFIX])?;
                    src.reserve(frame_len.saturating_sub(src.len()));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        encode_message(&message, dst);
        Ok(())
    }
}
