//! Binary frame codec shared by the orchestrator link and the worker.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! +-------+--------+-----------+----------+----------+---------+---------+
//! | event | opcode | partition | meta_len | metadata | pay_len | payload |
//! |  u8   |   u8   |    i16    |   u32    |  bytes   |   u32   |  bytes  |
//! +-------+--------+-----------+----------+----------+---------+---------+
//! ```
//!
//! Partition `-1` is reserved for control frames that do not target a partition.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Number of partitions in the key space.
pub const NUM_PARTITIONS: usize = 1024;

/// Partition id used by frames that are not tied to a partition.
pub const NO_PARTITION: i16 = -1;

/// event + opcode + partition + two length prefixes
pub const FRAME_HEADER_LEN: usize = 1 + 1 + 2 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    Control = 1,
    Mutation = 2,
    Deletion = 3,
    Timer = 4,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Control => "control",
            EventType::Mutation => "mutation",
            EventType::Deletion => "deletion",
            EventType::Timer => "timer",
        }
    }
}

impl TryFrom<u8> for EventType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventType::Control),
            2 => Ok(EventType::Mutation),
            3 => Ok(EventType::Deletion),
            4 => Ok(EventType::Timer),
            other => Err(FramingError::UnknownEventType(other)),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("partition {0} outside [-1, {NUM_PARTITIONS})")]
    InvalidPartition(i16),
    #[error("unknown event type {0}")]
    UnknownEventType(u8),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    Oversized { size: usize, limit: usize },
}

/// One framed message crossing the worker's I/O boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: EventType,
    pub opcode: u8,
    pub partition: i16,
    pub metadata: Bytes,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        event: EventType,
        opcode: u8,
        partition: i16,
        metadata: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            event,
            opcode,
            partition,
            metadata: metadata.into(),
            payload: payload.into(),
        }
    }

    /// Control frame that is not tied to any partition.
    pub fn control(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(EventType::Control, opcode, NO_PARTITION, Bytes::new(), payload)
    }

    /// Partition index for partition-bearing frames, `None` for `-1`.
    pub fn partition_index(&self) -> Option<usize> {
        if self.partition < 0 {
            None
        } else {
            Some(self.partition as usize)
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.metadata.len() + self.payload.len()
    }
}

pub fn validate_partition(partition: i16) -> Result<(), FramingError> {
    if partition < NO_PARTITION || partition as i32 >= NUM_PARTITIONS as i32 {
        return Err(FramingError::InvalidPartition(partition));
    }
    Ok(())
}

pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    encode_into(frame, &mut buf);
    buf.freeze()
}

pub fn encode_into(frame: &Frame, buf: &mut BytesMut) {
    buf.reserve(frame.encoded_len());
    buf.put_u8(frame.event as u8);
    buf.put_u8(frame.opcode);
    buf.put_i16(frame.partition);
    buf.put_u32(frame.metadata.len() as u32);
    buf.put_slice(&frame.metadata);
    buf.put_u32(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);
}

/// Decode exactly one frame; the buffer must not hold anything else.
pub fn decode(bytes: &[u8]) -> Result<Frame, FramingError> {
    let (frame, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(FramingError::TrailingBytes(bytes.len() - consumed));
    }
    Ok(frame)
}

/// Decode one frame from the front of `bytes`, returning it with the number of
/// bytes it occupied.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Frame, usize), FramingError> {
    let mut cursor = bytes;

    ensure(&cursor, 4)?;
    let event = EventType::try_from(cursor.get_u8())?;
    let opcode = cursor.get_u8();
    let partition = cursor.get_i16();
    validate_partition(partition)?;

    let metadata = take_length_prefixed(&mut cursor)?;
    let payload = take_length_prefixed(&mut cursor)?;

    let consumed = bytes.len() - cursor.len();
    Ok((
        Frame {
            event,
            opcode,
            partition,
            metadata,
            payload,
        },
        consumed,
    ))
}

fn take_length_prefixed(cursor: &mut &[u8]) -> Result<Bytes, FramingError> {
    ensure(cursor, 4)?;
    let len = cursor.get_u32() as usize;
    ensure(cursor, len)?;
    let value = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(value)
}

fn ensure(cursor: &&[u8], needed: usize) -> Result<(), FramingError> {
    if cursor.remaining() < needed {
        return Err(FramingError::Truncated {
            needed,
            remaining: cursor.remaining(),
        });
    }
    Ok(())
}
