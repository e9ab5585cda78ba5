//! Length-delimited frames on a byte stream.
//!
//! Each encoded frame travels behind a big-endian u32 length. The outer length
//! lets a frame that fails to decode be skipped whole, so one bad frame never
//! desynchronizes the rest of the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use protocol::{Frame, FramingError, decode, encode_into};

pub const LENGTH_PREFIX: usize = 4;

pub struct StreamDecoder {
    buf: BytesMut,
    max_frame_size: usize,
    /// Bytes of an oversized frame still to be discarded
    skip: usize,
}

impl StreamDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
            skip: 0,
        }
    }

    /// Read target for the socket.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FramingError>> {
        if self.skip > 0 {
            let n = self.skip.min(self.buf.len());
            self.buf.advance(n);
            self.skip -= n;
            if self.skip > 0 {
                return None;
            }
        }

        if self.buf.len() < LENGTH_PREFIX {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_size {
            self.buf.advance(LENGTH_PREFIX);
            self.skip = len;
            return Some(Err(FramingError::Oversized {
                size: len,
                limit: self.max_frame_size,
            }));
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            self.buf.reserve(LENGTH_PREFIX + len - self.buf.len());
            return None;
        }

        self.buf.advance(LENGTH_PREFIX);
        let body = self.buf.split_to(len);
        Some(decode(&body))
    }
}

/// Prefix an already encoded frame with its stream length.
pub fn delimit(encoded: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX + encoded.len());
    out.put_u32(encoded.len() as u32);
    out.extend_from_slice(encoded);
    out.freeze()
}

pub fn encode_stream(frame: &Frame) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX + frame.encoded_len());
    out.put_u32(frame.encoded_len() as u32);
    encode_into(frame, &mut out);
    out.freeze()
}
