//! Frame buffer for accumulating partial reads.
//!
//! The protocol frames every message with a 4-byte big-endian length
//! prefix (the length does not count itself). This buffer accumulates
//! raw socket reads and extracts complete frame payloads, handling
//! fragmentation with a two-state machine:
//! - `WaitingForLength`: need 4 bytes
//! - `WaitingForPayload`: length parsed, need N more payload bytes

use bytes::{Bytes, BytesMut};

use super::wire::LEN_PREFIX_SIZE;
use crate::error::DecodeError;

/// Default maximum frame size (1 MiB, matching the server's default
/// jute.maxbuffer).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForPayload { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut`; payloads are split off
/// zero-copy via `split_to().freeze()`.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame payloads.
    ///
    /// Returns the payloads with the length prefix already stripped.
    /// Fragmented data is buffered for the next push. Fails
    /// deterministically on a negative length prefix or a frame above
    /// the configured maximum.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, DecodeError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>, DecodeError> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.len() < LEN_PREFIX_SIZE {
                    return Ok(None);
                }

                let len = i32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]);
                if len < 0 {
                    return Err(DecodeError::NegativeLength(len));
                }
                let len = len as usize;
                if len > self.max_frame_size {
                    return Err(DecodeError::FrameTooLarge(len));
                }

                let _ = self.buffer.split_to(LEN_PREFIX_SIZE);

                if len == 0 {
                    return Ok(Some(Bytes::new()));
                }

                self.state = State::WaitingForPayload { remaining: len };
                self.try_extract_one()
            }

            State::WaitingForPayload { remaining } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(payload))
            }
        }
    }

    /// Number of buffered bytes not yet assembled into a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as i32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&frame_bytes(b"hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut data = frame_bytes(b"first");
        data.extend(frame_bytes(b"second"));
        data.extend(frame_bytes(b"third"));

        let frames = buffer.push(&data).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second");
        assert_eq!(&frames[2][..], b"third");
    }

    #[test]
    fn fragmented_length_prefix() {
        let mut buffer = FrameBuffer::new();
        let data = frame_bytes(b"test");

        assert!(buffer.push(&data[..2]).unwrap().is_empty());
        let frames = buffer.push(&data[2..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"test");
    }

    #[test]
    fn fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"a longer payload split across reads";
        let data = frame_bytes(payload);

        assert!(buffer.push(&data[..LEN_PREFIX_SIZE + 10]).unwrap().is_empty());
        let frames = buffer.push(&data[LEN_PREFIX_SIZE + 10..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], payload);
    }

    #[test]
    fn byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let data = frame_bytes(b"hi");

        let mut all = Vec::new();
        for byte in &data {
            all.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], b"hi");
    }

    #[test]
    fn empty_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&frame_bytes(b"")).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(&(-5i32).to_be_bytes());
        assert_eq!(result, Err(DecodeError::NegativeLength(-5)));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buffer = FrameBuffer::with_max_frame(100);
        let result = buffer.push(&1000i32.to_be_bytes());
        assert_eq!(result, Err(DecodeError::FrameTooLarge(1000)));
    }

    #[test]
    fn complete_frame_followed_by_partial() {
        let mut buffer = FrameBuffer::new();
        let first = frame_bytes(b"first");
        let second = frame_bytes(b"second");

        let mut data = first;
        data.extend_from_slice(&second[..3]);

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"first");

        let frames = buffer.push(&second[3..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"second");
    }
}
