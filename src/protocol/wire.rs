//! Big-endian wire primitives.
//!
//! The protocol encodes records as fixed-layout big-endian fields:
//! int32 (4B), int64 (8B), bool (1B), byte buffers and strings as an
//! int32 length prefix followed by the bytes (length -1 denotes null).
//!
//! Decoding is total: truncated input and out-of-range length prefixes
//! come back as [`DecodeError`], never as a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

/// Length of the frame length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

pub fn read_i32(buf: &mut impl Buf) -> Result<i32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut impl Buf) -> Result<i64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(buf.get_i64())
}

pub fn read_bool(buf: &mut impl Buf) -> Result<bool, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(buf.get_u8() != 0)
}

/// Read a length-prefixed byte buffer. Length -1 decodes as `None`.
pub fn read_buffer(buf: &mut impl Buf) -> Result<Option<Vec<u8>>, DecodeError> {
    let len = read_i32(buf)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(DecodeError::NegativeLength(len));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(Some(out))
}

/// Read a length-prefixed UTF-8 string. A null buffer decodes as "".
pub fn read_string(buf: &mut impl Buf) -> Result<String, DecodeError> {
    match read_buffer(buf)? {
        None => Ok(String::new()),
        Some(bytes) => String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8),
    }
}

/// Read a vector of strings. A -1 count decodes as an empty vector.
pub fn read_string_vec(buf: &mut impl Buf) -> Result<Vec<String>, DecodeError> {
    let count = read_i32(buf)?;
    if count == -1 {
        return Ok(Vec::new());
    }
    if count < 0 {
        return Err(DecodeError::NegativeLength(count));
    }
    let count = count as usize;
    // Each entry is at least its own 4-byte length prefix.
    if buf.remaining() < count.saturating_mul(4) {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_string(buf)?);
    }
    Ok(out)
}

pub fn write_i32(buf: &mut BytesMut, v: i32) {
    buf.put_i32(v);
}

pub fn write_i64(buf: &mut BytesMut, v: i64) {
    buf.put_i64(v);
}

pub fn write_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

pub fn write_buffer(buf: &mut BytesMut, v: Option<&[u8]>) {
    match v {
        None => buf.put_i32(-1),
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
    }
}

pub fn write_string(buf: &mut BytesMut, v: &str) {
    write_buffer(buf, Some(v.as_bytes()));
}

pub fn write_string_vec(buf: &mut BytesMut, v: &[String]) {
    buf.put_i32(v.len() as i32);
    for s in v {
        write_string(buf, s);
    }
}

/// Start a request frame: a buffer with the 4-byte length prefix reserved.
pub fn new_frame() -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_i32(0);
    buf
}

/// Backfill the length prefix and freeze the frame for sending.
pub fn finish_frame(mut buf: BytesMut) -> Bytes {
    let body_len = (buf.len() - LEN_PREFIX_SIZE) as i32;
    buf[..LEN_PREFIX_SIZE].copy_from_slice(&body_len.to_be_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints_roundtrip_big_endian() {
        let mut buf = BytesMut::new();
        write_i32(&mut buf, 0x01020304);
        write_i64(&mut buf, -2);
        assert_eq!(&buf[..4], &[0x01, 0x02, 0x03, 0x04]);

        let mut rd = buf.freeze();
        assert_eq!(read_i32(&mut rd).unwrap(), 0x01020304);
        assert_eq!(read_i64(&mut rd).unwrap(), -2);
    }

    #[test]
    fn truncated_ints_fail() {
        let mut short = Bytes::from_static(&[0, 0, 0]);
        assert_eq!(read_i32(&mut short), Err(DecodeError::UnexpectedEof));
        let mut short = Bytes::from_static(&[0; 7]);
        assert_eq!(read_i64(&mut short), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn buffer_roundtrip_and_null() {
        let mut buf = BytesMut::new();
        write_buffer(&mut buf, Some(b"abc"));
        write_buffer(&mut buf, None);

        let mut rd = buf.freeze();
        assert_eq!(read_buffer(&mut rd).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(read_buffer(&mut rd).unwrap(), None);
    }

    #[test]
    fn negative_buffer_length_is_rejected() {
        let mut buf = BytesMut::new();
        write_i32(&mut buf, -7);
        let mut rd = buf.freeze();
        assert_eq!(read_buffer(&mut rd), Err(DecodeError::NegativeLength(-7)));
    }

    #[test]
    fn buffer_longer_than_input_is_rejected() {
        let mut buf = BytesMut::new();
        write_i32(&mut buf, 100);
        buf.put_slice(b"short");
        let mut rd = buf.freeze();
        assert_eq!(read_buffer(&mut rd), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "/zookeeper/quota");
        let mut rd = buf.freeze();
        assert_eq!(read_string(&mut rd).unwrap(), "/zookeeper/quota");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut buf = BytesMut::new();
        write_buffer(&mut buf, Some(&[0xff, 0xfe]));
        let mut rd = buf.freeze();
        assert_eq!(read_string(&mut rd), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn string_vec_roundtrip() {
        let v = vec!["/a".to_string(), "/b/c".to_string(), String::new()];
        let mut buf = BytesMut::new();
        write_string_vec(&mut buf, &v);
        let mut rd = buf.freeze();
        assert_eq!(read_string_vec(&mut rd).unwrap(), v);
    }

    #[test]
    fn huge_string_vec_count_is_rejected() {
        let mut buf = BytesMut::new();
        write_i32(&mut buf, i32::MAX);
        let mut rd = buf.freeze();
        assert_eq!(read_string_vec(&mut rd), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn frame_length_is_backfilled() {
        let mut frame = new_frame();
        write_i32(&mut frame, 7);
        write_i64(&mut frame, 9);
        let bytes = finish_frame(frame);
        assert_eq!(&bytes[..4], &[0, 0, 0, 12]);
        assert_eq!(bytes.len(), LEN_PREFIX_SIZE + 12);
    }
}
