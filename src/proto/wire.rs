//! Marshalling primitives: big-endian fixed-width integers and bounded,
//! NUL-terminated strings over `bytes` buffers.

use bytes::{Buf, BufMut};

use crate::error::{MountqError, Result};

pub fn put_i32(buf: &mut impl BufMut, v: i32) {
    buf.put_i32(v);
}

pub fn put_i64(buf: &mut impl BufMut, v: i64) {
    buf.put_i64(v);
}

pub fn get_i32(buf: &mut impl Buf) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(MountqError::protocol("truncated integer field"));
    }
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(MountqError::protocol("truncated 64-bit field"));
    }
    Ok(buf.get_i64())
}

/// Write `s` followed by a NUL terminator. Rejects strings longer than
/// `max` content bytes or containing embedded NULs.
pub fn put_string(buf: &mut impl BufMut, s: &str, max: usize) -> Result<()> {
    if s.len() > max {
        return Err(MountqError::protocol(format!(
            "string field too long: {} > {} bytes",
            s.len(),
            max
        )));
    }
    if s.as_bytes().contains(&0) {
        return Err(MountqError::protocol("embedded NUL in string field"));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Read a NUL-terminated string of at most `max` content bytes. A missing
/// terminator within `max + 1` bytes is an over-length field and is
/// rejected, never truncated.
pub fn get_string(buf: &mut impl Buf, max: usize) -> Result<String> {
    let mut out = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(MountqError::protocol("unterminated string field"));
        }
        let b = buf.get_u8();
        if b == 0 {
            break;
        }
        if out.len() == max {
            return Err(MountqError::protocol(format!(
                "string field exceeds {} bytes",
                max
            )));
        }
        out.push(b);
    }
    String::from_utf8(out).map_err(|_| MountqError::protocol("non-UTF-8 string field"))
}

/// Wire size of a string field: content bytes plus the NUL terminator.
pub fn string_len(s: &str) -> usize {
    s.len() + 1
}
