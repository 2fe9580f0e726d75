//! LEB128 variable-length integers and the zigzag signed mapping.
//!
//! Every integer in a delta stream is an unsigned LEB128 varint: seven
//! payload bits per byte, least-significant group first, bit 7 set while
//! more bytes follow. Signed deltas pass through [`zigzag`] first so that
//! small-magnitude negatives stay short on the wire.

/// Longest legal encoding of a `u64`: `ceil(64 / 7)` bytes.
pub const MAX_LEN: usize = 10;

/// Varint codec errors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The encoding runs past ten bytes or carries payload above bit 63.
    #[error("invalid varint: encoding exceeds the 64-bit range")]
    InvalidVarint,
    /// Input ended in the middle of a varint.
    #[error("truncated stream: input ended mid-varint")]
    TruncatedStream,
}

/// Append `value` to `buf` as a LEB128 varint. Zero encodes to a single
/// `0x00` byte.
pub fn write_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode one varint from `bytes` starting at `*pos`, advancing the
/// cursor past the bytes consumed.
///
/// # Errors
///
/// [`Error::TruncatedStream`] when the input ends before the continuation
/// bit clears, [`Error::InvalidVarint`] when the encoding cannot fit a
/// `u64`.
pub fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(Error::TruncatedStream)?;
        *pos += 1;
        // The tenth byte holds only bit 63.
        if shift == 63 && byte & 0x7f > 1 {
            return Err(Error::InvalidVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::InvalidVarint);
        }
    }
}

/// Map a signed value onto the unsigned domain, interleaving positives
/// and negatives so small magnitudes encode short.
#[must_use]
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag`].
#[must_use]
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
