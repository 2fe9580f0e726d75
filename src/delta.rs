//! Zero-run compression for metric-major delta streams.
//!
//! A chunk's sample matrix is flattened metric-major: every delta for
//! metric 0, then every delta for metric 1, and so on. Each delta is
//! written as a zigzag varint; a zero delta is immediately followed by a
//! second varint carrying `run_length - 1`, the count of consecutive
//! zeros starting at that position. Runs are counted over the whole
//! flattened stream and may cross metric boundaries; the decoder fans the
//! zeros back out without caring where one metric ends and the next
//! begins.

use crate::varint;

/// Delta-stream codec errors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Underlying varint failure, including truncation mid-stream.
    #[error(transparent)]
    Varint(#[from] varint::Error),
    /// A zero run would push the stream past the declared delta count.
    #[error("oversized chunk: decoded deltas exceed the expected {expected}")]
    OversizedChunk {
        /// Delta count the chunk header declared.
        expected: usize,
    },
}

/// Encode `deltas` with zero-run compression.
///
/// A run of zeros is always emitted as a single `(0, run_length - 1)`
/// pair, never split in two.
#[must_use]
pub fn encode(deltas: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(deltas.len());
    let mut i = 0;
    while i < deltas.len() {
        let delta = deltas[i];
        varint::write_u64(&mut out, varint::zigzag(delta));
        if delta == 0 {
            let run = deltas[i..].iter().take_while(|&&d| d == 0).count();
            varint::write_u64(&mut out, (run - 1) as u64);
            i += run;
        } else {
            i += 1;
        }
    }
    out
}

/// Decode exactly `expected` deltas from `bytes` starting at `*pos`,
/// advancing the cursor.
///
/// # Errors
///
/// [`varint::Error::TruncatedStream`] when the input ends before
/// `expected` deltas have been placed, [`Error::OversizedChunk`] when a
/// zero run overflows the expected count.
pub fn decode(bytes: &[u8], pos: &mut usize, expected: usize) -> Result<Vec<i64>, Error> {
    let mut out = Vec::with_capacity(expected);
    while out.len() < expected {
        let delta = varint::unzigzag(varint::read_u64(bytes, pos)?);
        if delta == 0 {
            let run_len = varint::read_u64(bytes, pos)?;
            let remaining = (expected - out.len()) as u64;
            if run_len >= remaining {
                return Err(Error::OversizedChunk { expected });
            }
            out.resize(out.len() + run_len as usize + 1, 0);
        } else {
            out.push(delta);
        }
    }
    Ok(out)
}
