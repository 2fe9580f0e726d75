//! Envelope framing for FTDC byte streams.
//!
//! The outer stream is a plain concatenation of BSON documents. Only
//! documents whose int32 `type` field is 1 carry chunk data; anything
//! else (type 0 metadata, for instance) is skipped. The `data` field of a
//! metric document is generic binary: a 4-byte little-endian uncompressed
//! length followed by a zlib (RFC 1950) stream whose plaintext is a chunk
//! block. The reference document travels at the head of the plaintext, so
//! the stream is self-describing.
//!
//! Reading is a pull: [`ChunkReader`] is an iterator the consumer drains
//! at its own pace. Per document it moves Idle -> ReadingDocument ->
//! DecompressingPayload -> DecodingBlock -> Idle; the first fault parks it
//! in a terminal Failed state, after which the iterator yields nothing.
//! Ordering is stream order, cancellation is dropping the iterator, and a
//! chunk is either emitted whole or not at all.

use std::io::{ErrorKind, Read, Write};

use bson::{spec::BinarySubtype, Binary, Document};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use tracing::{debug, trace, warn};

use crate::chunk::{Chunk, TimeRange};

/// `type` value of envelope documents that carry chunk data.
const METRIC_TYPE: i32 = 1;

/// Smallest well-formed BSON document: length, terminator.
const MIN_DOCUMENT_LEN: usize = 5;

/// Largest envelope document we will read, per the BSON document cap.
const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

/// Envelope stream errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Raw reader or writer failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed envelope document.
    #[error("bad envelope: {0}")]
    BadEnvelope(String),
    /// Zlib failure while inflating or deflating a payload.
    #[error("bad compression: {0}")]
    BadCompression(#[source] std::io::Error),
    /// The inflated block disagrees with the declared uncompressed length.
    #[error("length mismatch: declared {declared} bytes, inflated {actual}")]
    LengthMismatch {
        /// Length the payload's 4-byte prefix declared.
        declared: usize,
        /// Bytes the zlib stream actually inflated to.
        actual: usize,
    },
    /// The plaintext block failed to decode.
    #[error(transparent)]
    Chunk(#[from] crate::chunk::Error),
}

/// Pull iterator over the chunks of an FTDC byte stream.
///
/// Yields chunks in stream order. The first error fuses the iterator:
/// the faulty item is yielded once and every later call returns `None`.
#[derive(Debug)]
pub struct ChunkReader<R: Read> {
    reader: R,
    failed: bool,
}

impl<R: Read> ChunkReader<R> {
    /// Wrap a reader positioned at the start of an envelope document.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
        }
    }

    /// Read one envelope document, `None` on a clean end of stream.
    fn read_document(&mut self) -> Result<Option<Document>, Error> {
        let mut len_buf = [0u8; 4];
        // A clean end of stream is only legal on a document boundary.
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(Error::BadEnvelope(format!(
                    "stream ended {n} bytes into a document length prefix"
                )))
            }
        }

        let doc_len = u32::from_le_bytes(len_buf) as usize;
        if !(MIN_DOCUMENT_LEN..=MAX_DOCUMENT_LEN).contains(&doc_len) {
            return Err(Error::BadEnvelope(format!(
                "implausible document length {doc_len}"
            )));
        }

        let mut raw = vec![0u8; doc_len];
        raw[..4].copy_from_slice(&len_buf);
        self.reader.read_exact(&mut raw[4..]).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::BadEnvelope("stream ended inside a document".to_owned())
            } else {
                Error::Io(e)
            }
        })?;

        let doc = Document::from_reader(&mut raw.as_slice())
            .map_err(|e| Error::BadEnvelope(e.to_string()))?;
        Ok(Some(doc))
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, Error> {
        loop {
            let Some(doc) = self.read_document()? else {
                return Ok(None);
            };

            let doc_type = doc
                .get_i32("type")
                .map_err(|_| Error::BadEnvelope("missing int32 `type` field".to_owned()))?;
            if doc_type != METRIC_TYPE {
                trace!(doc_type, "skipping non-metric document");
                continue;
            }

            let payload = doc
                .get_binary_generic("data")
                .map_err(|_| Error::BadEnvelope("missing binary `data` field".to_owned()))?;
            let block = inflate(payload)?;
            let chunk = Chunk::decode(&block)?;
            debug!(
                metrics = chunk.metrics().len(),
                deltas = chunk.n_deltas(),
                start_ms = ?chunk.start_ms(),
                "decoded chunk"
            );
            return Ok(Some(chunk));
        }
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(error) => {
                self.failed = true;
                warn!(%error, "chunk stream failed");
                Some(Err(error))
            }
        }
    }
}

/// Writer reassembling chunks into an FTDC byte stream.
#[derive(Debug)]
pub struct ChunkWriter<W: Write> {
    writer: W,
}

impl<W: Write> ChunkWriter<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode `chunk`, deflate the block and append the wrapping document.
    ///
    /// # Errors
    ///
    /// Chunk encoding, zlib and IO failures.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), Error> {
        let block = chunk.encode()?;
        let declared = u32::try_from(block.len())
            .map_err(|_| Error::BadEnvelope("chunk block exceeds the u32 length prefix".to_owned()))?;

        let mut payload = Vec::with_capacity(block.len() / 2 + 4);
        payload.extend_from_slice(&declared.to_le_bytes());
        let mut encoder = ZlibEncoder::new(payload, Compression::default());
        encoder.write_all(&block).map_err(Error::BadCompression)?;
        let payload = encoder.finish().map_err(Error::BadCompression)?;

        let doc = bson::doc! {
            "type": METRIC_TYPE,
            "data": Binary { subtype: BinarySubtype::Generic, bytes: payload },
        };
        doc.to_writer(&mut self.writer)
            .map_err(|e| Error::BadEnvelope(e.to_string()))?;
        Ok(())
    }

    /// Flush the underlying writer.
    ///
    /// # Errors
    ///
    /// IO failures.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }

    /// Unwrap the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Collect every chunk in `reader` whose start time falls in `range`.
///
/// # Errors
///
/// Any stream or codec failure; the partial prefix is discarded.
pub fn read_chunks<R: Read>(reader: R, range: TimeRange) -> Result<Vec<Chunk>, Error> {
    let mut chunks = Vec::new();
    for result in ChunkReader::new(reader) {
        let chunk = result?;
        if !chunk.clip(range) {
            trace!(start_ms = ?chunk.start_ms(), "chunk outside requested range");
            continue;
        }
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Like `read_exact`, but reports how many bytes arrived before EOF
/// instead of failing.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}

fn inflate(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() < 4 {
        return Err(Error::BadEnvelope(
            "data field shorter than its length prefix".to_owned(),
        ));
    }
    let declared =
        u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;

    let mut block = Vec::with_capacity(declared.min(MAX_DOCUMENT_LEN));
    ZlibDecoder::new(&payload[4..])
        .read_to_end(&mut block)
        .map_err(Error::BadCompression)?;
    if block.len() != declared {
        return Err(Error::LengthMismatch {
            declared,
            actual: block.len(),
        });
    }
    Ok(block)
}
