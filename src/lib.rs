//! Read, write and analyze FTDC (Full-Time Diagnostic Capture) streams.
//!
//! FTDC records periodic snapshots of document-shaped telemetry. A
//! producing service emits one snapshot document per sampling interval;
//! consecutive snapshots of identical shape are grouped into chunks and
//! stored as delta- and zero-run-compressed integer series, one series
//! per metric path, wrapped in zlib inside a stream of small BSON
//! envelope documents.
//!
//! Decoding runs bytes through [`stream::ChunkReader`] into
//! [`chunk::Chunk`] values, which reconstruct per-sample documents
//! ([`chunk::Chunk::samples`]) or aggregate into [`stats::StatsSet`]
//! summaries; two summaries compare with [`compare::compare`].
//! [`stream::ChunkWriter`] goes the other way.
//!
//! The codec is not a general compressor: it exploits the shared shape of
//! a chunk's samples, chunks are the granularity of random access, and a
//! metric that changes name or type simply begins a new series in the
//! next chunk.

#![deny(clippy::cargo)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

pub mod chunk;
pub mod compare;
pub mod delta;
pub mod flatten;
pub mod stats;
pub mod stream;
pub mod varint;

pub use chunk::{Chunk, Metric, TimeRange};
pub use compare::{compare, CompareConfig, Comparison};
pub use stats::{MetricStats, StatsSet};
pub use stream::{ChunkReader, ChunkWriter};

/// Any failure this crate can surface.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Varint codec failure.
    #[error(transparent)]
    Varint(#[from] varint::Error),
    /// Delta-stream codec failure.
    #[error(transparent)]
    Delta(#[from] delta::Error),
    /// Chunk block codec failure.
    #[error(transparent)]
    Chunk(#[from] chunk::Error),
    /// Envelope stream failure.
    #[error(transparent)]
    Stream(#[from] stream::Error),
    /// Statistics failure.
    #[error(transparent)]
    Stats(#[from] stats::Error),
}
