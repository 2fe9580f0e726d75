//! Chunks of delta-compressed metric samples.
//!
//! A chunk is a contiguous group of samples sharing one schema. On the
//! wire it is a reference document (the first sample, in its original
//! shape) followed by a small header, one starting value per metric and a
//! zero-run-compressed delta stream. Decoding recovers the schema by
//! flattening the reference and pairs the i-th schema entry with the i-th
//! starting value and the i-th per-metric delta slice.
//!
//! Chunks are built by the decoder or one of the constructors and are
//! read-only afterwards.

use std::collections::hash_map::Entry;

use bson::{Bson, Document};
use bytes::{Buf, BufMut};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::{delta, flatten};

/// Chunk block codec errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Delta-stream codec failure.
    #[error(transparent)]
    Delta(#[from] delta::Error),
    /// The reference document failed to parse or serialize.
    #[error("bad envelope: {0}")]
    BadEnvelope(String),
    /// The block ended before its declared contents.
    #[error("truncated stream: block ended inside the {0}")]
    TruncatedStream(&'static str),
    /// The reference schema disagrees with the data at hand.
    #[error("schema mismatch: expected {expected} metrics, found {found}")]
    SchemaMismatch {
        /// Metric count the reference document's schema calls for.
        expected: usize,
        /// Metric count actually present.
        found: usize,
    },
    /// No documents to build a chunk from.
    #[error("empty input: a chunk needs at least one sample")]
    EmptyInput,
}

/// An identified numeric series within a [`Chunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    /// Parent keys, outermost first. Empty for root-level leaves.
    pub path: Vec<String>,
    /// Leaf name. May carry a disambiguating suffix, e.g. `.inc` for the
    /// incrementing half of a timestamp pair.
    pub key: String,
    /// Value of the first sample.
    pub starting_value: i64,
    /// Differences between successive samples.
    pub deltas: Vec<i64>,
}

impl Metric {
    pub(crate) fn new(path: Vec<String>, key: impl Into<String>, starting_value: i64) -> Self {
        Self {
            path,
            key: key.into(),
            starting_value,
            deltas: Vec::new(),
        }
    }

    /// Fully-qualified name: path segments and key joined with `.`.
    #[must_use]
    pub fn name(&self) -> String {
        if self.path.is_empty() {
            self.key.clone()
        } else {
            format!("{}.{}", self.path.join("."), self.key)
        }
    }

    /// Reconstructed sample series: the prefix sum of
    /// `[starting_value, deltas...]`, length `deltas.len() + 1`.
    #[must_use]
    pub fn values(&self) -> Vec<i64> {
        let mut values = Vec::with_capacity(self.deltas.len() + 1);
        let mut acc = self.starting_value;
        values.push(acc);
        for delta in &self.deltas {
            acc = acc.wrapping_add(*delta);
            values.push(acc);
        }
        values
    }
}

/// Half-open wall-clock window in milliseconds since the epoch, used to
/// select whole chunks by their start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub start_ms: i64,
    /// Exclusive upper bound.
    pub end_ms: i64,
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start_ms: i64::MIN,
            end_ms: i64::MAX,
        }
    }
}

impl TimeRange {
    /// Whether `t` falls inside `[start_ms, end_ms)`.
    #[must_use]
    pub fn contains(&self, t: i64) -> bool {
        self.start_ms <= t && t < self.end_ms
    }
}

/// A contiguous group of samples sharing one schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// First sample in its original shape; defines the schema.
    reference: Document,
    /// One series per schema entry, in flatten order.
    metrics: Vec<Metric>,
    /// Count of samples beyond the reference.
    n_deltas: usize,
}

impl Chunk {
    /// Build a chunk from consecutive sample documents. The first is the
    /// reference; every later one must share its shape.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyInput`] with no documents, [`Error::SchemaMismatch`]
    /// when a sample flattens to a different schema than the reference.
    pub fn from_documents(docs: &[Document]) -> Result<Self, Error> {
        let (reference, rest) = docs.split_first().ok_or(Error::EmptyInput)?;
        let mut metrics = flatten::flatten_document(reference);
        let mut prev: Vec<i64> = metrics.iter().map(|m| m.starting_value).collect();

        for doc in rest {
            let row = flatten::flatten_document(doc);
            if row.len() != metrics.len() {
                return Err(Error::SchemaMismatch {
                    expected: metrics.len(),
                    found: row.len(),
                });
            }
            for ((metric, prev_value), sample) in metrics.iter_mut().zip(&mut prev).zip(row) {
                if sample.path != metric.path || sample.key != metric.key {
                    return Err(Error::SchemaMismatch {
                        expected: metrics.len(),
                        found: metrics.len(),
                    });
                }
                metric
                    .deltas
                    .push(sample.starting_value.wrapping_sub(*prev_value));
                *prev_value = sample.starting_value;
            }
        }

        Ok(Self {
            reference: reference.clone(),
            metrics,
            n_deltas: rest.len(),
        })
    }

    /// Build a chunk from a reference document and an
    /// `n_points x n_metrics` sample matrix whose row 0 equals the
    /// reference's flattened values.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyInput`] with no rows, [`Error::SchemaMismatch`] when
    /// a row's width disagrees with the schema or row 0 disagrees with
    /// the reference.
    pub fn from_matrix(reference: Document, rows: Vec<Vec<i64>>) -> Result<Self, Error> {
        let mut metrics = flatten::flatten_document(&reference);
        let (first, rest) = rows.split_first().ok_or(Error::EmptyInput)?;

        let starting: Vec<i64> = metrics.iter().map(|m| m.starting_value).collect();
        if *first != starting {
            return Err(Error::SchemaMismatch {
                expected: metrics.len(),
                found: first.len(),
            });
        }

        let mut prev = starting;
        for row in rest {
            if row.len() != metrics.len() {
                return Err(Error::SchemaMismatch {
                    expected: metrics.len(),
                    found: row.len(),
                });
            }
            for ((metric, prev_value), sample) in metrics.iter_mut().zip(&mut prev).zip(row) {
                metric.deltas.push(sample.wrapping_sub(*prev_value));
                *prev_value = *sample;
            }
        }

        Ok(Self {
            reference,
            metrics,
            n_deltas: rows.len() - 1,
        })
    }

    /// Decode a plaintext chunk block: reference document, metric and
    /// delta counts, starting values, compressed delta stream.
    ///
    /// # Errors
    ///
    /// [`Error::BadEnvelope`] when the reference document is malformed,
    /// [`Error::SchemaMismatch`] when the declared metric count disagrees
    /// with the flattened schema, [`Error::TruncatedStream`] and the
    /// delta-stream errors for short or overlong blocks.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = bytes;
        let reference =
            Document::from_reader(&mut cursor).map_err(|e| Error::BadEnvelope(e.to_string()))?;
        let mut metrics = flatten::flatten_document(&reference);

        if cursor.remaining() < 8 {
            return Err(Error::TruncatedStream("header"));
        }
        let n_metrics = cursor.get_u32_le() as usize;
        let n_deltas = cursor.get_u32_le() as usize;
        if n_metrics != metrics.len() {
            return Err(Error::SchemaMismatch {
                expected: metrics.len(),
                found: n_metrics,
            });
        }

        if cursor.remaining() < n_metrics * 8 {
            return Err(Error::TruncatedStream("starting values"));
        }
        for metric in &mut metrics {
            metric.starting_value = cursor.get_i64_le();
        }

        // The product can exceed the address space on 32-bit targets.
        let total = n_metrics
            .checked_mul(n_deltas)
            .ok_or(delta::Error::OversizedChunk { expected: usize::MAX })?;
        let mut pos = 0;
        let deltas = delta::decode(cursor, &mut pos, total)?;
        for (i, metric) in metrics.iter_mut().enumerate() {
            metric.deltas = deltas[i * n_deltas..(i + 1) * n_deltas].to_vec();
        }

        Ok(Self {
            reference,
            metrics,
            n_deltas,
        })
    }

    /// Encode this chunk back to its plaintext block. Inverse of
    /// [`Chunk::decode`].
    ///
    /// # Errors
    ///
    /// [`Error::BadEnvelope`] when the reference document cannot be
    /// serialized.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.reference
            .to_writer(&mut out)
            .map_err(|e| Error::BadEnvelope(e.to_string()))?;
        out.put_u32_le(self.metrics.len() as u32);
        out.put_u32_le(self.n_deltas as u32);
        for metric in &self.metrics {
            out.put_i64_le(metric.starting_value);
        }

        let mut deltas = Vec::with_capacity(self.metrics.len() * self.n_deltas);
        for metric in &self.metrics {
            deltas.extend_from_slice(&metric.deltas);
        }
        out.extend_from_slice(&delta::encode(&deltas));
        Ok(out)
    }

    /// The first sample in its original shape.
    #[must_use]
    pub fn reference(&self) -> &Document {
        &self.reference
    }

    /// Every series of this chunk, in schema order.
    #[must_use]
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Count of samples beyond the reference.
    #[must_use]
    pub fn n_deltas(&self) -> usize {
        self.n_deltas
    }

    /// Total sample count, `n_deltas + 1`.
    #[must_use]
    pub fn n_points(&self) -> usize {
        self.n_deltas + 1
    }

    /// Metrics keyed by fully-qualified name.
    #[must_use]
    pub fn metric_map(&self) -> FxHashMap<String, &Metric> {
        self.metrics.iter().map(|m| (m.name(), m)).collect()
    }

    /// First value of the root-level `start` metric: the millisecond
    /// wall-clock timestamp dating this chunk. `None` when the producing
    /// service recorded no such metric.
    #[must_use]
    pub fn start_ms(&self) -> Option<i64> {
        self.metrics
            .iter()
            .find(|m| m.path.is_empty() && m.key == "start")
            .map(|m| m.starting_value)
    }

    /// Whether this chunk falls inside `range`. Selection is whole-chunk,
    /// judged on the first `start` sample alone; a chunk with no `start`
    /// metric cannot be dated and is always kept.
    #[must_use]
    pub fn clip(&self, range: TimeRange) -> bool {
        self.start_ms().map_or(true, |t| range.contains(t))
    }

    /// Iterate over reconstructed per-sample documents with flat dotted
    /// keys. With `include` set, output keys are restricted to the named
    /// metrics; every series is still decoded, the filter is only a
    /// projection.
    #[must_use]
    pub fn samples<'a>(&'a self, include: Option<&FxHashSet<String>>) -> Samples<'a> {
        let names = self
            .metrics
            .iter()
            .map(|m| {
                let name = m.name();
                match include {
                    Some(keys) if !keys.contains(&name) => None,
                    _ => Some(name),
                }
            })
            .collect();
        Samples {
            chunk: self,
            names,
            current: self.metrics.iter().map(|m| m.starting_value).collect(),
            index: 0,
        }
    }
}

/// Concatenate per-metric deltas across `chunks`, keyed by fully-qualified
/// name. Each name keeps the starting value of the first chunk it appears
/// in.
///
/// Chunks are assumed temporally contiguous; nothing verifies it, and the
/// jump between one chunk's last sample and the next chunk's first is not
/// represented. Gap detection is the caller's concern.
#[must_use]
pub fn merge_metrics<I>(chunks: I) -> FxHashMap<String, Metric>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut total: FxHashMap<String, Metric> = FxHashMap::default();
    for chunk in chunks {
        for metric in chunk.metrics {
            match total.entry(metric.name()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().deltas.extend(metric.deltas);
                }
                Entry::Vacant(entry) => {
                    entry.insert(metric);
                }
            }
        }
    }
    total
}

/// Iterator over a chunk's reconstructed samples as flat documents.
#[derive(Debug)]
pub struct Samples<'a> {
    chunk: &'a Chunk,
    /// Emitted name per metric, `None` when projected out.
    names: Vec<Option<String>>,
    current: Vec<i64>,
    index: usize,
}

impl Iterator for Samples<'_> {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        if self.index > self.chunk.n_deltas {
            return None;
        }
        if self.index > 0 {
            for (value, metric) in self.current.iter_mut().zip(&self.chunk.metrics) {
                *value = value.wrapping_add(metric.deltas[self.index - 1]);
            }
        }
        let mut doc = Document::new();
        for (name, value) in self.names.iter().zip(&self.current) {
            if let Some(name) = name {
                doc.insert(name.clone(), Bson::Int64(*value));
            }
        }
        self.index += 1;
        Some(doc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.chunk.n_deltas + 1 - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Samples<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use proptest::prelude::*;

    fn single_metric_chunk() -> Chunk {
        Chunk::from_matrix(
            doc! { "start": 1000i64 },
            vec![vec![1000], vec![1001], vec![1003], vec![1006]],
        )
        .expect("well-formed chunk")
    }

    #[test]
    fn single_metric_block_layout() {
        let chunk = single_metric_chunk();
        assert_eq!(chunk.n_deltas(), 3);
        assert_eq!(chunk.metrics()[0].starting_value, 1000);
        assert_eq!(chunk.metrics()[0].deltas, vec![1, 2, 3]);

        let block = chunk.encode().unwrap();
        let ref_len = u32::from_le_bytes(block[..4].try_into().unwrap()) as usize;
        let tail = &block[ref_len..];
        assert_eq!(&tail[..4], &1u32.to_le_bytes(), "n_metrics");
        assert_eq!(&tail[4..8], &3u32.to_le_bytes(), "n_deltas");
        assert_eq!(&tail[8..16], &1000i64.to_le_bytes(), "starting value");
        assert_eq!(&tail[16..], &[0x02, 0x04, 0x06], "zigzag varint deltas");
    }

    #[test]
    fn decode_is_the_inverse_of_encode() {
        let chunk = single_metric_chunk();
        let decoded = Chunk::decode(&chunk.encode().unwrap()).unwrap();
        assert_eq!(decoded, chunk);
        let metric = &decoded.metrics()[0];
        assert_eq!(metric.values(), vec![1000, 1001, 1003, 1006]);
    }

    #[test]
    fn values_is_the_prefix_sum() {
        let metric = Metric {
            path: vec!["a".into()],
            key: "b".into(),
            starting_value: 10,
            deltas: vec![-3, 0, 5],
        };
        assert_eq!(metric.values(), vec![10, 7, 7, 12]);
        assert_eq!(metric.name(), "a.b");
    }

    #[test]
    fn from_documents_computes_deltas() {
        let docs = vec![
            doc! { "start": 1000i64, "net": { "rx": 5i64 } },
            doc! { "start": 2000i64, "net": { "rx": 5i64 } },
            doc! { "start": 3000i64, "net": { "rx": 9i64 } },
        ];
        let chunk = Chunk::from_documents(&docs).unwrap();
        assert_eq!(chunk.n_deltas(), 2);
        let map = chunk.metric_map();
        assert_eq!(map["start"].deltas, vec![1000, 1000]);
        assert_eq!(map["net.rx"].deltas, vec![0, 4]);
    }

    #[test]
    fn from_documents_rejects_shape_changes() {
        let docs = vec![
            doc! { "a": 1i64, "b": 2i64 },
            doc! { "a": 1i64 },
        ];
        assert!(matches!(
            Chunk::from_documents(&docs),
            Err(Error::SchemaMismatch {
                expected: 2,
                found: 1
            })
        ));

        let renamed = vec![doc! { "a": 1i64 }, doc! { "z": 1i64 }];
        assert!(matches!(
            Chunk::from_documents(&renamed),
            Err(Error::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn from_documents_rejects_empty_input() {
        assert!(matches!(Chunk::from_documents(&[]), Err(Error::EmptyInput)));
    }

    #[test]
    fn from_matrix_requires_row_zero_to_match_reference() {
        let result = Chunk::from_matrix(doc! { "x": 5i64 }, vec![vec![6]]);
        assert!(matches!(result, Err(Error::SchemaMismatch { .. })));
    }

    #[test]
    fn decode_rejects_wrong_metric_count() {
        let chunk = single_metric_chunk();
        let mut block = chunk.encode().unwrap();
        let ref_len = u32::from_le_bytes(block[..4].try_into().unwrap()) as usize;
        // Declare two metrics against a one-metric reference.
        block[ref_len..ref_len + 4].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            Chunk::decode(&block),
            Err(Error::SchemaMismatch {
                expected: 1,
                found: 2
            })
        ));
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let chunk = single_metric_chunk();
        let block = chunk.encode().unwrap();
        let ref_len = u32::from_le_bytes(block[..4].try_into().unwrap()) as usize;
        assert!(matches!(
            Chunk::decode(&block[..ref_len + 6]),
            Err(Error::TruncatedStream("header"))
        ));
        assert!(matches!(
            Chunk::decode(&block[..ref_len + 12]),
            Err(Error::TruncatedStream("starting values"))
        ));
    }

    #[test]
    fn decode_rejects_garbage_reference() {
        assert!(matches!(
            Chunk::decode(&[0xff, 0xff, 0xff]),
            Err(Error::BadEnvelope(_))
        ));
    }

    #[test]
    fn clip_boundaries() {
        let chunk = single_metric_chunk();
        // start[0] is 1000.
        let inside = TimeRange {
            start_ms: 1000,
            end_ms: 1001,
        };
        let at_end = TimeRange {
            start_ms: 0,
            end_ms: 1000,
        };
        let below = TimeRange {
            start_ms: 1001,
            end_ms: 2000,
        };
        assert!(chunk.clip(inside), "inclusive lower bound");
        assert!(!chunk.clip(at_end), "exclusive upper bound");
        assert!(!chunk.clip(below));
        assert!(chunk.clip(TimeRange::default()));
    }

    #[test]
    fn undatable_chunk_is_kept() {
        let chunk = Chunk::from_matrix(doc! { "x": 1i64 }, vec![vec![1]]).unwrap();
        assert_eq!(chunk.start_ms(), None);
        assert!(chunk.clip(TimeRange {
            start_ms: 0,
            end_ms: 1
        }));
    }

    #[test]
    fn samples_reconstruct_every_point() {
        let chunk = Chunk::from_documents(&[
            doc! { "start": 1000i64, "mem": { "rss": 10i64 } },
            doc! { "start": 2000i64, "mem": { "rss": 14i64 } },
        ])
        .unwrap();

        let samples: Vec<Document> = chunk.samples(None).collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], doc! { "start": 1000i64, "mem.rss": 10i64 });
        assert_eq!(samples[1], doc! { "start": 2000i64, "mem.rss": 14i64 });
    }

    #[test]
    fn samples_projection_keeps_decoding_intact() {
        let chunk = Chunk::from_documents(&[
            doc! { "start": 1000i64, "mem": { "rss": 10i64 } },
            doc! { "start": 2000i64, "mem": { "rss": 14i64 } },
        ])
        .unwrap();

        let include: FxHashSet<String> = ["mem.rss".to_owned()].into_iter().collect();
        let samples: Vec<Document> = chunk.samples(Some(&include)).collect();
        assert_eq!(samples[0], doc! { "mem.rss": 10i64 });
        assert_eq!(samples[1], doc! { "mem.rss": 14i64 });
    }

    #[test]
    fn samples_is_exact_size() {
        let chunk = single_metric_chunk();
        let iter = chunk.samples(None);
        assert_eq!(iter.len(), 4);
    }

    #[test]
    fn merge_concatenates_deltas_by_name() {
        let a = Chunk::from_matrix(
            doc! { "x": 1i64 },
            vec![vec![1], vec![2], vec![4]],
        )
        .unwrap();
        let b = Chunk::from_matrix(
            doc! { "x": 100i64, "y": 7i64 },
            vec![vec![100, 7], vec![101, 7]],
        )
        .unwrap();

        let merged = merge_metrics([a, b]);
        // x keeps the first chunk's starting value; the inter-chunk jump
        // is deliberately not represented.
        assert_eq!(merged["x"].starting_value, 1);
        assert_eq!(merged["x"].deltas, vec![1, 2, 1]);
        assert_eq!(merged["y"].starting_value, 7);
        assert_eq!(merged["y"].deltas, vec![0]);
    }

    fn matrix_strategy() -> impl Strategy<Value = (usize, Vec<Vec<i64>>)> {
        (1usize..5, 1usize..16).prop_flat_map(|(n_metrics, n_points)| {
            prop::collection::vec(
                prop::collection::vec(-1_000_000i64..1_000_000, n_metrics),
                n_points,
            )
            .prop_map(move |rows| (n_metrics, rows))
        })
    }

    proptest! {
        #[test]
        fn chunk_round_trip((n_metrics, rows) in matrix_strategy()) {
            let mut reference = Document::new();
            for (i, value) in rows[0].iter().enumerate() {
                reference.insert(format!("m{i}"), Bson::Int64(*value));
            }
            prop_assert_eq!(n_metrics, rows[0].len());

            let chunk = Chunk::from_matrix(reference, rows.clone()).unwrap();
            let decoded = Chunk::decode(&chunk.encode().unwrap()).unwrap();
            prop_assert_eq!(&decoded, &chunk);

            // Reconstructed columns equal the input matrix.
            for (i, metric) in decoded.metrics().iter().enumerate() {
                let column: Vec<i64> = rows.iter().map(|row| row[i]).collect();
                prop_assert_eq!(metric.values(), column);
            }
        }
    }
}
