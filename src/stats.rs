//! Per-metric summary statistics over decoded chunks.
//!
//! A [`StatsSet`] maps fully-qualified metric names to their aggregates
//! and carries the total sample count. Sets built from single chunks
//! merge by sample-count-weighted average, so aggregating a whole stream
//! chunk-at-a-time holds O(one chunk) of sample data at any moment.
//!
//! Serialized form is part of the external contract:
//! `{ "metrics": { "a.b.c": { n, min, max, mean, avg_delta }, ... },
//! "n_samples": N }`.

use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, TimeRange};
use crate::stream::{self, ChunkReader};

/// Statistics engine errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Nothing to aggregate.
    #[error("empty input: no samples to aggregate")]
    EmptyInput,
    /// Underlying stream failure.
    #[error(transparent)]
    Stream(#[from] stream::Error),
}

/// Aggregates of a single metric's sample series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    /// Number of samples aggregated.
    pub n: u64,
    /// Smallest sample.
    pub min: i64,
    /// Largest sample.
    pub max: i64,
    /// Arithmetic mean of the samples.
    pub mean: f64,
    /// Mean of successive differences; zero for single-sample series.
    /// Positive values indicate an upward trend.
    pub avg_delta: f64,
}

impl MetricStats {
    /// Aggregate a non-empty series.
    fn from_series(values: &[i64]) -> Self {
        let n = values.len() as u64;
        let min = values.iter().copied().min().unwrap_or(0);
        let max = values.iter().copied().max().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        #[allow(clippy::cast_precision_loss)]
        let avg_delta = if values.len() > 1 {
            values
                .windows(2)
                .map(|w| (w[1].wrapping_sub(w[0])) as f64)
                .sum::<f64>()
                / (values.len() - 1) as f64
        } else {
            0.0
        };
        Self {
            n,
            min,
            max,
            mean,
            avg_delta,
        }
    }

    /// Sample-count-weighted combination of two aggregates of the same
    /// metric.
    #[must_use]
    fn merge(&self, other: &Self) -> Self {
        let n = self.n + other.n;
        #[allow(clippy::cast_precision_loss)]
        let weigh = |a: f64, b: f64| (self.n as f64 * a + other.n as f64 * b) / n as f64;
        Self {
            n,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            mean: weigh(self.mean, other.mean),
            avg_delta: weigh(self.avg_delta, other.avg_delta),
        }
    }
}

/// Per-metric aggregates for one or more chunks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSet {
    /// Aggregates keyed by fully-qualified metric name.
    pub metrics: BTreeMap<String, MetricStats>,
    /// Total sample count across everything merged in.
    pub n_samples: u64,
}

impl StatsSet {
    /// Aggregate every metric of one chunk.
    #[must_use]
    pub fn from_chunk(chunk: &Chunk) -> Self {
        let metrics = chunk
            .metrics()
            .iter()
            .map(|m| (m.name(), MetricStats::from_series(&m.values())))
            .collect();
        Self {
            metrics,
            n_samples: chunk.n_points() as u64,
        }
    }

    /// Merge two sets element-wise by metric name. Metrics present on
    /// one side only carry forward unchanged.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut metrics = self.metrics.clone();
        for (name, stats) in &other.metrics {
            metrics
                .entry(name.clone())
                .and_modify(|mine| *mine = mine.merge(stats))
                .or_insert(*stats);
        }
        Self {
            metrics,
            n_samples: self.n_samples + other.n_samples,
        }
    }

    /// Merge an entire sequence of sets.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyInput`] when the sequence is empty.
    pub fn merge_all<I>(sets: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = StatsSet>,
    {
        sets.into_iter()
            .reduce(|acc, next| acc.merge(&next))
            .ok_or(Error::EmptyInput)
    }
}

/// Stream `reader`, clip chunks to `range` and aggregate the survivors
/// chunk-at-a-time.
///
/// # Errors
///
/// Stream and codec failures, or [`Error::EmptyInput`] when no chunk
/// survives clipping.
pub fn compute_interval<R: Read>(reader: R, range: TimeRange) -> Result<StatsSet, Error> {
    let mut acc: Option<StatsSet> = None;
    for result in ChunkReader::new(reader) {
        let chunk = result?;
        if !chunk.clip(range) {
            continue;
        }
        let next = StatsSet::from_chunk(&chunk);
        acc = Some(match acc {
            Some(prev) => prev.merge(&next),
            None => next,
        });
    }
    acc.ok_or(Error::EmptyInput)
}
