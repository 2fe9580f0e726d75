//! Proximity comparison between two statistical profiles.
//!
//! Two runs of the same workload should produce close per-metric means.
//! For every metric name both sets share, the score is the symmetric
//! relative difference of the means,
//! `|mean_a - mean_b| / max(1, (|mean_a| + |mean_b|) / 2)`; the floor of
//! 1 in the denominator keeps near-zero means from dividing the
//! comparison to infinity, at the cost of biasing scores for
//! small-magnitude metrics. The overall score is the arithmetic mean of
//! the shared per-metric scores.

use std::cmp::Ordering;

use serde::Serialize;

use crate::stats::StatsSet;

/// Tunables for [`compare`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompareConfig {
    /// Largest overall score still considered a pass.
    pub threshold: f64,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self { threshold: 0.2 }
    }
}

/// The side of a comparison that lacked a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The first set passed to [`compare`].
    Left,
    /// The second set passed to [`compare`].
    Right,
}

/// Per-metric comparison outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricScore {
    /// Fully-qualified metric name.
    pub name: String,
    /// Symmetric relative difference of the two means.
    pub score: f64,
    /// Set when the metric exists on one side only. Such metrics score
    /// zero and do not contribute to the overall score.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Side>,
}

/// Comparison verdict with its per-metric breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    /// Mean per-metric score over the shared metric names. Zero when the
    /// sets share no names.
    pub score: f64,
    /// Whether `score` is within the configured threshold.
    pub ok: bool,
    /// Per-metric breakdown, most deviant first, name as tiebreak.
    pub scores: Vec<MetricScore>,
}

/// Score the deviation between two statistical profiles.
#[must_use]
pub fn compare(a: &StatsSet, b: &StatsSet, config: &CompareConfig) -> Comparison {
    let mut scores = Vec::with_capacity(a.metrics.len().max(b.metrics.len()));
    let mut sum = 0.0;
    let mut shared = 0usize;

    for (name, stats_a) in &a.metrics {
        match b.metrics.get(name) {
            Some(stats_b) => {
                let spread = (stats_a.mean.abs() + stats_b.mean.abs()) / 2.0;
                let score = (stats_a.mean - stats_b.mean).abs() / spread.max(1.0);
                sum += score;
                shared += 1;
                scores.push(MetricScore {
                    name: name.clone(),
                    score,
                    missing: None,
                });
            }
            None => scores.push(MetricScore {
                name: name.clone(),
                score: 0.0,
                missing: Some(Side::Right),
            }),
        }
    }
    for name in b.metrics.keys() {
        if !a.metrics.contains_key(name) {
            scores.push(MetricScore {
                name: name.clone(),
                score: 0.0,
                missing: Some(Side::Left),
            });
        }
    }

    scores.sort_by(|x, y| match y.score.total_cmp(&x.score) {
        Ordering::Equal => x.name.cmp(&y.name),
        unequal => unequal,
    });

    #[allow(clippy::cast_precision_loss)]
    let score = if shared == 0 { 0.0 } else { sum / shared as f64 };
    Comparison {
        score,
        ok: score <= config.threshold,
        scores,
    }
}
