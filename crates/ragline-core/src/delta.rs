//! Delta-Rule recurrent memory
//!
//! Carries a bounded semantic state vector across successive queries. Each
//! update removes the old value projected along the current key and writes
//! the new one, gated by a topic-shift-driven retention factor
//! (Mamba-2/DeltaNet-style semantics on a vector memory).

use crate::error::{RaglineError, Result};
use crate::text::text_jaccard;
use serde::{Deserialize, Serialize};

/// Retention gate selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GatingStrategy {
    /// Two-level scalar gate
    Uniform,
    /// Three-level scalar gate keyed off the topic-shift score
    #[default]
    DataDependent,
    /// Per-dimension gate splitting the state into semantic segments
    PerDimension,
}

/// Retention gate value: one scalar for every dimension, or one per dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Gate {
    Scalar(f64),
    PerDimension(Vec<f64>),
}

impl Gate {
    /// Mean retention across dimensions, for reporting
    pub fn mean(&self) -> f64 {
        match self {
            Self::Scalar(value) => *value,
            Self::PerDimension(values) => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
        }
    }

    fn apply(&self, state: &mut [f64]) {
        match self {
            Self::Scalar(value) => {
                for s in state.iter_mut() {
                    *s *= value;
                }
            }
            Self::PerDimension(values) => {
                for (s, &a) in state.iter_mut().zip(values.iter()) {
                    *s *= a;
                }
            }
        }
    }

    fn scaled(&self, base: &[f64]) -> Vec<f64> {
        match self {
            Self::Scalar(value) => base.iter().map(|b| b * value).collect(),
            Self::PerDimension(values) => base
                .iter()
                .zip(values.iter())
                .map(|(b, a)| b * a)
                .collect(),
        }
    }
}

/// Artifacts of one memory advance
#[derive(Debug, Clone)]
pub struct DeltaUpdate {
    pub topic_shift: f64,
    pub alpha: Gate,
    pub beta: f64,
}

/// Bounded recurrent memory over a session's queries
pub struct DeltaMemory {
    state: Option<Vec<f64>>,
    prev_query: Option<String>,
    dim: usize,
}

impl DeltaMemory {
    pub fn new(dim: usize) -> Self {
        Self {
            state: None,
            prev_query: None,
            dim: dim.max(1),
        }
    }

    /// Clear the state and the previous-query tracking.
    pub fn reset(&mut self) {
        self.state = None;
        self.prev_query = None;
    }

    pub fn state(&self) -> Option<&[f64]> {
        self.state.as_deref()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Record the query for topic-shift tracking without advancing the
    /// state. Used when the Delta-Rule update is disabled.
    pub fn note_query(&mut self, query: &str) {
        self.prev_query = Some(query.to_string());
    }

    /// Topic-shift score against the previous query: 1 - Jaccard over
    /// tokens, or 0 on the first call.
    pub fn topic_shift(&self, query: &str) -> f64 {
        match &self.prev_query {
            Some(prev) => 1.0 - text_jaccard(query, prev),
            None => 0.0,
        }
    }

    /// Select the retention gate for a topic-shift score.
    pub fn gate(
        &self,
        strategy: GatingStrategy,
        topic_shift: f64,
        threshold: f64,
    ) -> Gate {
        match strategy {
            GatingStrategy::Uniform => {
                if topic_shift > threshold {
                    Gate::Scalar(0.3)
                } else {
                    Gate::Scalar(0.9)
                }
            }
            GatingStrategy::DataDependent => {
                if topic_shift < threshold / 2.0 {
                    Gate::Scalar(0.9)
                } else if topic_shift < threshold {
                    Gate::Scalar(0.5)
                } else {
                    Gate::Scalar(0.2)
                }
            }
            GatingStrategy::PerDimension => {
                if topic_shift > 0.7 {
                    let mut values = vec![0.1; self.dim / 2];
                    values.resize(self.dim, 0.9);
                    Gate::PerDimension(values)
                } else {
                    Gate::PerDimension(vec![0.5; self.dim])
                }
            }
        }
    }

    /// Advance the state for a query.
    ///
    /// `key` is the unit-norm query embedding, `values` the unit-norm
    /// document embeddings backing the new write. The first call initializes
    /// `S := (v̄ · k) · k`.
    pub fn update(
        &mut self,
        query: &str,
        key: &[f32],
        values: &[Vec<f32>],
        strategy: GatingStrategy,
        threshold: f64,
        beta: f64,
    ) -> Result<DeltaUpdate> {
        if key.len() != self.dim {
            return Err(RaglineError::Embedder(format!(
                "key dimension {} does not match memory dimension {}",
                key.len(),
                self.dim
            )));
        }

        let topic_shift = self.topic_shift(query);
        let alpha = self.gate(strategy, topic_shift, threshold);

        let key: Vec<f64> = key.iter().map(|v| *v as f64).collect();
        let v_new = mean_projection(values, &key);

        match self.state.as_mut() {
            Some(state) => apply_delta(state, &alpha, &key, v_new, beta),
            None => {
                self.state = Some(key.iter().map(|k| v_new * k).collect());
            }
        }

        self.prev_query = Some(query.to_string());

        Ok(DeltaUpdate {
            topic_shift,
            alpha,
            beta,
        })
    }
}

/// The Delta-Rule recurrence on an existing state:
/// decay by α, remove the old value along the key, write the new one.
fn apply_delta(state: &mut [f64], alpha: &Gate, key: &[f64], v_new: f64, beta: f64) {
    // S ← α ⊙ S
    alpha.apply(state);
    // S ← S − α ⊙ (β · (S · k) · k)
    let v_old: f64 = state.iter().zip(key.iter()).map(|(s, k)| s * k).sum();
    let removal = alpha.scaled(&key.iter().map(|k| beta * v_old * k).collect::<Vec<_>>());
    for (s, r) in state.iter_mut().zip(removal.iter()) {
        *s -= r;
    }
    // S ← S + β · v_new · k
    for (s, k) in state.iter_mut().zip(key.iter()) {
        *s += beta * v_new * k;
    }
}

/// Scalar projection of the mean value embedding along the key.
fn mean_projection(values: &[Vec<f32>], key: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let dim = key.len();
    let mut mean = vec![0.0f64; dim];
    for value in values {
        for (m, v) in mean.iter_mut().zip(value.iter()) {
            *m += *v as f64;
        }
    }
    let count = values.len() as f64;
    mean.iter()
        .zip(key.iter())
        .map(|(m, k)| (m / count) * k)
        .sum()
}
