//! Pacing policies for replayed chunks.
//!
//! With no policy configured, replay honors the recorded inter-chunk delays.
//! A scalar replaces every delay (zero makes replay effectively instant), a
//! range draws uniformly per chunk, and a callable computes the delay from
//! the chunk index and the recorded value.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::tape::LatencySpec;

/// Delay selection for one replayed chunk.
#[derive(Clone, Default)]
pub enum LatencyPolicy {
    /// Use each chunk's recorded `delayMs` verbatim.
    #[default]
    Recorded,
    /// Replace every delay with a fixed value (0 disables pacing delays).
    Fixed(u64),
    /// Draw uniformly from `[lo, hi]` per chunk.
    Uniform(u64, u64),
    /// Compute from `(chunk_index, recorded_delay_ms)`. Must be pure.
    Custom(Arc<dyn Fn(usize, u64) -> u64 + Send + Sync>),
}

impl LatencyPolicy {
    /// Policy from a tape's recorded default.
    #[must_use]
    pub fn from_spec(spec: Option<LatencySpec>) -> Self {
        match spec {
            None => Self::Recorded,
            Some(LatencySpec::Fixed(ms)) => Self::Fixed(ms),
            Some(LatencySpec::Range(lo, hi)) => Self::Uniform(lo, hi),
        }
    }

    /// Recorded timings, as captured.
    #[must_use]
    pub fn realistic() -> Self {
        Self::Recorded
    }

    /// Minimal pacing for fast test runs.
    #[must_use]
    pub fn fast() -> Self {
        Self::Fixed(0)
    }

    /// Sluggish-network simulation.
    #[must_use]
    pub fn slow() -> Self {
        Self::Uniform(50, 200)
    }

    /// Effective delay for one chunk.
    #[must_use]
    pub fn delay_ms(&self, chunk_index: usize, recorded_ms: u64, rng: &mut StdRng) -> u64 {
        match self {
            Self::Recorded => recorded_ms,
            Self::Fixed(ms) => *ms,
            Self::Uniform(lo, hi) => {
                if lo >= hi {
                    *lo
                } else {
                    rng.gen_range(*lo..=*hi)
                }
            }
            Self::Custom(f) => f(chunk_index, recorded_ms),
        }
    }
}

impl std::fmt::Debug for LatencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recorded => f.write_str("Recorded"),
            Self::Fixed(ms) => write!(f, "Fixed({ms})"),
            Self::Uniform(lo, hi) => write!(f, "Uniform({lo}, {hi})"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
