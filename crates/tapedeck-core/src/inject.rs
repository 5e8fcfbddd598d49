//! Deterministic fault injection for replayed exchanges.
//!
//! A seeded PRNG draws once per exchange. Under the configured error rate the
//! draw picks one of two failure modes: truncate the chunk stream and fail
//! the following expect, or stream everything and synthesize a non-zero
//! process exit. Same seed, same faults — reproducible chaos.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Outcome of the per-exchange fault draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPlan {
    /// No fault; stream every chunk.
    None,
    /// Stream only the first `prefix_chunks`, then fail expect as a
    /// simulated timeout.
    TimeoutAfter { prefix_chunks: usize, total: usize },
    /// Stream all chunks, then synthesize a process exit.
    ExitWith { code: i32 },
}

/// Per-session fault source.
#[derive(Debug)]
pub struct FaultInjector {
    rng: StdRng,
    error_rate: u8,
}

impl FaultInjector {
    /// Build an injector; rates above 100 saturate.
    #[must_use]
    pub fn new(seed: u64, error_rate: u8) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            error_rate: error_rate.min(100),
        }
    }

    /// Draw the fault plan for the next exchange with `total_chunks` chunks.
    pub fn draw(&mut self, total_chunks: usize) -> FaultPlan {
        if self.error_rate == 0 {
            return FaultPlan::None;
        }
        let roll: u8 = self.rng.gen_range(0..100);
        if roll >= self.error_rate {
            return FaultPlan::None;
        }
        if self.rng.gen_bool(0.5) {
            FaultPlan::TimeoutAfter {
                prefix_chunks: total_chunks / 2,
                total: total_chunks,
            }
        } else {
            FaultPlan::ExitWith {
                code: i32::from(self.rng.gen_range(1..=125u8)),
            }
        }
    }
}
