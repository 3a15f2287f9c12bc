//! Explicit random state and the per-rank seed policy

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Fallback seed when a distributed run omits one; substituted with a
/// warning rather than failing the run.
pub const DEFAULT_SEED: u64 = 42;

/// Explicit random state threaded through every component that draws
/// randomness; no global seeding anywhere.
#[derive(Debug, Clone)]
pub struct RngState {
    seed: u64,
    rng: StdRng,
}

impl RngState {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Resolve the configured base seed into this process's state.
    ///
    /// Multi-process runs derive `base + rank` so every worker draws a
    /// different but per-rank-reproducible stream; a missing seed in a
    /// multi-process run substitutes the default with a warning. In
    /// single-process mode an explicit seed (including 0) applies as-is,
    /// and a missing one leaves the state entropy-seeded.
    pub fn resolve(configured: Option<u64>, rank: usize, world_size: usize) -> Self {
        let base = match configured {
            Some(seed) => seed,
            None if world_size > 1 => {
                println!(
                    "warning: no seed configured for a {world_size}-process run, using {DEFAULT_SEED}"
                );
                DEFAULT_SEED
            }
            None => rand::random(),
        };
        let seed = if world_size > 1 {
            base + rank as u64
        } else {
            base
        };
        Self::from_seed(seed)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn uniform(&mut self, lo: f32, hi: f32) -> f32 {
        self.rng.gen_range(lo..hi)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Derive an independent stream for a sub-component.
    pub fn fork(&mut self, salt: u64) -> RngState {
        RngState::from_seed(self.seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(salt))
    }
}
