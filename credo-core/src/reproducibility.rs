//! Seed management for reproducible runs.
//!
//! The run seed is an explicit value, never process-wide state. Components
//! (shuffling, parameter init, dropout, data splitting) each draw their own
//! seed derived from it, so changing one component's consumption of random
//! numbers does not perturb the others.

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Component names used by the harness.
pub const SHUFFLE: &str = "shuffle";
pub const INIT: &str = "init";
pub const DROPOUT: &str = "dropout";
pub const SPLIT: &str = "split";

/// Derives per-component seeds from one global seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedManager {
    pub global_seed: u64,
}

impl SeedManager {
    pub fn new(global_seed: u64) -> Self {
        Self { global_seed }
    }

    /// Deterministic seed for `component`: the first eight bytes of
    /// `sha256(global_seed || component)`.
    pub fn seed_for(&self, component: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.global_seed.to_le_bytes());
        hasher.update(component.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }

    pub fn rng_for(&self, component: &str) -> StdRng {
        StdRng::seed_from_u64(self.seed_for(component))
    }
}
