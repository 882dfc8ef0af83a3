//! The tree-wide generation pair.
//!
//! Stable and unstable generations are packed into one `u64` so readers can
//! load both with a single atomic read.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lowest generation any pointer or node may carry. Zero means "empty".
pub const MIN_GENERATION: u32 = 1;

/// A `(stable, unstable)` generation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub stable: u32,
    pub unstable: u32,
}

impl Generation {
    #[must_use]
    pub const fn new(stable: u32, unstable: u32) -> Self {
        Self { stable, unstable }
    }

    #[must_use]
    pub const fn pack(self) -> u64 {
        ((self.stable as u64) << 32) | self.unstable as u64
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // the halves are u32 by construction
    pub const fn unpack(packed: u64) -> Self {
        Self {
            stable: (packed >> 32) as u32,
            unstable: packed as u32,
        }
    }

    /// The generation after a checkpoint: unstable becomes stable.
    #[must_use]
    pub const fn checkpointed(self) -> Self {
        Self {
            stable: self.unstable,
            unstable: self.unstable + 1,
        }
    }

    /// Whether `generation` lies in the crash gap, strictly between stable
    /// and unstable.
    #[must_use]
    pub const fn is_crash_generation(self, generation: u32) -> bool {
        generation > self.stable && generation < self.unstable
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stable={} unstable={}", self.stable, self.unstable)
    }
}

/// Atomically published generation pair.
#[derive(Debug)]
pub struct AtomicGeneration(AtomicU64);

impl AtomicGeneration {
    #[must_use]
    pub const fn new(generation: Generation) -> Self {
        Self(AtomicU64::new(generation.pack()))
    }

    pub fn load(&self) -> Generation {
        Generation::unpack(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, generation: Generation) {
        debug_assert!(generation.stable < generation.unstable);
        self.0.store(generation.pack(), Ordering::Release);
    }
}
