//! Generations: the logical clock of a tree.
//!
//! The stable generation is the last one made durable by a checkpoint; the
//! unstable generation is the one writers stamp onto everything they touch.
//! Generations strictly between the two belong to sessions that crashed before
//! checkpointing.

use std::sync::atomic::{AtomicU64, Ordering};

/// A generation number.
pub type Generation = u64;

/// Generation of the initial tree content.
pub const INITIAL_STABLE_GENERATION: Generation = 1;

/// Unstable generation of a freshly created tree.
pub const INITIAL_UNSTABLE_GENERATION: Generation = 2;

/// Largest representable generation; both halves of a pair share one word.
pub const MAX_GENERATION: Generation = 0xFFFF_FFFF;

/// A consistent (stable, unstable) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generations {
    /// Last generation made durable by a checkpoint.
    pub stable: Generation,
    /// Generation stamped by writers in the current session.
    pub unstable: Generation,
}

impl Generations {
    /// Create a generation pair.
    #[must_use]
    pub const fn new(stable: Generation, unstable: Generation) -> Self {
        Self { stable, unstable }
    }

    /// Generations of a freshly created tree.
    #[must_use]
    pub const fn initial() -> Self {
        Self::new(INITIAL_STABLE_GENERATION, INITIAL_UNSTABLE_GENERATION)
    }

    /// True if `generation` was written by a session that crashed.
    #[must_use]
    pub const fn is_crashed(self, generation: Generation) -> bool {
        generation > self.stable && generation < self.unstable
    }

    /// True if content stamped with `generation` is covered by the durable state.
    #[must_use]
    pub const fn is_stable(self, generation: Generation) -> bool {
        generation <= self.stable
    }

    /// The pair after a successful checkpoint.
    #[must_use]
    pub const fn after_checkpoint(self) -> Self {
        Self::new(self.unstable, self.unstable + 1)
    }

    /// The pair used when reopening after an unclean shutdown: everything the
    /// crashed session wrote falls into the crash gap.
    #[must_use]
    pub const fn after_crash(self) -> Self {
        Self::new(self.stable, self.unstable + 1)
    }

    const fn pack(self) -> u64 {
        (self.stable << 32) | (self.unstable & 0xFFFF_FFFF)
    }

    const fn unpack(word: u64) -> Self {
        Self::new(word >> 32, word & 0xFFFF_FFFF)
    }
}

/// Generations shared between the writer and concurrent readers.
///
/// Both halves live in one word so readers never see a torn pair.
#[derive(Debug)]
pub struct SharedGenerations(AtomicU64);

impl SharedGenerations {
    /// Create shared generations.
    #[must_use]
    pub const fn new(generations: Generations) -> Self {
        Self(AtomicU64::new(generations.pack()))
    }

    /// Current pair.
    #[must_use]
    pub fn load(&self) -> Generations {
        Generations::unpack(self.0.load(Ordering::Acquire))
    }

    /// Publish a new pair.
    pub fn store(&self, generations: Generations) {
        self.0.store(generations.pack(), Ordering::Release);
    }
}
