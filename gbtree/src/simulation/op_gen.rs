//! Operation generator for deterministic simulation testing.
//!
//! Generates random but reproducible sequences of tree operations, including
//! checkpoints and crashes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for operation generation.
#[derive(Debug, Clone)]
pub struct OpGenConfig {
    /// Keys are drawn from `0..key_space`.
    pub key_space: u64,
    /// Relative weight of puts among data operations.
    pub put_weight: u32,
    /// Relative weight of removes among data operations.
    pub remove_weight: u32,
    /// Relative weight of point lookups among data operations.
    pub get_weight: u32,
    /// Relative weight of range seeks among data operations.
    pub seek_weight: u32,
    /// Probability of a checkpoint (0.0 - 1.0).
    pub checkpoint_rate: f64,
    /// Probability of a crash (0.0 - 1.0).
    pub crash_rate: f64,
    /// Probability of a checkpoint whose syncs fail, followed by a crash.
    pub failing_checkpoint_rate: f64,
}

impl Default for OpGenConfig {
    fn default() -> Self {
        Self {
            key_space: 512,
            put_weight: 6,
            remove_weight: 3,
            get_weight: 2,
            seek_weight: 1,
            checkpoint_rate: 0.02,
            crash_rate: 0.01,
            failing_checkpoint_rate: 0.0,
        }
    }
}

/// One step of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    Put { key: u64, value: u64 },
    Remove { key: u64 },
    Get { key: u64 },
    /// Seek `from <= key < to`.
    Seek { from: u64, to: u64 },
    Checkpoint,
    /// Power loss. With `write_back`, dirty cached pages reach the store
    /// unsynced first, so some of them survive the crash.
    Crash { write_back: bool },
    /// A checkpoint with failing syncs, then a crash.
    FailingCheckpoint,
}

/// Generates random tree operations.
#[derive(Debug)]
pub struct OpGenerator {
    rng: StdRng,
    config: OpGenConfig,
    generated: u64,
}

impl OpGenerator {
    /// Create a new generator with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, OpGenConfig::default())
    }

    /// Create a new generator with custom configuration.
    #[must_use]
    pub fn with_config(seed: u64, config: OpGenConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            config,
            generated: 0,
        }
    }

    /// Operations generated so far.
    #[must_use]
    pub const fn generated(&self) -> u64 {
        self.generated
    }

    /// Generate the next operation.
    pub fn next_op(&mut self) -> TreeOp {
        self.generated += 1;

        let roll = self.rng.random::<f64>();
        let config = &self.config;
        if roll < config.failing_checkpoint_rate {
            return TreeOp::FailingCheckpoint;
        }
        if roll < config.failing_checkpoint_rate + config.crash_rate {
            return TreeOp::Crash {
                write_back: self.rng.random_bool(0.5),
            };
        }
        if roll < config.failing_checkpoint_rate + config.crash_rate + config.checkpoint_rate {
            return TreeOp::Checkpoint;
        }

        let key_space = config.key_space.max(1);
        let total = (config.put_weight
            + config.remove_weight
            + config.get_weight
            + config.seek_weight)
            .max(1);
        let pick = self.rng.random_range(0..total);
        let key = self.rng.random_range(0..key_space);

        if pick < config.put_weight {
            TreeOp::Put {
                key,
                value: self.rng.random(),
            }
        } else if pick < config.put_weight + config.remove_weight {
            TreeOp::Remove { key }
        } else if pick < config.put_weight + config.remove_weight + config.get_weight {
            TreeOp::Get { key }
        } else {
            let span = self.rng.random_range(0..=key_space / 4);
            TreeOp::Seek {
                from: key,
                to: key.saturating_add(span),
            }
        }
    }

    /// Generate `count` operations.
    pub fn generate_batch(&mut self, count: usize) -> Vec<TreeOp> {
        (0..count).map(|_| self.next_op()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_deterministic() {
        let first = OpGenerator::new(42).generate_batch(200);
        let second = OpGenerator::new(42).generate_batch(200);
        assert_eq!(first, second);
    }

    #[test]
    fn test_generator_respects_key_space() {
        let config = OpGenConfig {
            key_space: 16,
            ..OpGenConfig::default()
        };
        let mut generator = OpGenerator::with_config(7, config);
        for op in generator.generate_batch(500) {
            match op {
                TreeOp::Put { key, .. } | TreeOp::Remove { key } | TreeOp::Get { key } => {
                    assert!(key < 16);
                }
                TreeOp::Seek { from, to } => assert!(from < 16 && from <= to),
                _ => {}
            }
        }
        assert_eq!(generator.generated(), 500);
    }

    #[test]
    fn test_generator_without_faults_never_crashes() {
        let config = OpGenConfig {
            crash_rate: 0.0,
            checkpoint_rate: 0.0,
            ..OpGenConfig::default()
        };
        let mut generator = OpGenerator::with_config(3, config);
        assert!(generator.generate_batch(1000).iter().all(|op| !matches!(
            op,
            TreeOp::Crash { .. } | TreeOp::Checkpoint | TreeOp::FailingCheckpoint
        )));
    }
}
