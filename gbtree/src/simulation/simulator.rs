//! Main simulator harness for deterministic simulation testing.
//!
//! Drives a tree on a `MemoryStore` with generated operations, crashes it at
//! random points, recovers it, and compares it against a `TreeModel` after
//! every step.

use std::sync::Arc;

use crate::config::TreeConfig;
use crate::storage::{CrashMode, FaultConfig, MemoryStore, PageStore};
use crate::tree::{GBTree, ImmediateCollector, TreeError, U64Layout};

use super::invariants::{InvariantChecker, InvariantViolation, TreeModel};
use super::op_gen::{OpGenConfig, OpGenerator, TreeOp};

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Operation generation configuration.
    pub op_config: OpGenConfig,
    /// Maximum keys per node; small values build deep trees quickly.
    pub max_node_keys: Option<usize>,
    /// Page cache capacity; small values force evictions mid-transaction.
    pub page_cache_pages: usize,
    /// Probability that an unsynced write survives a crash.
    pub survival_rate: f64,
}

impl SimulatorConfig {
    /// Create a new simulator config with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            op_config: OpGenConfig::default(),
            max_node_keys: Some(4),
            page_cache_pages: 64,
            survival_rate: 0.5,
        }
    }

    /// Set the operation configuration.
    #[must_use]
    pub const fn with_op_config(mut self, config: OpGenConfig) -> Self {
        self.op_config = config;
        self
    }

    /// Set the crash probability per operation.
    #[must_use]
    pub const fn with_crash_rate(mut self, rate: f64) -> Self {
        self.op_config.crash_rate = rate;
        self
    }

    /// Set the probability of a checkpoint with failing syncs.
    #[must_use]
    pub const fn with_failing_checkpoint_rate(mut self, rate: f64) -> Self {
        self.op_config.failing_checkpoint_rate = rate;
        self
    }

    /// Set the probability that an unsynced write survives a crash.
    #[must_use]
    pub const fn with_survival_rate(mut self, rate: f64) -> Self {
        self.survival_rate = rate;
        self
    }

    fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            max_node_keys: self.max_node_keys,
            page_cache_pages: self.page_cache_pages,
            ..TreeConfig::default()
        }
    }
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    /// Number of operations executed.
    pub operations: u64,
    /// Number of successful checkpoints.
    pub checkpoints: u64,
    /// Number of crash and recovery cycles.
    pub crashes: u64,
    /// Invariant violations detected.
    pub invariant_violations: Vec<InvariantViolation>,
    /// Whether the simulation ran every operation without an unexpected
    /// error.
    pub completed_successfully: bool,
    /// Error message if simulation failed.
    pub error: Option<String>,
}

impl SimulationResult {
    /// Check if the simulation passed (no invariant violations).
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.completed_successfully && self.invariant_violations.is_empty()
    }
}

/// The main simulator harness.
pub struct Simulator {
    config: SimulatorConfig,
    generator: OpGenerator,
    model: TreeModel,
    checker: InvariantChecker,
    memory: Arc<MemoryStore>,
    store: Arc<dyn PageStore>,
    tree: Option<GBTree<U64Layout>>,
    operations: u64,
    checkpoints: u64,
    crashes: u64,
}

impl Simulator {
    /// Create a new simulator with the given configuration.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let generator = OpGenerator::with_config(config.seed, config.op_config.clone());
        let memory = Arc::new(MemoryStore::new(config.seed));
        let store: Arc<dyn PageStore> = Arc::clone(&memory) as Arc<dyn PageStore>;
        Self {
            config,
            generator,
            model: TreeModel::new(),
            checker: InvariantChecker::new(),
            memory,
            store,
            tree: None,
            operations: 0,
            checkpoints: 0,
            crashes: 0,
        }
    }

    /// Run `op_count` generated operations against a fresh tree, then verify
    /// the final contents.
    pub fn run(&mut self, op_count: usize) -> SimulationResult {
        let outcome = self.run_ops(op_count);
        if let Err(e) = &outcome {
            tracing::error!(
                seed = self.config.seed,
                operations = self.operations,
                error = %e,
                "simulation failed"
            );
        }

        SimulationResult {
            seed: self.config.seed,
            operations: self.operations,
            checkpoints: self.checkpoints,
            crashes: self.crashes,
            invariant_violations: self.checker.violations().to_vec(),
            completed_successfully: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    fn run_ops(&mut self, op_count: usize) -> Result<(), TreeError> {
        let tree = GBTree::create(Arc::clone(&self.store), U64Layout, self.config.tree_config())?;
        self.tree = Some(tree);

        for index in 0..op_count {
            let op = self.generator.next_op();
            self.apply(index, op)?;
            self.operations += 1;
        }

        let tree = self.tree.as_ref().ok_or(TreeError::Poisoned)?;
        self.checker.check_tree(op_count, tree, &self.model)
    }

    fn tree(&self) -> Result<&GBTree<U64Layout>, TreeError> {
        self.tree.as_ref().ok_or(TreeError::Poisoned)
    }

    fn apply(&mut self, index: usize, op: TreeOp) -> Result<(), TreeError> {
        match op {
            TreeOp::Put { key, value } => {
                self.tree()?.writer()?.put(key, value)?;
                self.model.put(key, value);
            }
            TreeOp::Remove { key } => {
                let removed = self.tree()?.writer()?.remove(&key)?;
                let expected = self.model.remove(key);
                self.checker.check_removed(index, key, expected, removed);
            }
            TreeOp::Get { key } => {
                let found = self.tree()?.get(&key)?;
                self.checker.check_get(index, key, self.model.get(key), found);
            }
            TreeOp::Seek { from, to } => {
                let tree = self.tree.as_ref().ok_or(TreeError::Poisoned)?;
                self.checker.check_seek(index, tree, &self.model, from, to)?;
            }
            TreeOp::Checkpoint => {
                self.tree()?.checkpoint()?;
                self.model.checkpoint();
                self.checkpoints += 1;
            }
            TreeOp::Crash { write_back } => self.crash_and_recover(index, write_back)?,
            TreeOp::FailingCheckpoint => self.failing_checkpoint(index)?,
        }
        Ok(())
    }

    /// A checkpoint whose syncs fail must poison the tree; the following
    /// crash must recover the previous checkpoint.
    fn failing_checkpoint(&mut self, index: usize) -> Result<(), TreeError> {
        self.memory.set_fault_config(FaultConfig::failing_syncs());
        let result = self.tree()?.checkpoint();
        self.memory.set_fault_config(FaultConfig::no_faults());

        if result.is_ok() {
            self.checker.add_violation(InvariantViolation {
                description: "checkpoint succeeded although syncs fail".to_string(),
                operation_index: index,
                context: String::new(),
            });
        } else if !matches!(self.tree()?.writer(), Err(TreeError::Poisoned)) {
            self.checker.add_violation(InvariantViolation {
                description: "failed checkpoint did not poison the tree".to_string(),
                operation_index: index,
                context: String::new(),
            });
        }
        self.crash_and_recover(index, false)
    }

    fn crash_and_recover(&mut self, index: usize, write_back: bool) -> Result<(), TreeError> {
        if let Some(tree) = self.tree.take() {
            if write_back {
                tree.inner().cache.write_back()?;
            }
        }
        let report = self.memory.crash(CrashMode::Partial {
            survival_rate: self.config.survival_rate,
        });
        self.crashes += 1;
        self.model.crash();
        tracing::debug!(
            index,
            persisted = report.persisted.len(),
            dropped = report.dropped.len(),
            torn = ?report.torn,
            "simulated crash"
        );

        let tree = GBTree::open(
            Arc::clone(&self.store),
            U64Layout,
            self.config.tree_config(),
            &ImmediateCollector,
        )?;
        self.checker.check_tree(index, &tree, &self.model)?;
        self.tree = Some(tree);
        Ok(())
    }

    /// Get the model the tree is compared against.
    #[must_use]
    pub const fn model(&self) -> &TreeModel {
        &self.model
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("seed", &self.config.seed)
            .field("operations", &self.operations)
            .field("crashes", &self.crashes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::init_test_logging;

    #[test]
    fn test_simulator_basic() {
        init_test_logging();
        let mut simulator = Simulator::new(SimulatorConfig::new(12345));

        let result = simulator.run(500);

        assert!(result.passed(), "simulation failed: {:?}", result.error);
        assert_eq!(result.seed, 12345);
        assert_eq!(result.operations, 500);
    }

    #[test]
    fn test_simulator_without_crashes() {
        init_test_logging();
        let config = SimulatorConfig::new(777).with_crash_rate(0.0);
        let mut simulator = Simulator::new(config);

        let result = simulator.run(1000);

        assert!(result.passed(), "simulation failed: {:?}", result.error);
        assert_eq!(result.crashes, 0);
        assert!(!simulator.model().is_empty());
    }

    #[test]
    fn test_simulator_deterministic() {
        let mut first = Simulator::new(SimulatorConfig::new(4242).with_crash_rate(0.02));
        let mut second = Simulator::new(SimulatorConfig::new(4242).with_crash_rate(0.02));

        let a = first.run(400);
        let b = second.run(400);

        assert_eq!(a.checkpoints, b.checkpoints);
        assert_eq!(a.crashes, b.crashes);
        assert_eq!(first.model().entries(), second.model().entries());
    }

    #[test]
    fn test_simulator_survives_frequent_crashes() {
        init_test_logging();
        for seed in 0..8 {
            let config = SimulatorConfig::new(seed)
                .with_crash_rate(0.05)
                .with_survival_rate(0.7);
            let mut simulator = Simulator::new(config);

            let result = simulator.run(600);

            assert!(
                result.passed(),
                "seed {} failed: {:?} {:?}",
                result.seed,
                result.error,
                result.invariant_violations
            );
            assert!(result.crashes > 0, "seed {seed} never crashed");
        }
    }

    #[test]
    fn test_simulator_failing_checkpoints() {
        init_test_logging();
        let config = SimulatorConfig::new(31337)
            .with_crash_rate(0.0)
            .with_failing_checkpoint_rate(0.02);
        let mut simulator = Simulator::new(config);

        let result = simulator.run(800);

        assert!(result.passed(), "simulation failed: {:?}", result.error);
        assert!(result.crashes > 0);
    }

    #[test]
    #[ignore] // Long running test
    fn test_simulator_stress() {
        for seed in 0..64 {
            let config = SimulatorConfig::new(seed).with_crash_rate(0.02);
            let mut simulator = Simulator::new(config);
            let result = simulator.run(5_000);
            assert!(
                result.passed(),
                "seed {} failed: {:?} {:?}",
                result.seed,
                result.error,
                result.invariant_violations
            );
        }
    }
}
