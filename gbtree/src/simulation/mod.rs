//! Deterministic Simulation Testing (DST) infrastructure.
//!
//! This module provides tools for testing the tree with:
//! - In-memory storage with crash and fault injection
//! - Reproducible random operation generation
//! - A model of the expected contents, checked after every operation
//!
//! # Design Principles
//!
//! 1. All I/O goes through a `PageStore` and can be simulated
//! 2. All randomness is seeded for reproducibility
//! 3. Crashes can drop, keep, or tear any unsynced write
//! 4. Given the same seed, the operation sequence is identical
//!
//! # Usage
//!
//! ```ignore
//! use simulation::{Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345) // seed
//!     .with_crash_rate(0.02)
//!     .with_survival_rate(0.5);
//!
//! let mut sim = Simulator::new(config);
//! let result = sim.run(1000); // Run 1000 operations
//!
//! assert!(result.invariant_violations.is_empty());
//! ```

mod e2e_tests;
mod invariants;
mod op_gen;
mod simulator;

pub use invariants::{InvariantChecker, InvariantViolation, TreeModel};
pub use op_gen::{OpGenConfig, OpGenerator, TreeOp};
pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
