//! Invariant checking for deterministic simulation testing.
//!
//! A `TreeModel` tracks what the tree must contain: the live contents seen by
//! readers, and the durable contents as of the last successful checkpoint.
//! After a crash and recovery the tree must match the durable contents
//! exactly.

use std::collections::BTreeMap;

use crate::tree::{GBTree, TreeError, U64Layout};

/// Expected tree contents.
#[derive(Debug, Default, Clone)]
pub struct TreeModel {
    live: BTreeMap<u64, u64>,
    durable: BTreeMap<u64, u64>,
}

impl TreeModel {
    /// Create an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: u64, value: u64) {
        self.live.insert(key, value);
    }

    pub fn remove(&mut self, key: u64) -> Option<u64> {
        self.live.remove(&key)
    }

    #[must_use]
    pub fn get(&self, key: u64) -> Option<u64> {
        self.live.get(&key).copied()
    }

    /// Entries with `from <= key < to`.
    #[must_use]
    pub fn range(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        if from >= to {
            return Vec::new();
        }
        self.live.range(from..to).map(|(&k, &v)| (k, v)).collect()
    }

    /// A checkpoint succeeded: everything live is now durable.
    pub fn checkpoint(&mut self) {
        self.durable.clone_from(&self.live);
    }

    /// The process crashed: only durable contents remain.
    pub fn crash(&mut self) {
        self.live.clone_from(&self.durable);
    }

    /// Every live entry in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<(u64, u64)> {
        self.live.iter().map(|(&k, &v)| (k, v)).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// An invariant violation detected during simulation.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    /// Description of the violation.
    pub description: String,
    /// Operation index where it was detected.
    pub operation_index: usize,
    /// Additional context.
    pub context: String,
}

/// Checker comparing a tree against its model.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    violations: Vec<InvariantViolation>,
}

impl InvariantChecker {
    /// Create a new invariant checker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    /// Get all violations.
    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    /// Check if any violations were detected.
    #[must_use]
    pub const fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Add a violation.
    pub fn add_violation(&mut self, violation: InvariantViolation) {
        self.violations.push(violation);
    }

    fn violation(&mut self, operation_index: usize, description: &str, context: String) {
        self.violations.push(InvariantViolation {
            description: description.to_string(),
            operation_index,
            context,
        });
    }

    /// A removed value must be the value the model held for the key.
    pub fn check_removed(
        &mut self,
        operation_index: usize,
        key: u64,
        expected: Option<u64>,
        actual: Option<u64>,
    ) {
        if expected != actual {
            self.violation(
                operation_index,
                "remove returned the wrong value",
                format!("key {key}: expected {expected:?}, got {actual:?}"),
            );
        }
    }

    /// A point lookup must agree with the model.
    pub fn check_get(
        &mut self,
        operation_index: usize,
        key: u64,
        expected: Option<u64>,
        actual: Option<u64>,
    ) {
        if expected != actual {
            self.violation(
                operation_index,
                "lookup disagrees with model",
                format!("key {key}: expected {expected:?}, got {actual:?}"),
            );
        }
    }

    /// A seek must return exactly the model's entries in the range, in
    /// order.
    pub fn check_seek(
        &mut self,
        operation_index: usize,
        tree: &GBTree<U64Layout>,
        model: &TreeModel,
        from: u64,
        to: u64,
    ) -> Result<(), TreeError> {
        let actual = tree.seek(&from, &to)?.collect::<Result<Vec<_>, _>>()?;
        let expected = model.range(from, to);
        if actual != expected {
            self.violation(
                operation_index,
                "seek disagrees with model",
                format!(
                    "range {from}..{to}: expected {} entries, got {}",
                    expected.len(),
                    actual.len()
                ),
            );
        }
        Ok(())
    }

    /// The full tree must match the model and pass the structural check.
    pub fn check_tree(
        &mut self,
        operation_index: usize,
        tree: &GBTree<U64Layout>,
        model: &TreeModel,
    ) -> Result<(), TreeError> {
        let actual = tree.seek_all()?.collect::<Result<Vec<_>, _>>()?;
        let expected = model.entries();
        if actual != expected {
            let first_difference = actual
                .iter()
                .zip(&expected)
                .position(|(a, e)| a != e)
                .unwrap_or_else(|| actual.len().min(expected.len()));
            self.violation(
                operation_index,
                "tree contents disagree with model",
                format!(
                    "expected {} entries, got {}; first difference at position {first_difference}",
                    expected.len(),
                    actual.len()
                ),
            );
        }

        match tree.consistency_check() {
            Ok(report) if report.keys != expected.len() as u64 => self.violation(
                operation_index,
                "consistency check counted the wrong number of keys",
                format!("expected {}, counted {}", expected.len(), report.keys),
            ),
            Ok(_) => {}
            Err(TreeError::TreeCorruption(message)) => {
                self.violation(operation_index, "tree structure is corrupt", message);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_crash_restores_durable() {
        let mut model = TreeModel::new();
        model.put(1, 10);
        model.checkpoint();
        model.put(2, 20);
        model.remove(1);
        assert_eq!(model.entries(), vec![(2, 20)]);

        model.crash();
        assert_eq!(model.entries(), vec![(1, 10)]);
    }

    #[test]
    fn test_model_range_is_half_open() {
        let mut model = TreeModel::new();
        for key in 0..10 {
            model.put(key, key * 2);
        }
        assert_eq!(model.range(3, 6), vec![(3, 6), (4, 8), (5, 10)]);
        assert!(model.range(6, 3).is_empty());
        assert!(model.range(4, 4).is_empty());
    }

    #[test]
    fn test_checker_records_mismatch() {
        let mut checker = InvariantChecker::new();
        checker.check_get(0, 5, Some(1), Some(1));
        assert!(!checker.has_violations());
        checker.check_removed(1, 5, Some(1), None);
        assert_eq!(checker.violations().len(), 1);
        assert_eq!(checker.violations()[0].operation_index, 1);
    }
}
