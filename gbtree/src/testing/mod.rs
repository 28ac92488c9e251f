use std::sync::{Arc, Once};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TreeConfig;
use crate::storage::{MemoryStore, PageStore};

/// Install a log subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `gbtree=debug`. Safe to call from every
/// test.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "gbtree=debug".into()))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A seeded in-memory store, as both its concrete type (for crash
/// simulation) and a trait object (for the tree).
pub fn new_memory_store(seed: u64) -> (Arc<MemoryStore>, Arc<dyn PageStore>) {
    let memory = Arc::new(MemoryStore::new(seed));
    let store: Arc<dyn PageStore> = Arc::clone(&memory) as Arc<dyn PageStore>;
    (memory, store)
}

/// Configuration with at most four keys per node, so a few dozen keys build
/// a multi-level tree.
pub fn small_node_config() -> TreeConfig {
    TreeConfig {
        max_node_keys: Some(4),
        ..TreeConfig::default()
    }
}
