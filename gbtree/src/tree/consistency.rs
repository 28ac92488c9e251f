//! Structural walk of a tree.
//!
//! Used by recovery cleanup to find reachable pages and by
//! `GBTree::consistency_check`. The walk verifies:
//!
//! - No page is reachable twice (no cycles, no shared children)
//! - Every node decodes and is no newer than the pointer that reached it
//! - Keys are strictly ascending and lie within the separator bounds of
//!   their subtree
//! - All leaves sit at the same depth
//! - The leaf chain visits exactly the leaves found by descent, in order, and
//!   ends at the last one

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::storage::PageId;
use crate::tree::engine::{MAX_TREE_HEIGHT, Root, TreeInner};
use crate::tree::error::TreeError;
use crate::tree::generation::{Generation, Generations};
use crate::tree::layout::Layout;
use crate::tree::node::{self, Node};

/// Summary of a consistency check.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Levels in the tree.
    pub height: usize,
    /// Internal nodes visited.
    pub internal_nodes: usize,
    /// Leaves visited.
    pub leaves: usize,
    /// Keys stored in leaves.
    pub keys: u64,
    /// Pages released and not yet reused.
    pub free_pages: usize,
    /// One past the highest allocated page.
    pub last_id: PageId,
}

/// Pages found by a successful walk.
#[derive(Debug, Default)]
pub(crate) struct TreeScan {
    /// Every reachable node, in visit order.
    pub reachable: Vec<PageId>,
    pub height: usize,
    pub internal_nodes: usize,
    pub leaves: usize,
    pub keys: u64,
}

struct Visit<K> {
    page_id: PageId,
    pointer_generation: Generation,
    depth: usize,
    low: Option<K>,
    high: Option<K>,
}

fn corruption(message: String) -> TreeError {
    TreeError::TreeCorruption(message)
}

/// Walk every node reachable from `root` as seen with `generations`.
pub(crate) fn scan_tree<L: Layout>(
    tree: &TreeInner<L>,
    generations: Generations,
    root: Root,
) -> Result<TreeScan, TreeError> {
    let layout = &tree.layout;
    let mut scan = TreeScan::default();
    let mut seen = HashSet::new();
    let mut leaves: Vec<(PageId, Option<PageId>)> = Vec::new();
    let mut leaf_depth = None;
    let mut stack = vec![Visit::<L::Key> {
        page_id: root.id,
        pointer_generation: root.generation,
        depth: 1,
        low: None,
        high: None,
    }];

    while let Some(visit) = stack.pop() {
        let page_id = visit.page_id;
        if !seen.insert(page_id) {
            return Err(corruption(format!("page {page_id} is reachable twice")));
        }
        if visit.depth > MAX_TREE_HEIGHT {
            return Err(corruption(format!(
                "page {page_id} is deeper than {MAX_TREE_HEIGHT} levels"
            )));
        }
        scan.reachable.push(page_id);

        let node = {
            let page = tree.cache.read(page_id)?;
            node::decode(&page, layout, generations).map_err(|e| {
                corruption(format!(
                    "page {page_id} does not decode: {}",
                    e.into_reason(node::peek_generation(&page))
                ))
            })?
        };
        if node.generation() > visit.pointer_generation {
            return Err(corruption(format!(
                "page {page_id} has generation {} but its pointer has generation {}",
                node.generation(),
                visit.pointer_generation
            )));
        }

        match node {
            Node::Leaf(leaf) => {
                match leaf_depth {
                    None => leaf_depth = Some(visit.depth),
                    Some(depth) if depth != visit.depth => {
                        return Err(corruption(format!(
                            "leaf {page_id} at depth {} but other leaves at depth {depth}",
                            visit.depth
                        )));
                    }
                    Some(_) => {}
                }
                let keys: Vec<&L::Key> = leaf.entries.iter().map(|(key, _)| key).collect();
                check_keys(layout, page_id, &keys, visit.low.as_ref(), visit.high.as_ref())?;
                scan.leaves += 1;
                scan.keys += leaf.entries.len() as u64;
                leaves.push((page_id, leaf.successor.map(|s| s.page_id)));
            }
            Node::Internal(internal) => {
                let keys: Vec<&L::Key> = internal.keys.iter().collect();
                check_keys(layout, page_id, &keys, visit.low.as_ref(), visit.high.as_ref())?;
                scan.internal_nodes += 1;

                // Pushed right to left so leaves are visited in key order.
                for (index, child) in internal.children.iter().enumerate().rev() {
                    let low = if index == 0 {
                        visit.low.clone()
                    } else {
                        internal.keys.get(index - 1).cloned()
                    };
                    let high = if index == internal.keys.len() {
                        visit.high.clone()
                    } else {
                        internal.keys.get(index).cloned()
                    };
                    stack.push(Visit {
                        page_id: child.page_id,
                        pointer_generation: child.generation,
                        depth: visit.depth + 1,
                        low,
                        high,
                    });
                }
            }
        }
    }

    for window in leaves.windows(2) {
        let (page_id, successor) = window[0];
        let (next, _) = window[1];
        if successor != Some(next) {
            return Err(corruption(format!(
                "leaf chain diverges at page {page_id}: successor {successor:?}, expected {next}"
            )));
        }
    }
    if let Some(&(page_id, Some(successor))) = leaves.last() {
        return Err(corruption(format!(
            "leaf chain does not end at the last leaf {page_id}: successor {successor}"
        )));
    }

    scan.height = leaf_depth.unwrap_or(0);
    Ok(scan)
}

/// Every leaf of the tree in key order, decoded.
#[cfg(test)]
pub(crate) fn leaves<L: Layout>(
    tree: &TreeInner<L>,
) -> Vec<(PageId, node::LeafNode<L::Key, L::Value>)> {
    let generations = tree.generations();
    let scan = scan_tree(tree, generations, tree.root()).expect("scan");
    scan.reachable
        .into_iter()
        .filter_map(|page_id| {
            let page = tree.cache.read(page_id).expect("read");
            match node::decode(&page, &tree.layout, generations).expect("decode") {
                Node::Leaf(leaf) => Some((page_id, leaf)),
                Node::Internal(_) => None,
            }
        })
        .collect()
}

fn check_keys<L: Layout>(
    layout: &L,
    page_id: PageId,
    keys: &[&L::Key],
    low: Option<&L::Key>,
    high: Option<&L::Key>,
) -> Result<(), TreeError> {
    for pair in keys.windows(2) {
        if layout.compare(pair[0], pair[1]) != Ordering::Less {
            return Err(corruption(format!(
                "keys out of order in page {page_id}: {:?} before {:?}",
                pair[0], pair[1]
            )));
        }
    }
    if let (Some(low), Some(first)) = (low, keys.first()) {
        if layout.compare(first, low) == Ordering::Less {
            return Err(corruption(format!(
                "key {first:?} in page {page_id} is below its separator {low:?}"
            )));
        }
    }
    if let (Some(high), Some(last)) = (high, keys.last()) {
        if layout.compare(last, high) != Ordering::Less {
            return Err(corruption(format!(
                "key {last:?} in page {page_id} is not below its separator {high:?}"
            )));
        }
    }
    Ok(())
}

/// Verify the whole tree under the writer lease.
pub(crate) fn check<L: Layout>(tree: &TreeInner<L>) -> Result<ConsistencyReport, TreeError> {
    tree.ensure_recovered()?;
    let state = tree.lock_writer()?;
    let generations = tree.generations();
    let scan = scan_tree(tree, generations, tree.root())?;

    for &page_id in &scan.reachable {
        if state.free_list.contains(page_id) {
            return Err(corruption(format!("page {page_id} is both reachable and free")));
        }
        if page_id >= state.last_id {
            return Err(corruption(format!(
                "page {page_id} is beyond the last allocated page {}",
                state.last_id
            )));
        }
    }

    tracing::debug!(
        height = scan.height,
        leaves = scan.leaves,
        keys = scan.keys,
        "consistency check passed"
    );
    Ok(ConsistencyReport {
        height: scan.height,
        internal_nodes: scan.internal_nodes,
        leaves: scan.leaves,
        keys: scan.keys,
        free_pages: state.free_list.len(),
        last_id: state.last_id,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::TreeConfig;
    use crate::storage::{MemoryStore, PageStore};
    use crate::testing::small_node_config;
    use crate::tree::engine::GBTree;
    use crate::tree::error::TreeError;
    use crate::tree::layout::U64Layout;
    use crate::tree::node;

    use super::leaves;

    fn tree_with(keys: impl IntoIterator<Item = u64>, config: TreeConfig) -> GBTree<U64Layout> {
        let store: Arc<dyn PageStore> = Arc::new(MemoryStore::new(11));
        let tree = GBTree::create(store, U64Layout, config).expect("create");
        {
            let mut writer = tree.writer().expect("writer");
            for key in keys {
                writer.put(key, key).expect("put");
            }
        }
        tree
    }

    #[test]
    fn test_empty_tree_is_consistent() {
        let tree = tree_with([], TreeConfig::default());
        let report = tree.consistency_check().expect("consistent");
        assert_eq!(report.height, 1);
        assert_eq!(report.leaves, 1);
        assert_eq!(report.keys, 0);
    }

    #[test]
    fn test_multi_level_tree_is_consistent() {
        let tree = tree_with((0..500).rev(), small_node_config());
        let report = tree.consistency_check().expect("consistent");
        assert_eq!(report.keys, 500);
        assert!(report.height >= 3);
        assert_eq!(report.height, tree.height());
        assert!(report.internal_nodes > 0);
    }

    #[test]
    fn test_check_blocks_while_writer_held() {
        let config = TreeConfig {
            writer_lock_timeout: std::time::Duration::from_millis(20),
            ..TreeConfig::default()
        };
        let tree = tree_with([1, 2, 3], config);
        let writer = tree.writer().expect("writer");
        assert!(matches!(
            tree.consistency_check(),
            Err(TreeError::WriterLockTimeout(_))
        ));
        drop(writer);
        tree.consistency_check().expect("consistent");
    }

    #[test]
    fn test_check_reports_shared_child() {
        let tree = tree_with(0..200, small_node_config());
        let inner = tree.inner();
        let first_leaf = leaves(inner)[0].0;
        {
            let mut root = inner.cache.write(inner.root().id).expect("write");
            node::write_child_pointer(&mut root, 1, first_leaf, inner.generations());
        }

        match tree.consistency_check() {
            Err(TreeError::TreeCorruption(message)) => {
                assert!(message.contains("reachable twice"), "{message}");
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_check_reports_diverging_leaf_chain() {
        let tree = tree_with(0..200, small_node_config());
        let inner = tree.inner();
        let leaf_ids: Vec<_> = leaves(inner).into_iter().map(|(id, _)| id).collect();
        {
            let mut page = inner.cache.write(leaf_ids[1]).expect("write");
            node::write_successor(&mut page, leaf_ids[3], inner.generations());
        }

        match tree.consistency_check() {
            Err(TreeError::TreeCorruption(message)) => {
                assert!(message.contains("leaf chain diverges"), "{message}");
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
