//! Single writer: insert, update, and remove.
//!
//! The writer descends from the root recording the path, edits the leaf
//! snapshot, and then settles the edit bottom-up: an overflowing node splits,
//! an underflowing one borrows from or merges with a sibling, an empty
//! internal root collapses. Nodes from the stable generation are never
//! modified; they are copied to a fresh page and the parent pointer is
//! redirected in place.
//!
//! # Write order
//!
//! Concurrent seekers never lose keys as long as every node receiving keys is
//! written before the node losing them, and keys moving left always land in a
//! freshly allocated page. Splits write the new right sibling first, merges
//! leave the absorbed node untouched until it is reused, and borrowing from a
//! right sibling copies that sibling.

use std::sync::atomic::Ordering;

use parking_lot::MutexGuard;

use crate::storage::PageId;
use crate::tree::engine::{MAX_TREE_HEIGHT, Root, TreeInner, WriterState};
use crate::tree::error::TreeError;
use crate::tree::generation::{Generation, Generations};
use crate::tree::layout::Layout;
use crate::tree::node::{
    self, CorruptReason, InternalNode, LeafNode, MAX_ENTRY_SIZE, Node, child_position,
};
use crate::tree::pointer::{NO_PAGE, TreePointer};

/// An internal node on the descent path and the child taken.
struct PathEntry<K> {
    page_id: PageId,
    node: InternalNode<K>,
    child_pos: usize,
}

enum Content<K, V> {
    Leaf {
        entries: Vec<(K, V)>,
        successor: PageId,
    },
    Internal {
        keys: Vec<K>,
        children: Vec<PageId>,
    },
}

/// New content for an existing node, not yet written.
struct Pending<K, V> {
    page_id: PageId,
    generation: Generation,
    content: Content<K, V>,
}

/// Parent content after a rebalance, if the rebalance changed anything.
type ParentUpdate<K> = Option<(Vec<K>, Vec<PageId>)>;

fn successor_id(successor: Option<TreePointer>) -> PageId {
    successor.map_or(NO_PAGE, |pointer| pointer.page_id)
}

fn child_ids(children: &[TreePointer]) -> Vec<PageId> {
    children.iter().map(|child| child.page_id).collect()
}

fn broken(message: &str) -> TreeError {
    TreeError::TreeCorruption(message.to_string())
}

/// Exclusive write access to a tree.
///
/// Holds the writer lease until dropped. Changes are visible to seekers
/// immediately and become durable at the next checkpoint.
pub struct Writer<'t, L: Layout> {
    tree: &'t TreeInner<L>,
    state: MutexGuard<'t, WriterState>,
}

impl<'t, L: Layout> Writer<'t, L> {
    pub(crate) fn new(tree: &'t TreeInner<L>) -> Result<Self, TreeError> {
        tree.ensure_writable()?;
        let state = tree.lock_writer()?;
        tree.ensure_writable()?;
        Ok(Self { tree, state })
    }

    /// Insert `key`, or replace its value if present.
    pub fn put(&mut self, key: L::Key, value: L::Value) -> Result<(), TreeError> {
        self.tree.ensure_writable()?;
        let size = node::leaf_entry_size(&self.tree.layout, &key, &value);
        if size > MAX_ENTRY_SIZE {
            return Err(TreeError::EntryTooLarge {
                size,
                max: MAX_ENTRY_SIZE,
            });
        }

        let (path, page_id, leaf) = self.descend(&key)?;
        let mut entries = leaf.entries;
        match self.search(&entries, &key) {
            Ok(index) => entries[index].1 = value,
            Err(index) => entries.insert(index, (key, value)),
        }
        self.settle(
            path,
            Pending {
                page_id,
                generation: leaf.generation,
                content: Content::Leaf {
                    entries,
                    successor: successor_id(leaf.successor),
                },
            },
        )
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>, TreeError> {
        self.tree.ensure_writable()?;
        let (path, page_id, leaf) = self.descend(key)?;
        let mut entries = leaf.entries;
        let Ok(index) = self.search(&entries, key) else {
            return Ok(None);
        };
        let (_, value) = entries.remove(index);
        self.settle(
            path,
            Pending {
                page_id,
                generation: leaf.generation,
                content: Content::Leaf {
                    entries,
                    successor: successor_id(leaf.successor),
                },
            },
        )?;
        Ok(Some(value))
    }

    /// Look up `key` as of this writer's changes.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>, TreeError> {
        let (_, _, leaf) = self.descend(key)?;
        Ok(self
            .search(&leaf.entries, key)
            .ok()
            .map(|index| leaf.entries[index].1.clone()))
    }

    /// Checkpoint without giving up the writer lease.
    pub fn checkpoint(&mut self) -> Result<(), TreeError> {
        self.tree.checkpoint(&mut self.state, false)
    }

    fn generations(&self) -> Generations {
        self.tree.generations()
    }

    fn search(&self, entries: &[(L::Key, L::Value)], key: &L::Key) -> Result<usize, usize> {
        entries.binary_search_by(|(k, _)| self.tree.layout.compare(k, key))
    }

    #[allow(clippy::type_complexity)]
    fn descend(
        &self,
        key: &L::Key,
    ) -> Result<(Vec<PathEntry<L::Key>>, PageId, LeafNode<L::Key, L::Value>), TreeError> {
        let generations = self.generations();
        let mut path = Vec::new();
        let mut page_id = self.tree.root().id;
        while path.len() < MAX_TREE_HEIGHT {
            match self.tree.read_node(page_id, generations)? {
                Node::Leaf(leaf) => return Ok((path, page_id, leaf)),
                Node::Internal(internal) => {
                    let child_pos = child_position(&self.tree.layout, &internal.keys, key);
                    let next = internal.children[child_pos].page_id;
                    path.push(PathEntry {
                        page_id,
                        node: internal,
                        child_pos,
                    });
                    page_id = next;
                }
            }
        }
        Err(broken("descent exceeded the maximum tree height"))
    }

    fn read_leaf(&self, page_id: PageId) -> Result<LeafNode<L::Key, L::Value>, TreeError> {
        match self.tree.read_node(page_id, self.generations())? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(TreeError::CorruptNode {
                page_id,
                reason: CorruptReason::UnexpectedKind { expected: "leaf" },
            }),
        }
    }

    fn read_internal(&self, page_id: PageId) -> Result<InternalNode<L::Key>, TreeError> {
        match self.tree.read_node(page_id, self.generations())? {
            Node::Internal(internal) => Ok(internal),
            Node::Leaf(_) => Err(TreeError::CorruptNode {
                page_id,
                reason: CorruptReason::UnexpectedKind {
                    expected: "internal",
                },
            }),
        }
    }

    fn allocate(&mut self) -> PageId {
        let stable = self.generations().stable;
        let state = &mut *self.state;
        state.free_list.take_reusable(stable).unwrap_or_else(|| {
            let id = state.last_id;
            state.last_id += 1;
            id
        })
    }

    fn release(&mut self, page_id: PageId) {
        let unstable = self.generations().unstable;
        self.state.free_list.release(page_id, unstable);
    }

    fn encode(
        &self,
        page_id: PageId,
        fresh: bool,
        content: &Content<L::Key, L::Value>,
    ) -> Result<(), TreeError> {
        let generation = self.generations().unstable;
        let mut page = if fresh {
            self.tree.cache.write_new(page_id)?
        } else {
            self.tree.cache.write(page_id)?
        };
        match content {
            Content::Leaf { entries, successor } => {
                node::encode_leaf(&mut page, &self.tree.layout, entries, generation, *successor);
            }
            Content::Internal { keys, children } => {
                node::encode_internal(&mut page, &self.tree.layout, keys, children, generation);
            }
        }
        Ok(())
    }

    /// Write a node, in place if it belongs to this generation, otherwise to
    /// a new page. Returns the page the node now lives on.
    fn write_node(&mut self, pending: &Pending<L::Key, L::Value>) -> Result<PageId, TreeError> {
        if pending.generation == self.generations().unstable {
            self.encode(pending.page_id, false, &pending.content)?;
            return Ok(pending.page_id);
        }
        let page_id = self.allocate();
        self.encode(page_id, true, &pending.content)?;
        self.release(pending.page_id);
        Ok(page_id)
    }

    /// Write a node to a new page, releasing the old one.
    fn copy_node(
        &mut self,
        old_id: PageId,
        content: &Content<L::Key, L::Value>,
    ) -> Result<PageId, TreeError> {
        let page_id = self.allocate();
        self.encode(page_id, true, content)?;
        self.release(old_id);
        Ok(page_id)
    }

    fn set_root(&self, page_id: PageId) {
        *self.tree.root.write() = Root {
            id: page_id,
            generation: self.generations().unstable,
        };
    }

    fn overflows(&self, pending: &Pending<L::Key, L::Value>) -> bool {
        let (layout, capacity) = (&self.tree.layout, &self.tree.capacity);
        match &pending.content {
            Content::Leaf { entries, .. } => !capacity.leaf_fits(layout, entries),
            Content::Internal { keys, .. } => !capacity.internal_fits(layout, keys),
        }
    }

    fn underflows(&self, pending: &Pending<L::Key, L::Value>) -> bool {
        let (layout, capacity) = (&self.tree.layout, &self.tree.capacity);
        match &pending.content {
            Content::Leaf { entries, .. } => capacity.leaf_underflows(layout, entries),
            Content::Internal { keys, .. } => capacity.internal_underflows(layout, keys),
        }
    }

    /// Write `pending` and propagate structural changes up `path`.
    fn settle(
        &mut self,
        mut path: Vec<PathEntry<L::Key>>,
        mut pending: Pending<L::Key, L::Value>,
    ) -> Result<(), TreeError> {
        loop {
            if self.overflows(&pending) {
                let (left, separator, right) = self.split(&path, pending)?;
                match path.pop() {
                    Some(parent) => {
                        pending = Self::insert_split(parent, left, separator, right);
                        continue;
                    }
                    None => return self.grow_root(left, separator, right),
                }
            }

            if path.is_empty() {
                if let Content::Internal { keys, children } = &pending.content {
                    if keys.is_empty() {
                        let child = children.first().copied().unwrap_or(NO_PAGE);
                        return self.collapse_root(pending.page_id, child);
                    }
                }
            } else if self.underflows(&pending) {
                if let Some((keys, children)) = self.rebalance(&path, &pending)? {
                    let Some(parent) = path.pop() else {
                        return Err(broken("rebalance without a parent"));
                    };
                    pending = Pending {
                        page_id: parent.page_id,
                        generation: parent.node.generation,
                        content: Content::Internal { keys, children },
                    };
                    continue;
                }
            }

            let page_id = self.write_node(&pending)?;
            if page_id == pending.page_id {
                return Ok(());
            }
            if matches!(pending.content, Content::Leaf { .. }) {
                if let Some(parent) = path.last() {
                    self.redirect_predecessor(&path, parent.child_pos, page_id)?;
                }
            }
            return match path.pop() {
                Some(parent) => self.redirect_child(&parent, page_id),
                None => {
                    self.set_root(page_id);
                    Ok(())
                }
            };
        }
    }

    fn redirect_child(&self, parent: &PathEntry<L::Key>, page_id: PageId) -> Result<(), TreeError> {
        let mut page = self.tree.cache.write(parent.page_id)?;
        node::write_child_pointer(&mut page, parent.child_pos, page_id, self.generations());
        Ok(())
    }

    /// Leaf immediately left of child `index` of the last node on `path`.
    fn predecessor(
        &self,
        path: &[PathEntry<L::Key>],
        index: usize,
    ) -> Result<Option<PageId>, TreeError> {
        let Some(parent) = path.last() else {
            return Ok(None);
        };
        if index > 0 {
            return Ok(Some(parent.node.children[index - 1].page_id));
        }

        let ancestors = &path[..path.len() - 1];
        let Some(entry) = ancestors.iter().rev().find(|entry| entry.child_pos > 0) else {
            return Ok(None);
        };
        let generations = self.generations();
        let mut page_id = entry.node.children[entry.child_pos - 1].page_id;
        for _ in 0..MAX_TREE_HEIGHT {
            match self.tree.read_node(page_id, generations)? {
                Node::Leaf(_) => return Ok(Some(page_id)),
                Node::Internal(internal) => {
                    page_id = internal
                        .children
                        .last()
                        .map_or(NO_PAGE, |child| child.page_id);
                }
            }
        }
        Err(broken("predecessor search exceeded the maximum tree height"))
    }

    /// Point the successor of the leaf left of child `index` at `page_id`.
    fn redirect_predecessor(
        &self,
        path: &[PathEntry<L::Key>],
        index: usize,
        page_id: PageId,
    ) -> Result<(), TreeError> {
        if let Some(predecessor) = self.predecessor(path, index)? {
            let mut page = self.tree.cache.write(predecessor)?;
            node::write_successor(&mut page, page_id, self.generations());
        }
        Ok(())
    }

    /// Split an overflowing node into two. Returns the left page, the
    /// separator, and the right page.
    fn split(
        &mut self,
        path: &[PathEntry<L::Key>],
        pending: Pending<L::Key, L::Value>,
    ) -> Result<(PageId, L::Key, PageId), TreeError> {
        let Pending {
            page_id,
            generation,
            content,
        } = pending;
        match content {
            Content::Leaf {
                mut entries,
                successor,
            } => {
                let at = self.tree.capacity.leaf_split_point(&self.tree.layout, &entries);
                let right_entries = entries.split_off(at);
                let separator = right_entries
                    .first()
                    .map(|(key, _)| key.clone())
                    .ok_or_else(|| broken("leaf split produced an empty right half"))?;

                let right_id = self.allocate();
                self.encode(
                    right_id,
                    true,
                    &Content::Leaf {
                        entries: right_entries,
                        successor,
                    },
                )?;
                let left = Pending {
                    page_id,
                    generation,
                    content: Content::Leaf {
                        entries,
                        successor: right_id,
                    },
                };
                let left_id = self.write_node(&left)?;
                if left_id != page_id {
                    if let Some(parent) = path.last() {
                        self.redirect_predecessor(path, parent.child_pos, left_id)?;
                    }
                }
                Ok((left_id, separator, right_id))
            }
            Content::Internal {
                mut keys,
                mut children,
            } => {
                let at = self.tree.capacity.internal_split_point(&self.tree.layout, &keys);
                let right_keys = keys.split_off(at + 1);
                let right_children = children.split_off(at + 1);
                let separator = keys
                    .pop()
                    .ok_or_else(|| broken("internal split without a separator"))?;

                let right_id = self.allocate();
                self.encode(
                    right_id,
                    true,
                    &Content::Internal {
                        keys: right_keys,
                        children: right_children,
                    },
                )?;
                let left_id = self.write_node(&Pending {
                    page_id,
                    generation,
                    content: Content::Internal { keys, children },
                })?;
                Ok((left_id, separator, right_id))
            }
        }
    }

    fn insert_split(
        parent: PathEntry<L::Key>,
        left: PageId,
        separator: L::Key,
        right: PageId,
    ) -> Pending<L::Key, L::Value> {
        let PathEntry {
            page_id,
            node,
            child_pos,
        } = parent;
        let mut keys = node.keys;
        let mut children = child_ids(&node.children);
        children[child_pos] = left;
        keys.insert(child_pos, separator);
        children.insert(child_pos + 1, right);
        Pending {
            page_id,
            generation: node.generation,
            content: Content::Internal { keys, children },
        }
    }

    fn grow_root(
        &mut self,
        left: PageId,
        separator: L::Key,
        right: PageId,
    ) -> Result<(), TreeError> {
        let root_id = self.allocate();
        self.encode(
            root_id,
            true,
            &Content::Internal {
                keys: vec![separator],
                children: vec![left, right],
            },
        )?;
        self.set_root(root_id);
        let height = self.tree.height.fetch_add(1, Ordering::Relaxed) + 1;
        self.tree.monitor.tree_growth(height);
        Ok(())
    }

    fn collapse_root(&mut self, root_id: PageId, child: PageId) -> Result<(), TreeError> {
        if child == NO_PAGE {
            return Err(broken("collapsing root has no child"));
        }
        self.set_root(child);
        self.release(root_id);
        let height = self
            .tree
            .height
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        self.tree.monitor.tree_shrink(height);
        Ok(())
    }

    /// Fix an underflowing non-root node by borrowing from or merging with a
    /// sibling. Returns the new parent content, or `None` if no sibling could
    /// help and the node should be written as it is.
    fn rebalance(
        &mut self,
        path: &[PathEntry<L::Key>],
        pending: &Pending<L::Key, L::Value>,
    ) -> Result<ParentUpdate<L::Key>, TreeError> {
        match &pending.content {
            Content::Leaf { entries, successor } => {
                self.rebalance_leaf(path, pending, entries, *successor)
            }
            Content::Internal { keys, children } => {
                self.rebalance_internal(path, pending, keys, children)
            }
        }
    }

    fn rebalance_leaf(
        &mut self,
        path: &[PathEntry<L::Key>],
        node: &Pending<L::Key, L::Value>,
        entries: &[(L::Key, L::Value)],
        successor: PageId,
    ) -> Result<ParentUpdate<L::Key>, TreeError> {
        let Some(parent) = path.last() else {
            return Ok(None);
        };
        let pos = parent.child_pos;
        let mut keys = parent.node.keys.clone();
        let mut children = child_ids(&parent.node.children);
        let tree = self.tree;
        let layout = &tree.layout;
        let capacity = tree.capacity;

        if pos > 0 {
            let left_id = children[pos - 1];
            let left = self.read_leaf(left_id)?;
            let len = left.entries.len();

            // Borrow the tail of the left sibling.
            let mut take = 0;
            while take + 1 < len
                && !capacity.leaf_underflows(layout, &left.entries[..len - take - 1])
            {
                take += 1;
                let mut candidate = left.entries[len - take..].to_vec();
                candidate.extend_from_slice(entries);
                if !capacity.leaf_underflows(layout, &candidate) {
                    break;
                }
            }
            if take > 0 {
                let mut node_entries = left.entries[len - take..].to_vec();
                node_entries.extend_from_slice(entries);
                if !capacity.leaf_underflows(layout, &node_entries)
                    && capacity.leaf_fits(layout, &node_entries)
                {
                    let separator = node_entries
                        .first()
                        .map(|(key, _)| key.clone())
                        .ok_or_else(|| broken("borrow produced an empty leaf"))?;
                    let node_id = self.write_node(&Pending {
                        page_id: node.page_id,
                        generation: node.generation,
                        content: Content::Leaf {
                            entries: node_entries,
                            successor,
                        },
                    })?;
                    let left_new = self.write_node(&Pending {
                        page_id: left_id,
                        generation: left.generation,
                        content: Content::Leaf {
                            entries: left.entries[..len - take].to_vec(),
                            successor: node_id,
                        },
                    })?;
                    if left_new != left_id {
                        self.redirect_predecessor(path, pos - 1, left_new)?;
                    }
                    keys[pos - 1] = separator;
                    children[pos - 1] = left_new;
                    children[pos] = node_id;
                    return Ok(Some((keys, children)));
                }
            }

            // Merge into the left sibling.
            let mut merged = left.entries;
            merged.extend_from_slice(entries);
            if !capacity.leaf_fits(layout, &merged) {
                return Ok(None);
            }
            let left_new = self.write_node(&Pending {
                page_id: left_id,
                generation: left.generation,
                content: Content::Leaf {
                    entries: merged,
                    successor,
                },
            })?;
            if left_new != left_id {
                self.redirect_predecessor(path, pos - 1, left_new)?;
            }
            self.release(node.page_id);
            keys.remove(pos - 1);
            children.remove(pos);
            children[pos - 1] = left_new;
            return Ok(Some((keys, children)));
        }

        let Some(&right_id) = children.get(1) else {
            return Ok(None);
        };
        let right = self.read_leaf(right_id)?;
        let len = right.entries.len();

        // Borrow the head of the right sibling, which moves to a new page.
        let mut take = 0;
        while take + 1 < len && !capacity.leaf_underflows(layout, &right.entries[take + 1..]) {
            take += 1;
            let mut candidate = entries.to_vec();
            candidate.extend_from_slice(&right.entries[..take]);
            if !capacity.leaf_underflows(layout, &candidate) {
                break;
            }
        }
        if take > 0 {
            let mut node_entries = entries.to_vec();
            node_entries.extend_from_slice(&right.entries[..take]);
            if !capacity.leaf_underflows(layout, &node_entries)
                && capacity.leaf_fits(layout, &node_entries)
            {
                let remaining = right.entries[take..].to_vec();
                let separator = remaining
                    .first()
                    .map(|(key, _)| key.clone())
                    .ok_or_else(|| broken("borrow emptied the right sibling"))?;
                let right_new = self.copy_node(
                    right_id,
                    &Content::Leaf {
                        entries: remaining,
                        successor: successor_id(right.successor),
                    },
                )?;
                let node_id = self.write_node(&Pending {
                    page_id: node.page_id,
                    generation: node.generation,
                    content: Content::Leaf {
                        entries: node_entries,
                        successor: right_new,
                    },
                })?;
                if node_id != node.page_id {
                    self.redirect_predecessor(path, 0, node_id)?;
                }
                keys[0] = separator;
                children[0] = node_id;
                children[1] = right_new;
                return Ok(Some((keys, children)));
            }
        }

        // Merge the right sibling into this node.
        let mut merged = entries.to_vec();
        merged.extend_from_slice(&right.entries);
        if !capacity.leaf_fits(layout, &merged) {
            return Ok(None);
        }
        let node_id = self.write_node(&Pending {
            page_id: node.page_id,
            generation: node.generation,
            content: Content::Leaf {
                entries: merged,
                successor: successor_id(right.successor),
            },
        })?;
        if node_id != node.page_id {
            self.redirect_predecessor(path, 0, node_id)?;
        }
        self.release(right_id);
        keys.remove(0);
        children.remove(1);
        children[0] = node_id;
        Ok(Some((keys, children)))
    }

    fn rebalance_internal(
        &mut self,
        path: &[PathEntry<L::Key>],
        node: &Pending<L::Key, L::Value>,
        node_keys: &[L::Key],
        node_children: &[PageId],
    ) -> Result<ParentUpdate<L::Key>, TreeError> {
        let Some(parent) = path.last() else {
            return Ok(None);
        };
        let pos = parent.child_pos;
        let mut keys = parent.node.keys.clone();
        let mut children = child_ids(&parent.node.children);
        let tree = self.tree;
        let layout = &tree.layout;
        let capacity = tree.capacity;

        if pos > 0 {
            let left_id = children[pos - 1];
            let left = self.read_internal(left_id)?;
            let n = left.keys.len();

            // Rotate the last child of the left sibling through the parent.
            if n >= 2 && !capacity.internal_underflows(layout, &left.keys[..n - 1]) {
                let mut rotated_keys = vec![keys[pos - 1].clone()];
                rotated_keys.extend_from_slice(node_keys);
                if capacity.internal_fits(layout, &rotated_keys) {
                    let mut rotated_children = vec![left.children[n].page_id];
                    rotated_children.extend_from_slice(node_children);
                    let separator = left.keys[n - 1].clone();
                    let node_id = self.write_node(&Pending {
                        page_id: node.page_id,
                        generation: node.generation,
                        content: Content::Internal {
                            keys: rotated_keys,
                            children: rotated_children,
                        },
                    })?;
                    let left_new = self.write_node(&Pending {
                        page_id: left_id,
                        generation: left.generation,
                        content: Content::Internal {
                            keys: left.keys[..n - 1].to_vec(),
                            children: child_ids(&left.children[..n]),
                        },
                    })?;
                    keys[pos - 1] = separator;
                    children[pos - 1] = left_new;
                    children[pos] = node_id;
                    return Ok(Some((keys, children)));
                }
            }

            // Merge into the left sibling, pulling the separator down.
            let mut merged_keys = left.keys.clone();
            merged_keys.push(keys[pos - 1].clone());
            merged_keys.extend_from_slice(node_keys);
            if !capacity.internal_fits(layout, &merged_keys) {
                return Ok(None);
            }
            let mut merged_children = child_ids(&left.children);
            merged_children.extend_from_slice(node_children);
            let left_new = self.write_node(&Pending {
                page_id: left_id,
                generation: left.generation,
                content: Content::Internal {
                    keys: merged_keys,
                    children: merged_children,
                },
            })?;
            self.release(node.page_id);
            keys.remove(pos - 1);
            children.remove(pos);
            children[pos - 1] = left_new;
            return Ok(Some((keys, children)));
        }

        let Some(&right_id) = children.get(1) else {
            return Ok(None);
        };
        let right = self.read_internal(right_id)?;
        let n = right.keys.len();

        // Rotate the first child of the right sibling through the parent.
        if n >= 2 && !capacity.internal_underflows(layout, &right.keys[1..]) {
            let mut rotated_keys = node_keys.to_vec();
            rotated_keys.push(keys[0].clone());
            if capacity.internal_fits(layout, &rotated_keys) {
                let mut rotated_children = node_children.to_vec();
                rotated_children.push(right.children[0].page_id);
                let separator = right.keys[0].clone();
                let right_new = self.copy_node(
                    right_id,
                    &Content::Internal {
                        keys: right.keys[1..].to_vec(),
                        children: child_ids(&right.children[1..]),
                    },
                )?;
                let node_id = self.write_node(&Pending {
                    page_id: node.page_id,
                    generation: node.generation,
                    content: Content::Internal {
                        keys: rotated_keys,
                        children: rotated_children,
                    },
                })?;
                keys[0] = separator;
                children[0] = node_id;
                children[1] = right_new;
                return Ok(Some((keys, children)));
            }
        }

        // Merge the right sibling into this node.
        let mut merged_keys = node_keys.to_vec();
        merged_keys.push(keys[0].clone());
        merged_keys.extend_from_slice(&right.keys);
        if !capacity.internal_fits(layout, &merged_keys) {
            return Ok(None);
        }
        let mut merged_children = node_children.to_vec();
        merged_children.extend(right.children.iter().map(|child| child.page_id));
        let node_id = self.write_node(&Pending {
            page_id: node.page_id,
            generation: node.generation,
            content: Content::Internal {
                keys: merged_keys,
                children: merged_children,
            },
        })?;
        self.release(right_id);
        keys.remove(0);
        children.remove(1);
        children[0] = node_id;
        Ok(Some((keys, children)))
    }
}

impl<L: Layout> std::fmt::Debug for Writer<'_, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("last_id", &self.state.last_id)
            .field("free_pages", &self.state.free_list.len())
            .finish_non_exhaustive()
    }
}
