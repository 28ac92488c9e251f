//! Range reads concurrent with the writer.
//!
//! A seeker takes no lease. It descends from the root to the leaf covering
//! its position, then walks the leaf chain through successor pointers. Each
//! page is decoded under a short shared latch; the decoded snapshot is
//! iterated without holding anything.
//!
//! Whenever a page cannot be trusted (it was reused since the pointer to it
//! was read, a torn write is visible, or it belongs to a generation newer
//! than the seeker's view) the seeker refreshes its generations and descends
//! again from the root, resuming after the last key it returned.

use crate::storage::PageId;
use crate::tree::engine::{MAX_TREE_HEIGHT, Root, TreeInner};
use crate::tree::error::TreeError;
use crate::tree::generation::{Generation, Generations};
use crate::tree::layout::Layout;
use crate::tree::node::{self, CorruptReason, LeafNode, Node, NodeError, child_position};
use crate::tree::pointer::TreePointer;

/// Why a seeker had to start over.
#[derive(Debug)]
struct Restart {
    page_id: PageId,
    reason: CorruptReason,
}

type Attempt<T> = Result<Result<T, Restart>, TreeError>;

struct LeafCursor<K, V> {
    entries: std::vec::IntoIter<(K, V)>,
    successor: Option<TreePointer>,
}

impl<K, V> LeafCursor<K, V> {
    fn new(leaf: LeafNode<K, V>) -> Self {
        Self {
            entries: leaf.entries.into_iter(),
            successor: leaf.successor,
        }
    }
}

/// Iterator over the entries of a key range, ascending.
///
/// Every key present for the whole duration of the scan is returned exactly
/// once; keys inserted or removed concurrently may or may not be.
pub struct Seeker<'t, L: Layout> {
    tree: &'t TreeInner<L>,
    from: Option<L::Key>,
    to: Option<L::Key>,
    last: Option<L::Key>,
    generations: Generations,
    leaf: Option<LeafCursor<L::Key, L::Value>>,
    retries: usize,
    /// Restarts since the last returned entry.
    consecutive_retries: usize,
    finished: bool,
}

impl<'t, L: Layout> Seeker<'t, L> {
    pub(crate) fn new(
        tree: &'t TreeInner<L>,
        from: Option<L::Key>,
        to: Option<L::Key>,
    ) -> Result<Self, TreeError> {
        tree.ensure_recovered()?;
        Ok(Self {
            tree,
            from,
            to,
            last: None,
            generations: tree.generations(),
            leaf: None,
            retries: 0,
            consecutive_retries: 0,
            finished: false,
        })
    }

    /// Number of times this seeker restarted from the root.
    ///
    /// Only restarts without an entry returned in between count towards
    /// `max_seek_retries`.
    #[must_use]
    pub const fn retries(&self) -> usize {
        self.retries
    }

    fn advance(&mut self) -> Result<Option<(L::Key, L::Value)>, TreeError> {
        loop {
            let (next, successor) = match self.leaf.as_mut() {
                Some(cursor) => (cursor.entries.next(), cursor.successor),
                None => {
                    self.descend()?;
                    continue;
                }
            };

            if let Some((key, value)) = next {
                if self.before_start(&key) {
                    continue;
                }
                if self.past_end(&key) {
                    return Ok(None);
                }
                self.last = Some(key.clone());
                self.consecutive_retries = 0;
                return Ok(Some((key, value)));
            }

            let Some(successor) = successor else {
                return Ok(None);
            };
            match self.load_leaf(successor)? {
                Ok(cursor) => self.leaf = Some(cursor),
                Err(restart) => self.restart(restart)?,
            }
        }
    }

    fn before_start(&self, key: &L::Key) -> bool {
        let layout = &self.tree.layout;
        match (&self.last, &self.from) {
            (Some(last), _) => layout.compare(key, last).is_le(),
            (None, Some(from)) => layout.compare(key, from).is_lt(),
            (None, None) => false,
        }
    }

    fn past_end(&self, key: &L::Key) -> bool {
        self.to
            .as_ref()
            .is_some_and(|to| self.tree.layout.compare(key, to).is_ge())
    }

    fn descend(&mut self) -> Result<(), TreeError> {
        loop {
            self.generations = self.tree.generations();
            let root = self.tree.root();
            match self.descend_from(root)? {
                Ok(cursor) => {
                    self.leaf = Some(cursor);
                    return Ok(());
                }
                Err(restart) => self.restart(restart)?,
            }
        }
    }

    fn descend_from(&self, root: Root) -> Attempt<LeafCursor<L::Key, L::Value>> {
        let target = self.last.as_ref().or(self.from.as_ref());
        let mut page_id = root.id;
        let mut pointer_generation = root.generation;
        for _ in 0..MAX_TREE_HEIGHT {
            match self.read(page_id, pointer_generation)? {
                Err(restart) => return Ok(Err(restart)),
                Ok(Node::Leaf(leaf)) => return Ok(Ok(LeafCursor::new(leaf))),
                Ok(Node::Internal(internal)) => {
                    let pos = target.map_or(0, |key| {
                        child_position(&self.tree.layout, &internal.keys, key)
                    });
                    let child = internal.children[pos];
                    page_id = child.page_id;
                    pointer_generation = child.generation;
                }
            }
        }
        Ok(Err(Restart {
            page_id,
            reason: CorruptReason::UnexpectedKind { expected: "leaf" },
        }))
    }

    fn load_leaf(&self, pointer: TreePointer) -> Attempt<LeafCursor<L::Key, L::Value>> {
        Ok(match self.read(pointer.page_id, pointer.generation)? {
            Ok(Node::Leaf(leaf)) => Ok(LeafCursor::new(leaf)),
            Ok(Node::Internal(_)) => Err(Restart {
                page_id: pointer.page_id,
                reason: CorruptReason::UnexpectedKind { expected: "leaf" },
            }),
            Err(restart) => Err(restart),
        })
    }

    /// Decode a page reached through a pointer written in
    /// `pointer_generation`.
    fn read(
        &self,
        page_id: PageId,
        pointer_generation: Generation,
    ) -> Attempt<Node<L::Key, L::Value>> {
        let page = self.tree.cache.read(page_id)?;
        let decoded = node::decode(&page, &self.tree.layout, self.generations);
        let node_generation = node::peek_generation(&page);
        drop(page);

        Ok(match decoded {
            Ok(node) if node.generation() > pointer_generation => Err(Restart {
                page_id,
                reason: CorruptReason::FutureGeneration(node.generation()),
            }),
            Ok(node) => Ok(node),
            Err(NodeError::Corrupt(reason)) => Err(Restart { page_id, reason }),
            Err(NodeError::NewerGenerations) => Err(Restart {
                page_id,
                reason: CorruptReason::FutureGeneration(node_generation),
            }),
        })
    }

    fn restart(&mut self, restart: Restart) -> Result<(), TreeError> {
        self.leaf = None;
        self.retries += 1;
        self.consecutive_retries += 1;
        if self.consecutive_retries > self.tree.config.max_seek_retries {
            tracing::error!(
                page_id = restart.page_id,
                reason = %restart.reason,
                retries = self.retries,
                "seeker gave up"
            );
            return Err(TreeError::CorruptNode {
                page_id: restart.page_id,
                reason: restart.reason,
            });
        }
        tracing::trace!(
            page_id = restart.page_id,
            reason = %restart.reason,
            "seeker restarting from root"
        );
        Ok(())
    }
}

impl<L: Layout> Iterator for Seeker<'_, L> {
    type Item = Result<(L::Key, L::Value), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<L: Layout> std::iter::FusedIterator for Seeker<'_, L> {}

impl<L: Layout> std::fmt::Debug for Seeker<'_, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seeker")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("last", &self.last)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}
