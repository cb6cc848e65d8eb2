//! The tree proper: traversal with latch coupling and the mutation engine.
//!
//! Three locks cooperate here, with strictly separated duties:
//!
//! - the **tree latch** is shared by every `insert`/`remove`/`find`/
//!   `range_find` and exclusive only for snapshot I/O; it never serializes
//!   mutators against each other
//! - the **root latch** guards the root and head-leaf ids: pointer reads at
//!   the start of a traversal, root install and root collapse; it is never
//!   held across a descent
//! - the **per-node latches** carry the actual coupling protocol: read
//!   descents hold one shared latch at a time (taking the child's before
//!   releasing the parent's), write descents hold a chain of exclusive
//!   latches that is trimmed to the deepest unsafe ancestor as the descent
//!   proves children safe
//!
//! Acquisition is top-down in the tree and left-to-right along the leaf
//! chain. The one place the tree order would be violated — latching a left
//! sibling while holding the underflowing child — releases the child first
//! and relatches it after the sibling, restoring the global order.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::arena::{NodeArena, NodeId};
use crate::error::{Error, Result};
use crate::key::IndexKey;
use crate::latch::{ExclusiveGuard, SharedGuard};
use crate::node::{InternalNode, LeafNode, Node};

/// Root and head-leaf ids, both `NONE` until the first insert. Guarded by
/// the root latch.
pub(crate) struct RootPointers {
    pub(crate) root: NodeId,
    pub(crate) head_leaf: NodeId,
}

/// The chain of exclusive latches a write descent holds, topmost ancestor
/// first. Dropping the vector releases the latches in acquisition order.
type WriteChain<'t, K> = Vec<(NodeId, ExclusiveGuard<'t, Node<K>>)>;

/// A thread-safe B+ tree index mapping ordered keys to `u64` values.
///
/// The value `0` doubles as the "absent" sentinel of [`BPlusTree::find`];
/// callers that need to distinguish a stored zero from a missing key should
/// not store `0`.
pub struct BPlusTree<K: IndexKey> {
    order: AtomicUsize,
    pub(crate) root_latch: Mutex<RootPointers>,
    pub(crate) tree_latch: RwLock<()>,
    pub(crate) arena: NodeArena<K>,
    /// Former roots folded away by a collapse. A traversal that snapshotted
    /// the old root id may still be blocked on its latch, so the slot is
    /// only reclaimed at the next quiescent point (snapshot I/O).
    pub(crate) retired: Mutex<Vec<NodeId>>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Creates an empty tree with branching parameter `order`.
    ///
    /// A node holds at most `order` keys; a settled non-root node holds at
    /// least `(order + 1) / 2 - 1`. Orders below 3 break the occupancy
    /// predicates and are rejected.
    pub fn new(order: usize) -> Result<BPlusTree<K>> {
        if order < 3 {
            return Err(Error::InvalidOrder { order });
        }

        Ok(BPlusTree {
            order: AtomicUsize::new(order),
            root_latch: Mutex::new(RootPointers {
                root: NodeId::NONE,
                head_leaf: NodeId::NONE,
            }),
            tree_latch: RwLock::new(()),
            arena: NodeArena::new(),
            retired: Mutex::new(Vec::new()),
        })
    }

    /// The branching parameter. Replaced wholesale by `deserialize`.
    #[inline]
    pub fn order(&self) -> usize {
        self.order.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_order(&self, order: usize) {
        self.order.store(order, Ordering::Release);
    }

    /// Inserts `(key, value)`, overwriting the stored value if the key is
    /// already present (upsert).
    pub fn insert(&self, key: K, value: u64) {
        let _tree = self.tree_latch.read();

        {
            let mut roots = self.root_latch.lock();
            if roots.root.is_none() {
                let leaf_id = self.arena.alloc(Node::Leaf(LeafNode::new()));
                roots.root = leaf_id;
                roots.head_leaf = leaf_id;
                debug!(root = ?leaf_id, "created root leaf");
            }
        }

        let order = self.order();
        let mut chain = self
            .find_leaf_write(&key)
            .expect("root exists after lazy creation");

        let (_, leaf_guard) = chain.last_mut().expect("descent reaches a leaf");
        leaf_guard.as_leaf_mut().insert(key, value);

        self.handle_split(&mut chain, order);
        // chain drops here, releasing the held latches top-down
    }

    /// Removes `key` if present; absent keys are a silent no-op.
    pub fn remove(&self, key: &K) {
        let _tree = self.tree_latch.read();

        if self.root_latch.lock().root.is_none() {
            return;
        }

        let order = self.order();
        let mut chain = match self.find_leaf_write(key) {
            Some(chain) => chain,
            None => return,
        };

        {
            let (_, leaf_guard) = chain.last_mut().expect("descent reaches a leaf");
            let (pos, exact) = leaf_guard.lower_bound(key);
            if !exact {
                return;
            }
            leaf_guard.as_leaf_mut().remove_at(pos);
        }

        self.handle_underflow(&mut chain, order);
    }

    /// Returns the value stored under `key`, or `0` when absent.
    pub fn find(&self, key: &K) -> u64 {
        let _tree = self.tree_latch.read();

        let (_, guard) = match self.find_leaf_read(key) {
            Some(found) => found,
            None => return 0,
        };

        let (pos, exact) = guard.lower_bound(key);
        if exact {
            guard.as_leaf().values[pos]
        } else {
            0
        }
    }

    /// Collects every `(key, value)` with `start <= key <= end`, in key
    /// order. The scan crosses leaves hand-over-hand along the chain,
    /// forward only.
    pub fn range_find(&self, start: &K, end: &K) -> Vec<(K, u64)> {
        let _tree = self.tree_latch.read();

        let mut results = Vec::new();
        let (mut leaf_id, mut guard) = match self.find_leaf_read(start) {
            Some(found) => found,
            None => return results,
        };
        let (mut pos, _) = guard.lower_bound(start);

        loop {
            {
                let leaf = guard.as_leaf();
                while pos < leaf.keys.len() {
                    if &leaf.keys[pos] > end {
                        return results;
                    }
                    results.push((leaf.keys[pos].clone(), leaf.values[pos]));
                    pos += 1;
                }
            }

            let next_id = self.arena.cell(leaf_id).links.next();
            if next_id.is_none() {
                return results;
            }

            // take the successor's latch before releasing the current one
            let next_guard = self.arena.cell(next_id).latch.shared();
            guard = next_guard;
            leaf_id = next_id;
            pos = 0;
        }
    }

    /// Number of stored keys, via a forward walk of the leaf chain.
    pub fn len(&self) -> usize {
        let _tree = self.tree_latch.read();

        let head = self.root_latch.lock().head_leaf;
        if head.is_none() {
            return 0;
        }

        let mut count = 0;
        let mut leaf_id = head;
        let mut guard = self.arena.cell(leaf_id).latch.shared();
        loop {
            count += guard.len();
            let next_id = self.arena.cell(leaf_id).links.next();
            if next_id.is_none() {
                return count;
            }
            let next_guard = self.arena.cell(next_id).latch.shared();
            guard = next_guard;
            leaf_id = next_id;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =====================================================================
    // Traversal
    // =====================================================================

    /// Latches the current root. The root id is snapshotted under the root
    /// latch, the node latch is acquired without it (blocking there while
    /// holding the root latch could deadlock against a root install), and
    /// the id is then revalidated: a concurrent install or collapse between
    /// snapshot and latch means we latched a node that no longer covers the
    /// whole key space, so the acquisition restarts from the new root.
    fn latch_root_shared(&self) -> Option<(NodeId, SharedGuard<'_, Node<K>>)> {
        loop {
            let root_id = self.root_latch.lock().root;
            if root_id.is_none() {
                return None;
            }
            let guard = self.arena.cell(root_id).latch.shared();
            if self.root_latch.lock().root == root_id {
                return Some((root_id, guard));
            }
        }
    }

    fn latch_root_exclusive(&self) -> Option<(NodeId, ExclusiveGuard<'_, Node<K>>)> {
        loop {
            let root_id = self.root_latch.lock().root;
            if root_id.is_none() {
                return None;
            }
            let guard = self.arena.cell(root_id).latch.exclusive();
            if self.root_latch.lock().root == root_id {
                return Some((root_id, guard));
            }
        }
    }

    /// Child to descend into for `key`: an exact separator hit routes into
    /// the right subtree, consistent with separators being copies of the
    /// right sibling's first leaf key.
    #[inline]
    fn route(node: &Node<K>, key: &K) -> NodeId {
        let (pos, exact) = node.lower_bound(key);
        let index = if exact { pos + 1 } else { pos };
        node.as_internal().children[index]
    }

    /// Read-mode descent to the leaf that would contain `key`, shared
    /// latches hand-over-hand. Returns the leaf with its shared latch held.
    fn find_leaf_read(&self, key: &K) -> Option<(NodeId, SharedGuard<'_, Node<K>>)> {
        let (mut node_id, mut guard) = self.latch_root_shared()?;

        loop {
            if guard.is_leaf() {
                return Some((node_id, guard));
            }
            let child_id = Self::route(&guard, key);
            // child latch first, then the parent guard drops on assignment
            let child_guard = self.arena.cell(child_id).latch.shared();
            guard = child_guard;
            node_id = child_id;
        }
    }

    /// Write-mode descent to the leaf that would contain `key`. Returns the
    /// chain of exclusive latches from the deepest unsafe ancestor down to
    /// the leaf: whenever a just-latched child is safe, every held ancestor
    /// is released (oldest first) and the chain restarts at the child.
    fn find_leaf_write(&self, key: &K) -> Option<WriteChain<'_, K>> {
        let order = self.order();
        let (root_id, root_guard) = self.latch_root_exclusive()?;

        let mut chain: WriteChain<'_, K> = Vec::new();
        chain.push((root_id, root_guard));

        loop {
            let (_, top) = chain.last().expect("chain is never empty");
            if top.is_leaf() {
                return Some(chain);
            }

            let child_id = Self::route(top, key);
            let child_guard = self.arena.cell(child_id).latch.exclusive();
            if child_guard.is_safe(order) {
                // no structural change below can reach the ancestors
                chain.clear();
            }
            chain.push((child_id, child_guard));
        }
    }

    // =====================================================================
    // Structural modifications
    // =====================================================================

    /// Splits `node` into itself and a new right sibling, wiring the leaf
    /// chain or repointing moved children as the variant requires. Returns
    /// the promoted separator and the sibling's id; the caller attaches the
    /// sibling to a parent.
    fn split_node(&self, node_id: NodeId, node: &mut Node<K>) -> (K, NodeId) {
        let (separator, right_id) = match node {
            Node::Leaf(leaf) => {
                let (separator, right) = leaf.split();
                let right_id = self.arena.alloc(Node::Leaf(right));

                // thread the sibling into the leaf chain
                let cell = self.arena.cell(node_id);
                let right_cell = self.arena.cell(right_id);
                let old_next = cell.links.next();
                right_cell.links.set_next(old_next);
                right_cell.links.set_prev(node_id);
                if old_next.is_some() {
                    self.arena.cell(old_next).links.set_prev(right_id);
                }
                cell.links.set_next(right_id);

                (separator, right_id)
            }
            Node::Internal(internal) => {
                let (separator, right) = internal.split();
                let moved = right.children.clone();
                let right_id = self.arena.alloc(Node::Internal(right));
                for &child in &moved {
                    self.arena.cell(child).links.set_parent(right_id);
                }
                (separator, right_id)
            }
        };

        trace!(node = ?node_id, sibling = ?right_id, "split node");
        (separator, right_id)
    }

    /// Splits the deepest node of the chain as long as it is overloaded,
    /// propagating separators upward. Every node that can split here was
    /// unsafe during the descent, so its parent is still latched directly
    /// beneath it on the chain; when the chain bottoms out the node is the
    /// root and a new root is installed under the root latch.
    fn handle_split(&self, chain: &mut WriteChain<'_, K>, order: usize) {
        let mut level = chain.len() - 1;

        loop {
            if !chain[level].1.is_overloaded(order) {
                return;
            }
            let node_id = chain[level].0;
            let (separator, right_id) = self.split_node(node_id, &mut chain[level].1);

            if level == 0 {
                // the chain bottom can only overflow if it is the root:
                // any other node this full would still have its parent
                // latched above it
                let mut roots = self.root_latch.lock();
                assert_eq!(roots.root, node_id, "split escaped the latched chain");

                let mut new_root = InternalNode::new();
                new_root.keys.push(separator);
                new_root.children.push(node_id);
                new_root.children.push(right_id);
                let new_root_id = self.arena.alloc(Node::Internal(new_root));

                self.arena.cell(node_id).links.set_parent(new_root_id);
                self.arena.cell(right_id).links.set_parent(new_root_id);
                roots.root = new_root_id;
                debug!(root = ?new_root_id, "installed new root");
                return;
            }

            let parent_id = chain[level - 1].0;
            debug_assert_eq!(
                self.arena.cell(node_id).links.parent(),
                parent_id,
                "chain parent disagrees with the parent link"
            );
            self.arena.cell(right_id).links.set_parent(parent_id);
            chain[level - 1]
                .1
                .as_internal_mut()
                .insert_separator(separator, right_id);

            level -= 1;
        }
    }

    /// Rebalances the deepest node of the chain as long as it is
    /// underloaded: borrow from a sibling that can spare a key (strictly
    /// more than `(order + 1) / 2`), otherwise merge, preferring the left
    /// sibling. Ascends level by level; an internal root emptied by a merge
    /// is collapsed onto its sole child.
    fn handle_underflow(&self, chain: &mut WriteChain<'_, K>, order: usize) {
        loop {
            if chain.len() == 1 {
                self.maybe_collapse_root(chain);
                return;
            }
            if !chain.last().expect("chain is never empty").1.is_underloaded(order) {
                return;
            }

            let (node_id, mut node_guard) = chain.pop().expect("chain is never empty");
            let (parent_id, parent_guard) = chain.last_mut().expect("parent is latched");
            let parent_id = *parent_id;

            let child_index = parent_guard
                .as_internal()
                .children
                .iter()
                .position(|&c| c == node_id)
                .expect("node is a child of its chain parent");

            let left_id = if child_index > 0 {
                Some(parent_guard.as_internal().children[child_index - 1])
            } else {
                None
            };
            let right_id = {
                let children = &parent_guard.as_internal().children;
                if child_index + 1 < children.len() {
                    Some(children[child_index + 1])
                } else {
                    None
                }
            };

            // Latch siblings in chain order. The left sibling sits before
            // the node, so the node's latch is released first and retaken
            // after the sibling's; the node cannot change in the window
            // because every mutator descends through the parent, which we
            // hold exclusively, and readers only take shared latches.
            let mut left_guard = None;
            if let Some(left_id) = left_id {
                drop(node_guard);
                left_guard = Some(self.arena.cell(left_id).latch.exclusive());
                node_guard = self.arena.cell(node_id).latch.exclusive();
            }

            let threshold = (order + 1) / 2;

            if let Some(left) = left_guard.as_mut() {
                if left.len() > threshold {
                    Self::borrow_from_left(
                        &self.arena,
                        parent_guard.as_internal_mut(),
                        child_index,
                        left,
                        &mut node_guard,
                        node_id,
                    );
                    trace!(node = ?node_id, "borrowed from left sibling");
                    return;
                }
            }

            let mut right_guard = right_id.map(|id| self.arena.cell(id).latch.exclusive());
            if let Some(right) = right_guard.as_mut() {
                if right.len() > threshold {
                    Self::borrow_from_right(
                        &self.arena,
                        parent_guard.as_internal_mut(),
                        child_index,
                        &mut node_guard,
                        node_id,
                        right,
                    );
                    trace!(node = ?node_id, "borrowed from right sibling");
                    return;
                }
            }

            // Neither sibling can spare a key: merge, absorbing into the
            // left partner and unlinking the right one from the parent.
            if let (Some(left_id), Some(mut left)) = (left_id, left_guard.take()) {
                self.merge(
                    parent_guard.as_internal_mut(),
                    child_index - 1,
                    left_id,
                    &mut left,
                    &mut node_guard,
                );
                drop(node_guard);
                trace!(node = ?node_id, into = ?left_id, "merged into left sibling");
                self.split_overfull_merge(left_id, &mut left, parent_id, parent_guard, order);
                drop(left);
                self.arena.release(node_id);
            } else {
                let right_id = right_id.expect("a non-root node has at least one sibling");
                let mut right = right_guard.take().expect("right sibling is latched");
                self.merge(
                    parent_guard.as_internal_mut(),
                    child_index,
                    node_id,
                    &mut node_guard,
                    &mut right,
                );
                drop(right);
                trace!(node = ?right_id, into = ?node_id, "merged right sibling");
                self.split_overfull_merge(node_id, &mut node_guard, parent_id, parent_guard, order);
                drop(node_guard);
                self.arena.release(right_id);
            }

            // the parent lost a separator; re-examine it one level up
        }
    }

    /// An internal merge at an odd order can leave the surviving node one
    /// key over the ceiling (underflowed node + sibling at the borrow
    /// threshold + the pushed-down separator). Splitting it right away
    /// hands the excess back to the parent and restores the occupancy
    /// bound; the parent's size is back to what it was before the merge.
    fn split_overfull_merge(
        &self,
        survivor_id: NodeId,
        survivor: &mut ExclusiveGuard<'_, Node<K>>,
        parent_id: NodeId,
        parent: &mut ExclusiveGuard<'_, Node<K>>,
        order: usize,
    ) {
        if !survivor.is_overloaded(order) {
            return;
        }

        let (separator, right_id) = self.split_node(survivor_id, survivor);
        self.arena.cell(right_id).links.set_parent(parent_id);
        parent.as_internal_mut().insert_separator(separator, right_id);
    }

    /// Moves the left sibling's last entry into the child's front. For
    /// leaves the parent separator becomes a copy of the child's new first
    /// key; for internals the separator rotates down and the sibling's last
    /// key rotates up, with the sibling's last child repointed.
    fn borrow_from_left(
        arena: &NodeArena<K>,
        parent: &mut InternalNode<K>,
        child_index: usize,
        left: &mut ExclusiveGuard<'_, Node<K>>,
        node: &mut ExclusiveGuard<'_, Node<K>>,
        node_id: NodeId,
    ) {
        match &mut **node {
            Node::Leaf(leaf) => {
                let left_leaf = left.as_leaf_mut();
                let key = left_leaf.keys.pop().expect("donor sibling is not empty");
                let value = left_leaf.values.pop().expect("donor sibling is not empty");
                leaf.keys.insert(0, key);
                leaf.values.insert(0, value);
                parent.keys[child_index - 1] = leaf.keys[0].clone();
            }
            Node::Internal(internal) => {
                let left_internal = left.as_internal_mut();
                let down = std::mem::replace(
                    &mut parent.keys[child_index - 1],
                    left_internal.keys.pop().expect("donor sibling is not empty"),
                );
                internal.keys.insert(0, down);
                let moved = left_internal
                    .children
                    .pop()
                    .expect("internal node has children");
                internal.children.insert(0, moved);
                arena.cell(moved).links.set_parent(node_id);
            }
        }
    }

    /// Mirror of `borrow_from_left`: the right sibling's first entry moves
    /// to the child's back.
    fn borrow_from_right(
        arena: &NodeArena<K>,
        parent: &mut InternalNode<K>,
        child_index: usize,
        node: &mut ExclusiveGuard<'_, Node<K>>,
        node_id: NodeId,
        right: &mut ExclusiveGuard<'_, Node<K>>,
    ) {
        match &mut **node {
            Node::Leaf(leaf) => {
                let right_leaf = right.as_leaf_mut();
                let key = right_leaf.keys.remove(0);
                let value = right_leaf.values.remove(0);
                leaf.keys.push(key);
                leaf.values.push(value);
                parent.keys[child_index] = right_leaf.keys[0].clone();
            }
            Node::Internal(internal) => {
                let right_internal = right.as_internal_mut();
                let down = std::mem::replace(
                    &mut parent.keys[child_index],
                    right_internal.keys.remove(0),
                );
                internal.keys.push(down);
                let moved = right_internal.children.remove(0);
                internal.children.push(moved);
                arena.cell(moved).links.set_parent(node_id);
            }
        }
    }

    /// Left absorbs right. For leaves the chain is respliced around the
    /// right partner; for internals the parent separator is pushed down
    /// into the left node's key tail and the moved children are repointed.
    /// The separator and the right child pointer leave the parent. The
    /// caller frees the right node.
    fn merge(
        &self,
        parent: &mut InternalNode<K>,
        left_index: usize,
        left_id: NodeId,
        left: &mut ExclusiveGuard<'_, Node<K>>,
        right: &mut ExclusiveGuard<'_, Node<K>>,
    ) {
        let right_id = parent.children[left_index + 1];

        match (&mut **left, &mut **right) {
            (Node::Leaf(left_leaf), Node::Leaf(right_leaf)) => {
                left_leaf.keys.extend(right_leaf.keys.drain(..));
                left_leaf.values.extend(right_leaf.values.drain(..));

                let left_cell = self.arena.cell(left_id);
                let right_next = self.arena.cell(right_id).links.next();
                left_cell.links.set_next(right_next);
                if right_next.is_some() {
                    self.arena.cell(right_next).links.set_prev(left_id);
                }
            }
            (Node::Internal(left_internal), Node::Internal(right_internal)) => {
                left_internal.keys.push(parent.keys[left_index].clone());
                left_internal.keys.extend(right_internal.keys.drain(..));
                for &child in &right_internal.children {
                    self.arena.cell(child).links.set_parent(left_id);
                }
                left_internal
                    .children
                    .extend(right_internal.children.drain(..));
            }
            _ => unreachable!("merge partners are siblings of one kind"),
        }

        let (_, removed_child) = parent.remove_separator(left_index);
        debug_assert_eq!(removed_child, right_id, "separator removal dropped the wrong child");
    }

    /// Folds an internal root emptied by a merge onto its only child. The
    /// old root is retired rather than freed: a concurrent traversal may
    /// still be blocked on its latch, and will restart once it observes the
    /// replaced root id.
    fn maybe_collapse_root(&self, chain: &mut WriteChain<'_, K>) {
        let needs_collapse = {
            let (_, top) = chain.last().expect("chain is never empty");
            !top.is_leaf() && top.len() == 0
        };
        if !needs_collapse {
            return;
        }

        let (node_id, guard) = chain.pop().expect("chain is never empty");
        let child = guard.as_internal().children[0];

        let mut roots = self.root_latch.lock();
        assert_eq!(roots.root, node_id, "collapse of a non-root node");
        self.arena.cell(child).links.set_parent(NodeId::NONE);
        roots.root = child;
        drop(roots);
        drop(guard);

        self.retired.lock().push(node_id);
        debug!(old = ?node_id, new = ?child, "collapsed root onto its only child");
    }

    /// Frees slots of retired roots. Only called under the exclusive tree
    /// latch, when no traversal can be blocked on their latches.
    pub(crate) fn reclaim_retired(&self) {
        let retired: Vec<NodeId> = self.retired.lock().drain(..).collect();
        for id in retired {
            self.arena.release(id);
        }
    }
}
