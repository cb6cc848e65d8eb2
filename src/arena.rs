//! Node arena: stable storage slots addressed by compact ids.
//!
//! Children, parents, and the leaf chain all refer to nodes by [`NodeId`]
//! rather than by pointer. Each slot boxes a [`NodeCell`], so a cell never
//! moves while the slot table grows, and freed slots are recycled through a
//! free list.
//!
//! The relationship links (`parent`, and for leaves `next`/`prev`) live in
//! the cell as atomics, outside the latched payload. They are rewritten by
//! whichever thread holds the exclusive latch of the node that *owns* the
//! relationship (the parent being split or merged, the chain predecessor),
//! which is not necessarily the latch of the node whose link changes. A
//! thread only ever follows a link under a latch arrangement that excludes
//! the writer, so the atomics are a memory-model formality rather than a
//! synchronization point.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::key::IndexKey;
use crate::latch::NodeLatch;
use crate::node::Node;

/// Compact node reference. `NONE` is the null sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct NodeId(u32);

impl NodeId {
    pub(crate) const NONE: NodeId = NodeId(u32::MAX);

    #[inline]
    pub(crate) fn is_none(self) -> bool {
        self == NodeId::NONE
    }

    #[inline]
    pub(crate) fn is_some(self) -> bool {
        self != NodeId::NONE
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Relationship links of one node.
pub(crate) struct Links {
    parent: AtomicU32,
    next: AtomicU32,
    prev: AtomicU32,
}

impl Links {
    fn new() -> Links {
        Links {
            parent: AtomicU32::new(NodeId::NONE.0),
            next: AtomicU32::new(NodeId::NONE.0),
            prev: AtomicU32::new(NodeId::NONE.0),
        }
    }

    #[inline]
    pub(crate) fn parent(&self) -> NodeId {
        NodeId(self.parent.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_parent(&self, id: NodeId) {
        self.parent.store(id.0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next(&self) -> NodeId {
        NodeId(self.next.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_next(&self, id: NodeId) {
        self.next.store(id.0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn prev(&self) -> NodeId {
        NodeId(self.prev.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_prev(&self, id: NodeId) {
        self.prev.store(id.0, Ordering::Release);
    }
}

/// One arena slot: the node payload behind its latch, plus its links.
pub(crate) struct NodeCell<K: IndexKey> {
    pub(crate) links: Links,
    pub(crate) latch: NodeLatch<Node<K>>,
}

pub(crate) struct NodeArena<K: IndexKey> {
    slots: RwLock<Vec<Option<Box<NodeCell<K>>>>>,
    free: Mutex<Vec<u32>>,
}

impl<K: IndexKey> NodeArena<K> {
    pub(crate) fn new() -> NodeArena<K> {
        NodeArena {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a slot for `node` and returns its id.
    pub(crate) fn alloc(&self, node: Node<K>) -> NodeId {
        let cell = Box::new(NodeCell {
            links: Links::new(),
            latch: NodeLatch::new(node),
        });

        let mut slots = self.slots.write();
        if let Some(index) = self.free.lock().pop() {
            slots[index as usize] = Some(cell);
            NodeId(index)
        } else {
            slots.push(Some(cell));
            NodeId((slots.len() - 1) as u32)
        }
    }

    /// Frees the slot behind `id`, dropping the node payload.
    ///
    /// The caller must guarantee that no other thread holds or awaits this
    /// node's latch and that the id is no longer reachable: the latch
    /// protocol establishes this by holding exclusive latches on the parent
    /// and on both merge partners before a node is retired.
    pub(crate) fn release(&self, id: NodeId) {
        let cell = self.slots.write()[id.index()].take();
        debug_assert!(cell.is_some(), "released a vacant arena slot");
        drop(cell);
        self.free.lock().push(id.0);
    }

    /// Returns the cell behind `id`.
    #[inline]
    pub(crate) fn cell(&self, id: NodeId) -> &NodeCell<K> {
        let slots = self.slots.read();
        let cell: &NodeCell<K> = slots[id.index()].as_deref().expect("vacant arena slot");
        // Safety: the cell is boxed, so it stays put while the slot table
        // grows, and the slot is only vacated by `release`, whose caller
        // must prove the id unreachable first. Extending the borrow past
        // the table lock is therefore sound.
        unsafe { &*(cell as *const NodeCell<K>) }
    }

    /// Drops every node. Only sound while the caller holds the tree
    /// exclusively (snapshot load, teardown).
    pub(crate) fn clear(&self) {
        self.slots.write().clear();
        self.free.lock().clear();
    }
}
