//! Two-file snapshot codec.
//!
//! `serialize` dumps a quiescent tree into `<base>.header` and
//! `<base>.data`; `deserialize` discards the current tree and rebuilds an
//! equivalent one from such a pair. Both run under the exclusive tree
//! latch, so they never observe (or leave behind) a half-mutated tree.
//!
//! All integers are little-endian. The header is four `i32`s: the key-type
//! tag, the branching parameter, the root id, and the head-leaf id (`-1`
//! sentinels for an empty tree). Node ids are assigned by a breadth-first
//! walk from the root, except that a head leaf distinct from the root is
//! forced to id 1 right after the root, giving the two anchor nodes stable
//! ids. The data file holds one record per node in depth-first pre-order:
//!
//! ```text
//! i32 node_id | i8 kind (0 internal, 1 leaf) | i32 size | size x key
//!   leaf:     size x u64 value, i32 next_leaf_id
//!   internal: (size + 1) x i32 child_id
//! ```
//!
//! The format carries no magic number or version tag; the key-type tag in
//! the header is the only self-description.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::arena::NodeId;
use crate::error::{Error, Result};
use crate::key::{IndexKey, KEY_TYPE_BYTES, KEY_TYPE_I32};
use crate::node::{InternalNode, LeafNode, Node};
use crate::tree::BPlusTree;

const KIND_INTERNAL: i8 = 0;
const KIND_LEAF: i8 = 1;
const NO_NODE: i32 = -1;

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

impl<K: IndexKey> BPlusTree<K> {
    /// Writes the tree to `<base>.header` and `<base>.data`.
    pub fn serialize(&self, base: impl AsRef<Path>) -> Result<()> {
        let _tree = self.tree_latch.write();
        self.reclaim_retired();

        let base = base.as_ref();
        let mut header_file = File::create(with_suffix(base, ".header"))?;
        let mut data_file = File::create(with_suffix(base, ".data"))?;

        let (root, head) = {
            let roots = self.root_latch.lock();
            (roots.root, roots.head_leaf)
        };

        // Assign ids breadth-first. The head leaf comes right after the
        // root when it is a distinct node, so the two anchors always get
        // ids 0 and 1.
        let mut ids: HashMap<NodeId, i32> = HashMap::new();
        if root.is_some() {
            let mut next_id = 1;
            ids.insert(root, 0);
            if head != root {
                ids.insert(head, next_id);
                next_id += 1;
            }

            let mut queue = VecDeque::from([root]);
            while let Some(id) = queue.pop_front() {
                let guard = self.arena.cell(id).latch.shared();
                if let Node::Internal(internal) = &*guard {
                    for &child in &internal.children {
                        if !ids.contains_key(&child) {
                            ids.insert(child, next_id);
                            next_id += 1;
                            queue.push_back(child);
                        }
                    }
                }
            }
        }

        let mut header = BytesMut::with_capacity(16);
        header.put_i32_le(K::KEY_TYPE);
        header.put_i32_le(self.order() as i32);
        header.put_i32_le(if root.is_some() { ids[&root] } else { NO_NODE });
        header.put_i32_le(if head.is_some() { ids[&head] } else { NO_NODE });

        // One record per node, depth-first pre-order; children pushed in
        // reverse so they pop left to right.
        let mut data = BytesMut::new();
        if root.is_some() {
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                let guard = self.arena.cell(id).latch.shared();
                data.put_i32_le(ids[&id]);

                match &*guard {
                    Node::Leaf(leaf) => {
                        data.put_i8(KIND_LEAF);
                        data.put_i32_le(leaf.keys.len() as i32);
                        for key in &leaf.keys {
                            key.encode(&mut data);
                        }
                        for &value in &leaf.values {
                            data.put_u64_le(value);
                        }
                        let next = self.arena.cell(id).links.next();
                        data.put_i32_le(if next.is_some() { ids[&next] } else { NO_NODE });
                    }
                    Node::Internal(internal) => {
                        data.put_i8(KIND_INTERNAL);
                        data.put_i32_le(internal.keys.len() as i32);
                        for key in &internal.keys {
                            key.encode(&mut data);
                        }
                        for &child in &internal.children {
                            data.put_i32_le(ids[&child]);
                        }
                        for &child in internal.children.iter().rev() {
                            stack.push(child);
                        }
                    }
                }
            }
        }

        header_file.write_all(&header)?;
        data_file.write_all(&data)?;
        debug!(nodes = ids.len(), bytes = data.len(), "wrote snapshot");
        Ok(())
    }

    /// Discards the current tree and rebuilds it from `<base>.header` and
    /// `<base>.data`.
    ///
    /// The current tree is gone once both files open, so a failure past
    /// that point (key-type mismatch, truncated stream, dangling ids)
    /// leaves an empty or partially reconstructed tree; the caller must
    /// treat it as fresh.
    pub fn deserialize(&self, base: impl AsRef<Path>) -> Result<()> {
        let _tree = self.tree_latch.write();

        let base = base.as_ref();
        let header_bytes = std::fs::read(with_suffix(base, ".header"))?;
        let data_bytes = std::fs::read(with_suffix(base, ".data"))?;

        // The files opened, so the load is committed: discard the current
        // tree before looking at the header. Validation failures from here
        // on leave an empty tree behind.
        {
            let mut roots = self.root_latch.lock();
            roots.root = NodeId::NONE;
            roots.head_leaf = NodeId::NONE;
        }
        self.arena.clear();
        self.retired.lock().clear();

        let mut header = &header_bytes[..];
        if header.remaining() < 16 {
            return Err(Error::Truncated);
        }
        let key_type = header.get_i32_le();
        if key_type != KEY_TYPE_I32 && key_type != KEY_TYPE_BYTES {
            return Err(Error::UnsupportedKeyType(key_type));
        }
        if key_type != K::KEY_TYPE {
            return Err(Error::KeyTypeMismatch {
                expected: K::KEY_TYPE,
                found: key_type,
            });
        }
        let order = header.get_i32_le();
        if order < 3 {
            return Err(Error::InvalidOrder {
                order: order.max(0) as usize,
            });
        }
        let root_id = header.get_i32_le();
        let head_id = header.get_i32_le();
        self.set_order(order as usize);

        if root_id == NO_NODE {
            debug!("loaded empty snapshot");
            return Ok(());
        }

        // First pass: materialize every node, caching its adjacency.
        let mut nodes: HashMap<i32, NodeId> = HashMap::new();
        let mut leaf_next: Vec<(i32, i32)> = Vec::new();
        let mut children_of: Vec<(i32, Vec<i32>)> = Vec::new();

        let mut data = &data_bytes[..];
        while data.has_remaining() {
            if data.remaining() < 9 {
                return Err(Error::Truncated);
            }
            let file_id = data.get_i32_le();
            let kind = data.get_i8();
            let size = data.get_i32_le();
            if size < 0 {
                return Err(Error::Corrupted("negative node size"));
            }
            let size = size as usize;

            match kind {
                KIND_LEAF => {
                    let mut leaf = LeafNode::new();
                    for _ in 0..size {
                        leaf.keys.push(K::decode(&mut data)?);
                    }
                    for _ in 0..size {
                        if data.remaining() < 8 {
                            return Err(Error::Truncated);
                        }
                        leaf.values.push(data.get_u64_le());
                    }
                    if data.remaining() < 4 {
                        return Err(Error::Truncated);
                    }
                    leaf_next.push((file_id, data.get_i32_le()));
                    nodes.insert(file_id, self.arena.alloc(Node::Leaf(leaf)));
                }
                KIND_INTERNAL => {
                    let mut internal = InternalNode::new();
                    for _ in 0..size {
                        internal.keys.push(K::decode(&mut data)?);
                    }
                    let mut child_ids = Vec::with_capacity(size + 1);
                    for _ in 0..=size {
                        if data.remaining() < 4 {
                            return Err(Error::Truncated);
                        }
                        child_ids.push(data.get_i32_le());
                    }
                    children_of.push((file_id, child_ids));
                    nodes.insert(file_id, self.arena.alloc(Node::Internal(internal)));
                }
                _ => return Err(Error::Corrupted("unknown node kind")),
            }
        }

        // Second pass: attach children and rebuild the leaf chain.
        for (file_id, child_ids) in &children_of {
            let parent = nodes[file_id];
            let mut guard = self.arena.cell(parent).latch.exclusive();
            let internal = guard.as_internal_mut();
            for child_file_id in child_ids {
                let child = *nodes
                    .get(child_file_id)
                    .ok_or(Error::Corrupted("dangling child id"))?;
                internal.children.push(child);
                self.arena.cell(child).links.set_parent(parent);
            }
        }
        for &(file_id, next_file_id) in &leaf_next {
            if next_file_id == NO_NODE {
                continue;
            }
            let leaf = nodes[&file_id];
            let next = *nodes
                .get(&next_file_id)
                .ok_or(Error::Corrupted("dangling next-leaf id"))?;
            self.arena.cell(leaf).links.set_next(next);
            self.arena.cell(next).links.set_prev(leaf);
        }

        let root = *nodes.get(&root_id).ok_or(Error::Corrupted("dangling root id"))?;
        let head = if head_id == NO_NODE {
            NodeId::NONE
        } else {
            *nodes
                .get(&head_id)
                .ok_or(Error::Corrupted("dangling head-leaf id"))?
        };

        let mut roots = self.root_latch.lock();
        roots.root = root;
        roots.head_leaf = head;
        drop(roots);

        debug!(nodes = nodes.len(), order, "loaded snapshot");
        Ok(())
    }
}
