//! Level-order inspection of the tree structure.
//!
//! Mostly useful in tests, where the returned shape doubles as an oracle
//! for split and merge outcomes, and when eyeballing a small tree.

use crate::key::IndexKey;
use crate::node::Node;
use crate::tree::BPlusTree;

/// Key lists of every node, level by level from the root, each level left
/// to right. Empty for an empty tree. Takes the tree latch exclusively, so
/// the view is quiescent.
pub fn structure<K: IndexKey>(tree: &BPlusTree<K>) -> Vec<Vec<Vec<K>>> {
    let _tree = tree.tree_latch.write();

    let root = tree.root_latch.lock().root;
    if root.is_none() {
        return Vec::new();
    }

    let mut levels = Vec::new();
    let mut frontier = vec![root];

    while !frontier.is_empty() {
        let mut level = Vec::with_capacity(frontier.len());
        let mut next_frontier = Vec::new();

        for id in frontier {
            let guard = tree.arena.cell(id).latch.shared();
            level.push(guard.keys().to_vec());
            if let Node::Internal(internal) = &*guard {
                next_frontier.extend(internal.children.iter().copied());
            }
        }

        levels.push(level);
        frontier = next_frontier;
    }

    levels
}

/// Number of levels; 0 for an empty tree, 1 for a lone root leaf.
pub fn height<K: IndexKey>(tree: &BPlusTree<K>) -> usize {
    structure(tree).len()
}
