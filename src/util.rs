//! Test support: structural invariant checking and tracing setup.

use std::sync::Once;

use crate::arena::NodeId;
use crate::key::IndexKey;
use crate::node::Node;
use crate::tree::BPlusTree;

static INIT: Once = Once::new();

/// Installs a fmt subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call takes effect.
pub(crate) fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Walks the whole tree and asserts every structural invariant:
///
/// - internal nodes have exactly `size + 1` children, keys strictly
///   ascending, every reachable key within the separator bounds
/// - every leaf sits at the same depth and carries one value per key
/// - every non-root node links back to its parent and respects the
///   occupancy bounds (`size` in `[order / 2, order]`); an internal root
///   holds at least one key
/// - the head leaf is the leftmost leaf, the chain visits the leaves in key
///   order, and every `next` link has a matching `prev`
///
/// Takes the tree latch exclusively, so it sees a quiescent tree.
pub(crate) fn check_tree<K: IndexKey>(tree: &BPlusTree<K>) {
    let _quiesce = tree.tree_latch.write();

    let (root, head) = {
        let roots = tree.root_latch.lock();
        (roots.root, roots.head_leaf)
    };

    if root.is_none() {
        assert!(head.is_none(), "head leaf without a root");
        return;
    }

    let order = tree.order();
    let mut leaves = Vec::new();
    check_node(tree, root, root, NodeId::NONE, None, None, order, 0, &mut None, &mut leaves);

    assert_eq!(head, leaves[0], "head leaf is not the leftmost leaf");

    // chain forward
    for (i, &leaf) in leaves.iter().enumerate() {
        let cell = tree.arena.cell(leaf);
        let expected_next = leaves.get(i + 1).copied().unwrap_or(NodeId::NONE);
        let expected_prev = if i == 0 { NodeId::NONE } else { leaves[i - 1] };
        assert_eq!(cell.links.next(), expected_next, "broken next link at leaf {i}");
        assert_eq!(cell.links.prev(), expected_prev, "broken prev link at leaf {i}");
    }
}

#[allow(clippy::too_many_arguments)]
fn check_node<K: IndexKey>(
    tree: &BPlusTree<K>,
    id: NodeId,
    root: NodeId,
    expected_parent: NodeId,
    lower: Option<&K>,
    upper: Option<&K>,
    order: usize,
    depth: usize,
    leaf_depth: &mut Option<usize>,
    leaves: &mut Vec<NodeId>,
) {
    let cell = tree.arena.cell(id);
    assert_eq!(
        cell.links.parent(),
        expected_parent,
        "parent link mismatch at depth {depth}"
    );

    let guard = cell.latch.shared();
    let keys = guard.keys();

    for window in keys.windows(2) {
        assert!(window[0] < window[1], "keys not strictly ascending");
    }
    if let Some(lower) = lower {
        assert!(
            keys.iter().all(|k| k >= lower),
            "key below the separator bound"
        );
    }
    if let Some(upper) = upper {
        assert!(
            keys.iter().all(|k| k < upper),
            "key at or above the separator bound"
        );
    }

    let len = keys.len();
    if id == root {
        if !guard.is_leaf() {
            assert!(len >= 1, "settled internal root must hold a key");
        }
    } else {
        assert!(len >= order / 2, "node below the occupancy floor");
        assert!(len <= order, "node above the occupancy ceiling");
    }

    match &*guard {
        Node::Leaf(leaf) => {
            assert_eq!(leaf.values.len(), len, "leaf values out of step with keys");
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) => assert_eq!(depth, expected, "leaves at different depths"),
            }
            leaves.push(id);
        }
        Node::Internal(internal) => {
            assert_eq!(
                internal.children.len(),
                len + 1,
                "child count is not key count + 1"
            );
            for (i, &child) in internal.children.iter().enumerate() {
                let child_lower = if i == 0 { lower } else { Some(&keys[i - 1]) };
                let child_upper = if i < len { Some(&keys[i]) } else { upper };
                check_node(
                    tree,
                    child,
                    root,
                    id,
                    child_lower,
                    child_upper,
                    order,
                    depth + 1,
                    leaf_depth,
                    leaves,
                );
            }
        }
    }
}
