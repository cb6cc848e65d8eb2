//! A thread-safe, in-memory B+ tree index with latch coupling.
//!
//! Keys are ordered (`i32` or `Vec<u8>` byte strings), values are opaque
//! `u64`s with `0` doubling as the "absent" sentinel of [`BPlusTree::find`].
//! Many readers and writers operate on one logical tree concurrently: each
//! node carries its own reader/writer latch, read descents move
//! hand-over-hand, and write descents hold an exclusive chain that shrinks
//! to the deepest node a structural change could still reach. A quiescent
//! tree can be dumped to and restored from a pair of snapshot files.
//!
//! ```
//! use bptree::BPlusTree;
//!
//! let tree: BPlusTree<i32> = BPlusTree::new(4).unwrap();
//! tree.insert(1, 10);
//! tree.insert(2, 20);
//! tree.insert(1, 11); // upsert
//!
//! assert_eq!(tree.find(&1), 11);
//! assert_eq!(tree.find(&3), 0);
//! assert_eq!(tree.range_find(&1, &2), vec![(1, 11), (2, 20)]);
//!
//! tree.remove(&2);
//! assert_eq!(tree.len(), 1);
//! ```

pub mod debug;
pub mod error;
pub mod key;
pub mod latch;

mod arena;
mod node;
mod snapshot;
mod tree;

#[cfg(test)]
pub(crate) mod util;
#[cfg(test)]
mod bench;

pub use error::{Error, Result};
pub use key::IndexKey;
pub use tree::BPlusTree;
