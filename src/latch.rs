//! Per-node reader/writer latch.
//!
//! A latch is a short-term physical lock on one node's in-memory state.
//! Traversals use them cooperatively: read descents hold one shared latch
//! at a time, taking the child's before releasing the parent's
//! (hand-over-hand), while write descents keep a chain of exclusive latches
//! from the deepest ancestor that might still absorb a structural change
//! down to the leaf. Acquisition is always top-down in the tree and
//! left-to-right along the leaf chain, which is what makes blocking
//! acquisition deadlock-free.
//!
//! Guards are RAII: dropping a guard releases the latch. An exclusive guard
//! is the only way to get `&mut` access to the node payload.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct NodeLatch<T> {
    lock: RwLock<T>,
}

impl<T> NodeLatch<T> {
    #[inline]
    pub fn new(data: T) -> NodeLatch<T> {
        NodeLatch { lock: RwLock::new(data) }
    }

    /// Acquires shared read access, blocking until no writer holds the
    /// latch.
    #[inline]
    pub fn shared(&self) -> SharedGuard<'_, T> {
        SharedGuard { guard: self.lock.read() }
    }

    /// Acquires exclusive write access, blocking until all readers and
    /// writers have released the latch.
    #[inline]
    pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
        ExclusiveGuard { guard: self.lock.write() }
    }

    /// Direct access through `&mut self`, for contexts that own the latch
    /// outright (construction, teardown).
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.lock.get_mut()
    }
}

/// RAII guard releasing shared access on drop.
pub struct SharedGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
}

impl<'a, T> std::ops::Deref for SharedGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

/// RAII guard releasing exclusive access on drop.
pub struct ExclusiveGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
}

impl<'a, T> std::ops::Deref for ExclusiveGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> std::ops::DerefMut for ExclusiveGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::NodeLatch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn exclusive_is_mutually_exclusive() {
        let latch = Arc::new(NodeLatch::new(0usize));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let latch = latch.clone();
            let running = running.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    let mut guard = latch.exclusive();
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    *guard += 1;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*latch.shared(), 40_000);
    }

    #[test]
    fn readers_share() {
        let latch = NodeLatch::new(7usize);
        let a = latch.shared();
        let b = latch.shared();
        assert_eq!(*a + *b, 14);
    }
}
