#[cfg(test)]
mod stress {
    use crate::util::{check_tree, init_tracing};
    use crate::BPlusTree;

    use std::collections::BTreeMap;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use rand::prelude::*;
    use serial_test::serial;

    #[derive(Clone, Copy)]
    struct Workload {
        threads: usize,
        ops: usize,
        stripe: i32,
    }

    /// Mixed random operations over per-thread key stripes. Each thread is
    /// the only writer of its stripe, so it can assert its own reads and
    /// scans even while the other threads churn, and the final tree must
    /// equal the union of the per-thread oracles.
    fn run_striped(order: usize, workload: Workload) {
        init_tracing();
        let tree = Arc::new(BPlusTree::<i32>::new(order).unwrap());
        let barrier = Arc::new(Barrier::new(workload.threads));

        let mut handles = Vec::new();
        for t in 0..workload.threads {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xb1e55 + t as u64);
                let lo = t as i32 * workload.stripe;
                let hi = lo + workload.stripe;
                let mut oracle: BTreeMap<i32, u64> = BTreeMap::new();

                barrier.wait();
                for _ in 0..workload.ops {
                    let key = rng.gen_range(lo..hi);
                    match rng.gen_range(0..10) {
                        0..=5 => {
                            let value = rng.gen_range(1..u64::MAX);
                            tree.insert(key, value);
                            oracle.insert(key, value);
                        }
                        6..=7 => {
                            tree.remove(&key);
                            oracle.remove(&key);
                        }
                        8 => {
                            let expected = oracle.get(&key).copied().unwrap_or(0);
                            assert_eq!(tree.find(&key), expected);
                        }
                        _ => {
                            let end = (key + 49).min(hi - 1);
                            let found = tree.range_find(&key, &end);
                            // other stripes may interleave, but entries of
                            // our own stripe must match our oracle exactly
                            for (k, v) in &found {
                                if *k >= lo && *k < hi {
                                    assert_eq!(oracle.get(k), Some(v));
                                }
                            }
                            for (&k, &v) in oracle.range(key..=end) {
                                assert!(found.contains(&(k, v)), "missing own key {k} in scan");
                            }
                        }
                    }
                }
                oracle
            }));
        }

        let mut expected: BTreeMap<i32, u64> = BTreeMap::new();
        for handle in handles {
            expected.extend(handle.join().unwrap());
        }

        check_tree(&tree);
        assert_eq!(tree.len(), expected.len());
        let all = tree.range_find(&i32::MIN, &i32::MAX);
        assert_eq!(all.len(), expected.len());
        for ((got_k, got_v), (&want_k, &want_v)) in all.iter().zip(expected.iter()) {
            assert_eq!((*got_k, *got_v), (want_k, want_v));
        }
    }

    #[test]
    #[serial]
    fn striped_mixed_ops_order_3() {
        run_striped(
            3,
            Workload {
                threads: 8,
                ops: 3000,
                stripe: 4096,
            },
        );
    }

    #[test]
    #[serial]
    fn striped_mixed_ops_order_16() {
        run_striped(
            16,
            Workload {
                threads: 8,
                ops: 3000,
                stripe: 4096,
            },
        );
    }

    /// Concurrent upserts of the same keys must serialize on the leaf
    /// latch: every key ends with the value of whichever writer came last,
    /// never a torn or lost state.
    #[test]
    #[serial]
    fn same_key_upserts() {
        init_tracing();
        const THREADS: u64 = 8;
        const KEYS: i32 = 256;
        const ROUNDS: usize = 200;

        let tree = Arc::new(BPlusTree::<i32>::new(3).unwrap());
        for k in 0..KEYS {
            tree.insert(k, u64::MAX);
        }

        let barrier = Arc::new(Barrier::new(THREADS as usize));
        let mut handles = Vec::new();
        for t in 1..=THREADS {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    for k in 0..KEYS {
                        tree.insert(k, t);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        check_tree(&tree);
        assert_eq!(tree.len(), KEYS as usize);
        for k in 0..KEYS {
            let value = tree.find(&k);
            assert!((1..=THREADS).contains(&value), "key {k} has value {value}");
        }
    }

    /// Disjoint-range inserts from many threads, then sequential
    /// verification of every key.
    #[test]
    #[serial]
    fn disjoint_inserts_then_verify() {
        init_tracing();
        const THREADS: usize = 10;
        const PER_THREAD: i32 = 1000;

        let tree = Arc::new(BPlusTree::<i32>::new(4).unwrap());
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                let base = t as i32 * PER_THREAD;
                for i in 0..PER_THREAD {
                    tree.insert(base + i, (base + i) as u64 * 10);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        check_tree(&tree);
        assert_eq!(tree.len(), THREADS * PER_THREAD as usize);
        for k in 0..(THREADS as i32 * PER_THREAD) {
            assert_eq!(tree.find(&k), k as u64 * 10);
        }
    }

    /// Snapshots under load: serialization takes the tree latch exclusively
    /// and must observe a consistent tree no matter how many mutators are
    /// in flight.
    #[test]
    #[serial]
    fn serialize_races_mutators() {
        init_tracing();
        const WRITERS: usize = 4;
        const PER_THREAD: i32 = 2000;

        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("under-load");
        let tree = Arc::new(BPlusTree::<i32>::new(3).unwrap());
        tree.insert(-1, 1);

        let mut handles = Vec::new();
        for t in 0..WRITERS {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                let lo = t as i32 * PER_THREAD;
                for i in lo..lo + PER_THREAD {
                    tree.insert(i, i as u64 + 1);
                    if i % 3 == 0 {
                        tree.remove(&i);
                    }
                }
            }));
        }
        {
            let tree = Arc::clone(&tree);
            let base = base.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    tree.serialize(&base).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // the last snapshot wins; it must load into a structurally sound tree
        tree.serialize(&base).unwrap();
        let loaded = BPlusTree::<i32>::new(3).unwrap();
        loaded.deserialize(&base).unwrap();
        check_tree(&loaded);
        assert_eq!(loaded.len(), tree.len());
        assert_eq!(
            loaded.range_find(&i32::MIN, &i32::MAX),
            tree.range_find(&i32::MIN, &i32::MAX)
        );
    }
}
