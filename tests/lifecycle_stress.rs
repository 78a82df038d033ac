use kvhandle::engine::memory::MemoryBackend;
use kvhandle::{
    HandleRuntime, IterStep, KvHandleErrorCode, ReadOptions, RuntimeConfig, SnapshotChoice,
    StoreConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tempfile::tempdir;

fn stress_scale() -> usize {
    std::env::var("KVHANDLE_STRESS_SCALE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1)
}

fn scaled(base: usize) -> usize {
    base.saturating_mul(stress_scale())
}

fn seeded(rt: &HandleRuntime, path: &std::path::Path, entries: u64) -> kvhandle::StoreRef {
    let store = rt
        .open_store(path, StoreConfig::create_if_missing())
        .expect("open store");
    for n in 0..entries {
        rt.put(store, &n.to_be_bytes(), &n.to_le_bytes()).expect("put");
    }
    store
}

fn tolerated(code: KvHandleErrorCode) -> bool {
    matches!(
        code,
        KvHandleErrorCode::IteratorNotFound
            | KvHandleErrorCode::IteratorClosing
            | KvHandleErrorCode::Busy
    )
}

#[test]
fn concurrent_readers_and_closers_leave_nothing_behind() {
    let dir = tempdir().expect("temp");
    let backend = Arc::new(MemoryBackend::new());
    let rt = Arc::new(
        HandleRuntime::new(
            RuntimeConfig {
                prefetch_worker_threads: 4,
                ..RuntimeConfig::default()
            },
            Arc::clone(&backend) as _,
        )
        .expect("runtime"),
    );
    let violations_before = rt.stats().invariant_violations;
    let store = seeded(&rt, dir.path(), 2_000);
    let rounds = scaled(40);
    let delivered = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::new();
    for worker in 0..6usize {
        let rt = Arc::clone(&rt);
        let delivered = Arc::clone(&delivered);
        workers.push(thread::spawn(move || {
            for round in 0..rounds {
                let snapshot = if (worker + round) % 2 == 0 {
                    SnapshotChoice::Fresh
                } else {
                    SnapshotChoice::Latest
                };
                let it = rt
                    .open_iterator(
                        store,
                        round % 3 == 0,
                        ReadOptions {
                            snapshot,
                            ..ReadOptions::default()
                        },
                    )
                    .expect("iterator");

                // A second thread races the reader to close the same iterator.
                let closer = {
                    let rt = Arc::clone(&rt);
                    thread::spawn(move || {
                        thread::yield_now();
                        match rt.close_iterator(it) {
                            Ok(()) => {}
                            Err(err) => assert!(err.is_not_found(), "close: {err}"),
                        }
                    })
                };
                let mut last: Option<Vec<u8>> = None;
                loop {
                    match rt.iterator_prefetch(it) {
                        Ok(IterStep::Entry { key, .. }) => {
                            if let Some(prev) = &last {
                                assert!(key > *prev, "keys must increase");
                            }
                            last = Some(key);
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(IterStep::Exhausted) => break,
                        Err(err) if tolerated(err.code()) => break,
                        Err(err) => panic!("unexpected iterator error: {err}"),
                    }
                }
                closer.join().expect("closer");
                let _ = rt.close_iterator(it);
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }

    assert!(delivered.load(Ordering::Relaxed) > 0);
    let rt = Arc::try_unwrap(rt).unwrap_or_else(|_| panic!("runtime still shared"));
    assert_eq!(rt.stats().open_iterators, 0);
    assert_eq!(rt.stats().invariant_violations, violations_before);
    rt.destroy_store(store).expect("destroy store");
    let stats = backend.stats();
    assert_eq!(stats.live_cursors(), 0);
    assert_eq!(stats.live_snapshots(), 0);
    assert_eq!(stats.live_stores(), 0);
    rt.shutdown();
}

#[test]
fn shared_snapshot_survives_racing_iterator_closes() {
    let dir = tempdir().expect("temp");
    let backend = Arc::new(MemoryBackend::new());
    let rt = Arc::new(
        HandleRuntime::new(RuntimeConfig::default(), Arc::clone(&backend) as _)
            .expect("runtime"),
    );
    let store = seeded(&rt, dir.path(), 256);
    let rounds = scaled(20);

    for _ in 0..rounds {
        let snap = rt.create_snapshot(store, None).expect("snapshot");
        let options = ReadOptions {
            snapshot: SnapshotChoice::Existing(snap),
            ..ReadOptions::default()
        };
        let iterators: Vec<_> = (0..8)
            .map(|_| {
                rt.open_iterator(store, false, options.clone())
                    .expect("iterator")
            })
            .collect();
        rt.release_snapshot(snap).expect("host release");
        let released_before = backend.stats().snapshots_released;

        let handles: Vec<_> = iterators
            .into_iter()
            .map(|it| {
                let rt = Arc::clone(&rt);
                thread::spawn(move || {
                    let mut count = 0u64;
                    while !rt.iterator_prefetch(it).expect("step").is_exhausted() {
                        count += 1;
                    }
                    rt.destroy_iterator(it).expect("destroy");
                    count
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("reader"), 256);
        }
        assert_eq!(backend.stats().snapshots_released, released_before + 1);
    }

    let stats = backend.stats();
    assert_eq!(stats.unknown_snapshot_releases, 0);
    assert_eq!(stats.live_snapshots(), 0);
}

#[test]
fn store_stays_open_while_any_iterator_holds_it() {
    let dir = tempdir().expect("temp");
    let backend = Arc::new(MemoryBackend::new());
    let rt = HandleRuntime::new(RuntimeConfig::default(), Arc::clone(&backend) as _)
        .expect("runtime");
    let store = seeded(&rt, dir.path(), 64);
    let iterators: Vec<_> = (0..4)
        .map(|_| {
            rt.open_iterator(store, true, ReadOptions::default())
                .expect("iterator")
        })
        .collect();
    rt.close_store(store).expect("close store");

    for (i, it) in iterators.iter().enumerate() {
        assert_eq!(backend.stats().stores_closed, 0);
        let mut seen = 0;
        while !rt.iterator_prefetch(*it).expect("step").is_exhausted() {
            seen += 1;
        }
        assert_eq!(seen, 64);
        if i % 2 == 0 {
            rt.destroy_iterator(*it).expect("destroy");
        } else {
            rt.close_iterator(*it).expect("close");
        }
    }
    rt.shutdown();
    assert_eq!(backend.stats().stores_closed, 1);
    assert_eq!(backend.stats().live_cursors(), 0);
}
