use kvhandle::config::StoreConfig;
use kvhandle::engine::memory::MemoryBackend;
use kvhandle::engine::{EngineError, NativeCursor, NativeStore, SnapshotToken, StoreBackend};
use kvhandle::{HandleRuntime, IterStep, ReadOptions, RuntimeConfig, SnapshotChoice};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Backend whose cursors step slowly on prefetch workers only.
struct SlowBackend {
    inner: Arc<MemoryBackend>,
    delay: Duration,
}

struct SlowStore {
    inner: Box<dyn NativeStore>,
    delay: Duration,
}

struct SlowCursor {
    inner: Box<dyn NativeCursor>,
    delay: Duration,
}

fn on_prefetch_worker() -> bool {
    std::thread::current()
        .name()
        .is_some_and(|name| name.starts_with("kvhandle-prefetch"))
}

impl StoreBackend for SlowBackend {
    fn open(&self, path: &Path, config: &StoreConfig) -> Result<Box<dyn NativeStore>, EngineError> {
        Ok(Box::new(SlowStore {
            inner: self.inner.open(path, config)?,
            delay: self.delay,
        }))
    }
}

impl NativeStore for SlowStore {
    fn get(
        &self,
        key: &[u8],
        snapshot: Option<SnapshotToken>,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        self.inner.get(key, snapshot)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.inner.delete(key)
    }

    fn create_snapshot(&self) -> SnapshotToken {
        self.inner.create_snapshot()
    }

    fn release_snapshot(&self, snapshot: SnapshotToken) {
        self.inner.release_snapshot(snapshot)
    }

    fn new_cursor(
        &self,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Box<dyn NativeCursor>, EngineError> {
        Ok(Box::new(SlowCursor {
            inner: self.inner.new_cursor(snapshot)?,
            delay: self.delay,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.inner.close()
    }
}

impl NativeCursor for SlowCursor {
    fn seek_to_first(&mut self) {
        self.inner.seek_to_first()
    }

    fn seek_to_last(&mut self) {
        self.inner.seek_to_last()
    }

    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target)
    }

    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn next(&mut self) {
        if on_prefetch_worker() {
            std::thread::sleep(self.delay);
        }
        self.inner.next()
    }

    fn prev(&mut self) {
        self.inner.prev()
    }
}

fn slow_runtime(delay: Duration, handoff_wait_us: u64) -> (Arc<MemoryBackend>, HandleRuntime) {
    let memory = Arc::new(MemoryBackend::new());
    let backend = SlowBackend {
        inner: Arc::clone(&memory),
        delay,
    };
    let rt = HandleRuntime::new(
        RuntimeConfig {
            prefetch_worker_threads: 1,
            handoff_wait_us,
            ..RuntimeConfig::default()
        },
        Arc::new(backend),
    )
    .expect("runtime");
    (memory, rt)
}

fn collect_prefetched(
    rt: &HandleRuntime,
    dir: &Path,
    options: ReadOptions,
    entries: u64,
) -> Vec<u64> {
    let store = rt
        .open_store(
            dir,
            StoreConfig {
                persist_on_close: false,
                ..StoreConfig::create_if_missing()
            },
        )
        .expect("store");
    for n in 0..entries {
        rt.put(store, &n.to_be_bytes(), b"v").expect("put");
    }
    let it = rt.open_iterator(store, true, options).expect("iterator");
    let mut seen = Vec::new();
    while let IterStep::Entry { key, .. } = rt.iterator_prefetch(it).expect("step") {
        let key: [u8; 8] = key.as_slice().try_into().expect("8-byte key");
        seen.push(u64::from_be_bytes(key));
    }
    rt.close_iterator(it).expect("close");
    rt.close_store(store).expect("close store");
    seen
}

#[test]
fn slow_prefetch_falls_back_without_losing_position() {
    let dir = tempdir().expect("temp");
    let (memory, rt) = slow_runtime(Duration::from_millis(20), 1_000);
    let seen = collect_prefetched(&rt, dir.path(), ReadOptions::default(), 10);
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert!(
        memory.stats().cursors_opened > 1,
        "host calls should have moved to fresh cursors"
    );
    assert_eq!(rt.stats().invariant_violations, 0);
    rt.shutdown();
    let stats = memory.stats();
    assert_eq!(stats.live_cursors(), 0);
    assert_eq!(stats.live_stores(), 0);
}

#[test]
fn fallback_cursor_reads_the_same_snapshot() {
    let dir = tempdir().expect("temp");
    let (memory, rt) = slow_runtime(Duration::from_millis(20), 1_000);
    let seen = collect_prefetched(
        &rt,
        dir.path(),
        ReadOptions {
            snapshot: SnapshotChoice::Fresh,
            ..ReadOptions::default()
        },
        6,
    );
    assert_eq!(seen, (0..6).collect::<Vec<_>>());
    rt.shutdown();
    let stats = memory.stats();
    assert_eq!(stats.live_snapshots(), 0);
    assert_eq!(stats.snapshots_released, 1);
    assert_eq!(stats.unknown_snapshot_releases, 0);
}

#[test]
fn prefetch_within_the_wait_keeps_one_cursor() {
    let dir = tempdir().expect("temp");
    let (memory, rt) = slow_runtime(Duration::from_millis(1), 2_000_000);
    let seen = collect_prefetched(&rt, dir.path(), ReadOptions::default(), 25);
    assert_eq!(seen, (0..25).collect::<Vec<_>>());
    assert_eq!(memory.stats().cursors_opened, 1);
    rt.shutdown();
}
