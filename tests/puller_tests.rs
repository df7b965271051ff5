//! Puller behavior against scripted stores: batching efficiency, idle
//! traffic, failure fan-out, and recovery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use manifold::attach::EventStream;
use manifold::config::PullerConfig;
use manifold::log::BatchSource;
use manifold::puller::Puller;
use manifold::registry::Registry;
use manifold::{Cursor, ManifoldError, Record, RecordId};
use tokio_util::sync::CancellationToken;

// ==========================================
// SCRIPTED STORE
// ==========================================

#[derive(Clone, Default)]
struct ScriptedStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    records: Mutex<HashMap<String, Vec<Record>>>,
    calls: AtomicUsize,
    max_keys_per_call: AtomicUsize,
    failing: AtomicBool,
}

impl ScriptedStore {
    fn push(&self, key: &str, timestamp_ms: u64, sequence: u32, payload: &str) {
        let record = Record {
            key: key.to_string(),
            id: RecordId { timestamp_ms, sequence },
            payload: payload.as_bytes().to_vec().into(),
        };
        self.inner.records.lock().unwrap().entry(key.to_string()).or_default().push(record);
    }

    fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    fn max_keys_per_call(&self) -> usize {
        self.inner.max_keys_per_call.load(Ordering::SeqCst)
    }
}

impl BatchSource for ScriptedStore {
    fn read_batch(
        &self,
        cursors: HashMap<String, Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Record>, ManifoldError>> + Send {
        let inner = self.inner.clone();
        async move {
            inner.calls.fetch_add(1, Ordering::SeqCst);
            inner.max_keys_per_call.fetch_max(cursors.len(), Ordering::SeqCst);
            if inner.failing.load(Ordering::SeqCst) {
                return Err(ManifoldError::StoreUnavailable("injected failure".into()));
            }
            let map = inner.records.lock().unwrap();
            let mut out = Vec::new();
            for (key, cursor) in &cursors {
                if let Some(records) = map.get(key) {
                    out.extend(
                        records
                            .iter()
                            .filter(|r| r.id >= cursor.position())
                            .take(limit)
                            .cloned(),
                    );
                }
            }
            Ok(out)
        }
    }
}

fn fast_cfg() -> PullerConfig {
    PullerConfig {
        idle_poll_ms: 10,
        min_cycle_ms: 5,
        read_timeout_ms: 500,
        backoff_base_ms: 20,
        backoff_ceiling_ms: 100,
        batch_limit: 100,
    }
}

fn start(store: &ScriptedStore, registry: &Arc<Registry>) -> CancellationToken {
    let shutdown = CancellationToken::new();
    Puller::new(store.clone(), registry.clone(), fast_cfg(), shutdown.clone()).spawn();
    shutdown
}

async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ==========================================
// TESTS
// ==========================================

mod features {
    use super::*;

    #[tokio::test]
    async fn test_idle_keys_cause_zero_reads() {
        let registry = Arc::new(Registry::new(16));
        let store = ScriptedStore::default();
        store.push("k1", 1, 0, "a");
        let shutdown = start(&store, &registry);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.calls(), 0, "no sinks, so no store traffic");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_n_keys_covered_by_one_batched_read() {
        let registry = Arc::new(Registry::new(16));
        let store = ScriptedStore::default();
        store.push("k1", 1, 0, "a");
        store.push("k2", 1, 0, "b");
        store.push("k3", 1, 0, "c");
        let shutdown = start(&store, &registry);

        let mut a1 = registry.attach("k1", Cursor::ZERO);
        let mut a2 = registry.attach("k2", Cursor::ZERO);
        let mut a3 = registry.attach("k3", Cursor::ZERO);

        let r1 = tokio::time::timeout(Duration::from_secs(2), a1.rx.recv()).await.unwrap().unwrap();
        let r2 = tokio::time::timeout(Duration::from_secs(2), a2.rx.recv()).await.unwrap().unwrap();
        let r3 = tokio::time::timeout(Duration::from_secs(2), a3.rx.recv()).await.unwrap().unwrap();
        assert_eq!(r1.payload, "a");
        assert_eq!(r2.payload, "b");
        assert_eq!(r3.payload, "c");

        // Once all three keys are live, a single read covers all of them.
        wait_until(|| store.max_keys_per_call() == 3, "one batched read spanning 3 keys").await;

        // Cursors advanced: nothing is delivered twice.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a1.rx.try_recv().is_err(), "k1 record re-delivered");
        assert!(a2.rx.try_recv().is_err(), "k2 record re-delivered");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_store_failure_fails_sinks_and_recovery_serves_new_attaches() {
        let registry = Arc::new(Registry::new(16));
        let store = ScriptedStore::default();
        store.push("k1", 1, 0, "a");
        let shutdown = start(&store, &registry);

        let mut stream = EventStream::open(registry.clone(), "k1", Cursor::ZERO, Duration::from_secs(60));
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(record))) => assert_eq!(record.payload, "a"),
            other => panic!("expected first record, got {:?}", other),
        }

        store.set_failing(true);
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Err(ManifoldError::StoreUnavailable(_)))) => {}
            other => panic!("expected StoreUnavailable terminal, got {:?}", other),
        }
        assert!(tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap().is_none());

        // The loop kept running; a healthy store serves fresh attachments.
        store.set_failing(false);
        let mut resumed = EventStream::open(registry.clone(), "k1", Cursor::ZERO, Duration::from_secs(60));
        match tokio::time::timeout(Duration::from_secs(2), resumed.next()).await {
            Ok(Some(Ok(record))) => assert_eq!(record.payload, "a"),
            other => panic!("expected record after recovery, got {:?}", other),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_records_dispatched_in_id_order_even_if_read_interleaves() {
        let registry = Arc::new(Registry::new(16));
        let store = ScriptedStore::default();
        // Same millisecond, tie-break sequence decides; pushed out of order
        // relative to another key to force regrouping.
        store.push("k1", 5, 0, "first");
        store.push("k2", 5, 0, "other");
        store.push("k1", 5, 1, "second");
        store.push("k1", 6, 0, "third");
        let shutdown = start(&store, &registry);

        let mut att = registry.attach("k1", Cursor::ZERO);
        let mut got = Vec::new();
        for _ in 0..3 {
            let record = tokio::time::timeout(Duration::from_secs(2), att.rx.recv()).await.unwrap().unwrap();
            got.push(record);
        }
        let order: Vec<&[u8]> = got.iter().map(|r| r.payload.as_ref()).collect();
        assert_eq!(order, vec![b"first".as_ref(), b"second".as_ref(), b"third".as_ref()]);
        assert!(got[0].id < got[1].id && got[1].id < got[2].id);

        shutdown.cancel();
    }
}
