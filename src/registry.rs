//! Subscription Registry: concurrent map from key to its live stream handle.
//!
//! Attach/detach come from many caller tasks; dispatch/advance/fail come from
//! the single puller. DashMap gives entry-level locking, so per-key changes
//! never contend on a global lock and attach latency is independent of how
//! many other keys have subscribers.
//!
//! Handles carry an epoch: a generation stamp assigned at creation. The
//! puller passes back the epoch it observed at snapshot time, and any
//! mutation against a handle that was destroyed and re-created since is
//! dropped instead of corrupting the fresh handle's cursor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

use crate::error::ManifoldError;
use crate::record::{Cursor, Record};
use crate::snapshot::{EngineSnapshot, KeySnapshot};

// ==========================================
// HANDLES & SINKS
// ==========================================

/// Shared cell carrying the terminal signal a consumer reads after its
/// record channel drains. None means a clean, consumer-initiated end.
pub(crate) type TerminalCell = Arc<Mutex<Option<ManifoldError>>>;

struct SinkSlot {
    id: Uuid,
    tx: mpsc::Sender<Record>,
    term: TerminalCell,
}

struct StreamHandle {
    epoch: u64,
    cursor: Cursor,
    sinks: Vec<SinkSlot>,
}

/// What `attach` hands back: the receive half of the sink plus the shared
/// terminal cell. `EventStream` wraps this; tests may drive it directly.
pub struct Attachment {
    pub sink_id: Uuid,
    pub rx: mpsc::Receiver<Record>,
    pub(crate) term: TerminalCell,
}

/// One entry of a point-in-time snapshot of keys with live sinks.
#[derive(Clone, Debug)]
pub struct ActiveKey {
    pub key: String,
    pub epoch: u64,
    pub cursor: Cursor,
}

// ==========================================
// REGISTRY
// ==========================================

pub struct Registry {
    streams: DashMap<String, StreamHandle>,
    sink_capacity: usize,
    closed: AtomicBool,
    next_epoch: AtomicU64,
}

impl Registry {
    pub fn new(sink_capacity: usize) -> Self {
        Self {
            streams: DashMap::new(),
            sink_capacity,
            closed: AtomicBool::new(false),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Add a sink for `key`. Creates the handle on first attach, seeding its
    /// cursor with `from`; later sinks join the live cursor and their `from`
    /// is ignored. Never blocks. After `close` the attachment comes back
    /// already terminated with `AttachAfterShutdown`.
    pub fn attach(&self, key: &str, from: Cursor) -> Attachment {
        let (tx, rx) = mpsc::channel(self.sink_capacity);
        let term: TerminalCell = Arc::new(Mutex::new(None));
        let sink_id = Uuid::new_v4();

        if self.closed.load(Ordering::SeqCst) {
            *term.lock() = Some(ManifoldError::AttachAfterShutdown);
            drop(tx);
            return Attachment { sink_id, rx, term };
        }

        {
            let mut handle = self.streams.entry(key.to_string()).or_insert_with(|| StreamHandle {
                epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
                cursor: from,
                sinks: Vec::new(),
            });
            handle.sinks.push(SinkSlot { id: sink_id, tx, term: term.clone() });
        }

        // close() may have drained the map between the flag check and the
        // insert; an attachment must not outlive teardown unseen.
        if self.closed.load(Ordering::SeqCst) {
            self.detach(key, sink_id);
            *term.lock() = Some(ManifoldError::AttachAfterShutdown);
        }

        Attachment { sink_id, rx, term }
    }

    /// Remove one sink. Idempotent; removing the last sink reclaims the
    /// whole handle, so idle keys cost the puller nothing.
    pub fn detach(&self, key: &str, sink_id: Uuid) {
        let mut emptied = false;
        if let Some(mut handle) = self.streams.get_mut(key) {
            handle.sinks.retain(|s| s.id != sink_id);
            emptied = handle.sinks.is_empty();
        }
        if emptied {
            self.streams.remove_if(key, |_, handle| handle.sinks.is_empty());
        }
    }

    /// Point-in-time list of keys with at least one sink, for the puller to
    /// build its next batched read.
    pub fn snapshot_active(&self) -> Vec<ActiveKey> {
        self.streams
            .iter()
            .map(|entry| ActiveKey {
                key: entry.key().clone(),
                epoch: entry.value().epoch,
                cursor: entry.value().cursor,
            })
            .collect()
    }

    /// Push one record to every sink currently attached to `key`. The sink
    /// set is re-read here, not taken from the puller's snapshot, so sinks
    /// attached mid-cycle are included. Returns how many sinks accepted it.
    ///
    /// A full sink buffer terminates that one sink with `SinkSaturated`:
    /// dropping records would break per-sink ordering, and blocking would let
    /// one slow consumer stall every other sink of the key.
    pub fn dispatch(&self, key: &str, epoch: u64, record: Record) -> usize {
        let mut delivered = 0;
        let mut emptied = false;
        if let Some(mut handle) = self.streams.get_mut(key) {
            if handle.epoch != epoch {
                return 0;
            }
            handle.sinks.retain(|sink| match sink.tx.try_send(record.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("[Registry] Sink {} on '{}' saturated, cutting subscriber", sink.id, key);
                    *sink.term.lock() = Some(ManifoldError::SinkSaturated);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
            emptied = handle.sinks.is_empty();
        }
        if emptied {
            self.streams.remove_if(key, |_, handle| handle.sinks.is_empty());
        }
        delivered
    }

    /// Advance a key's cursor after a cycle's records were handed to all of
    /// its sinks. Monotonic, and fenced by the snapshot epoch.
    pub fn advance(&self, key: &str, epoch: u64, cursor: Cursor) {
        if let Some(mut handle) = self.streams.get_mut(key) {
            if handle.epoch == epoch && cursor > handle.cursor {
                handle.cursor = cursor;
            }
        }
    }

    /// Terminal error to every sink of `key`, clearing the handle. Used by
    /// the puller when a batched read fails.
    pub fn fail(&self, key: &str, epoch: u64, error: ManifoldError) {
        if let Some((_, handle)) = self.streams.remove_if(key, |_, h| h.epoch == epoch) {
            for sink in handle.sinks {
                *sink.term.lock() = Some(error.clone());
                // dropping the slot closes the channel; the consumer drains
                // what was buffered and then observes the terminal
            }
        }
    }

    /// Teardown: reject future attaches and fail every live sink.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let keys: Vec<String> = self.streams.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.streams.remove(&key) {
                for sink in handle.sinks {
                    *sink.term.lock() = Some(ManifoldError::Shutdown);
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn observe(&self) -> EngineSnapshot {
        let mut keys = Vec::new();
        let mut total_sinks = 0;
        for entry in self.streams.iter() {
            let handle = entry.value();
            total_sinks += handle.sinks.len();
            keys.push(KeySnapshot {
                key: entry.key().clone(),
                cursor: handle.cursor,
                sinks: handle.sinks.len(),
            });
        }
        EngineSnapshot {
            closed: self.is_closed(),
            total_keys: keys.len(),
            total_sinks,
            keys,
        }
    }
}
