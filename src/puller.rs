//! Puller: the single continuously-running pull-and-dispatch loop.
//!
//! Each cycle: snapshot the registry's active keys, issue ONE batched read
//! against the append log covering all of them, fan the returned records out
//! per key in id order, then advance each key's cursor. N subscribed keys
//! cost one store round trip, not N.
//!
//! The loop is fault-isolated: a failed read fails the affected subscribers
//! (they reconnect from an offset of their choosing) and backs off, a
//! panicking cycle task is logged and respawned. Nothing short of process
//! shutdown stops it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PullerConfig;
use crate::error::ManifoldError;
use crate::log::BatchSource;
use crate::record::{Cursor, Record};
use crate::registry::{ActiveKey, Registry};

// ==========================================
// BACKOFF
// ==========================================

struct Backoff {
    base: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Backoff {
    fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling, next: base }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.ceiling);
        delay
    }

    fn reset(&mut self) {
        self.next = self.base;
    }
}

// ==========================================
// PULLER
// ==========================================

pub struct Puller<S: BatchSource> {
    store: S,
    registry: Arc<Registry>,
    cfg: PullerConfig,
    shutdown: CancellationToken,
}

impl<S: BatchSource> Puller<S> {
    pub fn new(store: S, registry: Arc<Registry>, cfg: PullerConfig, shutdown: CancellationToken) -> Self {
        Self { store, registry, cfg, shutdown }
    }

    /// Run supervised: the loop task is respawned if it ever aborts, so one
    /// bad cycle can never take the subsystem down.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.supervise())
    }

    async fn supervise(self) {
        loop {
            let worker = Puller {
                store: self.store.clone(),
                registry: self.registry.clone(),
                cfg: self.cfg.clone(),
                shutdown: self.shutdown.clone(),
            };
            match tokio::spawn(worker.run()).await {
                Ok(()) => break, // clean shutdown
                Err(err) => {
                    error!("[Puller] Loop aborted: {}. Restarting", err);
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(self.cfg.backoff_base_ms)).await;
                }
            }
        }
    }

    async fn run(self) {
        info!("[Puller] Started");
        let mut backoff = Backoff::new(
            Duration::from_millis(self.cfg.backoff_base_ms),
            Duration::from_millis(self.cfg.backoff_ceiling_ms),
        );
        let idle = Duration::from_millis(self.cfg.idle_poll_ms);
        let cycle_floor = Duration::from_millis(self.cfg.min_cycle_ms);
        let read_timeout = Duration::from_millis(self.cfg.read_timeout_ms);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let active = self.registry.snapshot_active();
            if active.is_empty() {
                if Self::pause(&self.shutdown, idle).await {
                    break;
                }
                continue;
            }

            let cycle_start = Instant::now();
            let cursors: HashMap<String, Cursor> = active
                .iter()
                .map(|entry| (entry.key.clone(), entry.cursor))
                .collect();

            let read = tokio::time::timeout(
                read_timeout,
                BatchSource::read_batch(&self.store, cursors, self.cfg.batch_limit),
            );
            let outcome = match read.await {
                Ok(result) => result,
                Err(_) => Err(ManifoldError::StoreUnavailable("batched read timed out".into())),
            };

            match outcome {
                Ok(records) => {
                    backoff.reset();
                    if !records.is_empty() {
                        debug!("[Puller] Cycle delivered {} records across {} keys", records.len(), active.len());
                    }
                    self.dispatch_cycle(&active, records);
                }
                Err(err) => {
                    // A failed read cannot tell "delivered" from "not
                    // delivered" per key; fail the whole batch and let the
                    // affected subscribers reconnect.
                    let delay = backoff.next_delay();
                    warn!(
                        "[Puller] Batched read failed: {}. Failing {} active keys, backing off {:?}",
                        err,
                        active.len(),
                        delay
                    );
                    for entry in &active {
                        self.registry.fail(&entry.key, entry.epoch, err.clone());
                    }
                    if Self::pause(&self.shutdown, delay).await {
                        break;
                    }
                    continue;
                }
            }

            // Bound the request rate against the store independent of volume.
            let elapsed = cycle_start.elapsed();
            if elapsed < cycle_floor {
                if Self::pause(&self.shutdown, cycle_floor - elapsed).await {
                    break;
                }
            }
        }
        info!("[Puller] Stopped");
    }

    /// The physical read interleaves keys; regroup so each key's records go
    /// out strictly in id order, then advance that key's cursor past the
    /// last delivered id.
    fn dispatch_cycle(&self, active: &[ActiveKey], records: Vec<Record>) {
        let mut by_key: HashMap<String, Vec<Record>> = HashMap::new();
        for record in records {
            by_key.entry(record.key.clone()).or_default().push(record);
        }

        for entry in active {
            let Some(mut batch) = by_key.remove(&entry.key) else {
                continue; // omitted from the result: nothing new this cycle
            };
            batch.sort_by_key(|record| record.id);
            let Some(last) = batch.last().map(|record| record.id) else {
                continue;
            };
            for record in batch {
                self.registry.dispatch(&entry.key, entry.epoch, record);
            }
            self.registry.advance(&entry.key, entry.epoch, Cursor::past(last));
        }
    }

    /// Cancellable sleep; true means shutdown was requested.
    async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
