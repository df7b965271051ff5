//! Manifold: a real-time fan-out multiplexer.
//!
//! Producers append per-key records to a durable append log; one
//! continuously-running puller issues a single batched read per cycle across
//! every key with live subscribers and fans the returned records out to
//! per-key sinks. Subscribers attach and detach freely; the store sees one
//! reader no matter how many of them exist.

pub mod attach;
pub mod config;
pub mod error;
pub mod log;
pub mod puller;
pub mod record;
pub mod registry;
pub mod snapshot;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::{AttachConfig, Config};
use crate::log::LogClient;
use crate::puller::Puller;
use crate::registry::Registry;
use crate::snapshot::EngineSnapshot;

pub use crate::attach::{EventStream, Termination};
pub use crate::error::ManifoldError;
pub use crate::record::{Cursor, Record, RecordId};

// ========================================
// ENGINE (The Singleton)
// ========================================

/// The assembled multiplexer: log actor, subscription registry, and the
/// supervised puller. Cheap to clone (all fields are handles).
#[derive(Clone)]
pub struct ManifoldEngine {
    log: LogClient,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    attach_cfg: AttachConfig,
}

impl ManifoldEngine {
    /// Wire up and start the subsystem.
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new(config.attach.sink_capacity));
        let log = LogClient::spawn(config.log);
        let shutdown = CancellationToken::new();

        Puller::new(log.clone(), registry.clone(), config.puller, shutdown.clone()).spawn();

        Self {
            log,
            registry,
            shutdown,
            attach_cfg: config.attach,
        }
    }

    /// Producer path: append one record under `key`. Goes straight to the
    /// log; the puller is purely a downstream reader.
    pub async fn append(&self, key: &str, payload: Bytes) -> Result<RecordId, ManifoldError> {
        self.log.append(key, payload).await
    }

    /// Transport boundary: open a lazy, cancellable stream of records for
    /// `key` starting at `from`. The first attach for a key seeds its read
    /// cursor; concurrent attaches to the same key join the live cursor.
    pub fn open_stream(&self, key: &str, from: Cursor) -> EventStream {
        EventStream::open(
            self.registry.clone(),
            key,
            from,
            Duration::from_millis(self.attach_cfg.max_lifetime_ms),
        )
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.registry.observe()
    }

    /// Teardown: reject new attaches, fail live streams with `Shutdown`,
    /// stop the puller, and flush + stop the log actor.
    pub async fn shutdown(&self) {
        self.registry.close();
        self.shutdown.cancel();
        self.log.stop().await;
    }
}
