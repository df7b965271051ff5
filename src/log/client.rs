//! Client handle + command set for the log actor.

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::LogConfig;
use crate::error::ManifoldError;
use crate::log::actor::LogActor;
use crate::log::BatchSource;
use crate::record::{Cursor, Record, RecordId};

// ==========================================
// COMMANDS
// ==========================================

pub enum LogCommand {
    /// Append one record under a key; replies with the assigned id.
    Append {
        key: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<RecordId, ManifoldError>>,
    },
    /// One read covering many keys' cursors. All-or-nothing: any I/O
    /// failure fails the whole batch.
    ReadBatch {
        cursors: HashMap<String, Cursor>,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Record>, ManifoldError>>,
    },
    /// Flush and stop the actor.
    Stop {
        reply: oneshot::Sender<()>,
    },
}

// ==========================================
// CLIENT
// ==========================================

/// Cloneable handle to the log actor. This is the single pooled
/// "connection" to the store, shared by every producer and the puller.
#[derive(Clone)]
pub struct LogClient {
    tx: mpsc::Sender<LogCommand>,
}

impl LogClient {
    /// Spawn the storage actor and return its handle.
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: LogConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.actor_channel_capacity);
        let actor = LogActor::new(config, rx);
        tokio::spawn(actor.run());
        Self { tx }
    }

    /// Producer path: append one record; no coupling to the puller.
    pub async fn append(&self, key: &str, payload: Bytes) -> Result<RecordId, ManifoldError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Append { key: key.to_string(), payload, reply })
            .await
            .map_err(|_| ManifoldError::StoreUnavailable("log actor unavailable".into()))?;
        rx.await
            .map_err(|_| ManifoldError::StoreUnavailable("log actor dropped the request".into()))?
    }

    /// Flush pending writes and stop the actor. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LogCommand::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl BatchSource for LogClient {
    fn read_batch(
        &self,
        cursors: HashMap<String, Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Record>, ManifoldError>> + Send {
        let tx = self.tx.clone();
        async move {
            let (reply, rx) = oneshot::channel();
            tx.send(LogCommand::ReadBatch { cursors, limit, reply })
                .await
                .map_err(|_| ManifoldError::StoreUnavailable("log actor unavailable".into()))?;
            rx.await
                .map_err(|_| ManifoldError::StoreUnavailable("log actor dropped the request".into()))?
        }
    }
}
