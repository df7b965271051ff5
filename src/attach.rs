//! Attachment Point: turns a registry attachment into a lazy, cancellable
//! sequence of records for one key.
//!
//! The stream detaches exactly once no matter how it ends: dropped by its
//! consumer, terminated by an error, or force-completed by the hard
//! per-attachment lifetime. It is not restartable; resuming requires a new
//! `open_stream` with an explicit offset.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use uuid::Uuid;

use crate::error::ManifoldError;
use crate::record::{Cursor, Record};
use crate::registry::{Registry, TerminalCell};

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Ended cleanly: the consumer dropped it, or the last record arrived
    /// before a consumer-side close.
    Closed,
    /// Ended with a terminal error (store failure, saturation, shutdown).
    Failed(ManifoldError),
    /// The hard per-attachment lifetime expired; the stream was
    /// force-completed and detached. Not an error.
    LifetimeExceeded,
}

/// A lazy, cancellable sequence of records for one key.
///
/// Yields `Ok(record)` in strictly increasing id order; a terminal error
/// surfaces as one final `Err` after buffered records drain. The stream is
/// infinite unless errored or force-closed.
pub struct EventStream {
    key: String,
    sink_id: Uuid,
    registry: Arc<Registry>,
    rx: mpsc::Receiver<Record>,
    term: TerminalCell,
    deadline: Pin<Box<Sleep>>,
    termination: Option<Termination>,
    done: bool,
}

impl EventStream {
    /// Attach to `key` from `from` with a hard lifetime cap.
    /// Must be called from within a tokio runtime.
    ///
    /// A sink attached while a pull cycle is in flight joins that cycle's
    /// dispatch mid-batch: it may re-receive up to one cycle's window of
    /// records its `from` cursor already covered. Accepted imprecision at
    /// the batch boundary; no deduplication is attempted.
    pub fn open(registry: Arc<Registry>, key: &str, from: Cursor, max_lifetime: Duration) -> Self {
        let attachment = registry.attach(key, from);
        Self {
            key: key.to_string(),
            sink_id: attachment.sink_id,
            rx: attachment.rx,
            term: attachment.term,
            registry,
            deadline: Box::pin(tokio::time::sleep(max_lifetime)),
            termination: None,
            done: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Why the stream ended; None while it is still live.
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }
}

impl Stream for EventStream {
    type Item = Result<Record, ManifoldError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.registry.detach(&this.key, this.sink_id);
            this.termination = Some(Termination::LifetimeExceeded);
            this.done = true;
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(record)) => Poll::Ready(Some(Ok(record))),
            Poll::Ready(None) => {
                this.done = true;
                match this.term.lock().take() {
                    Some(error) => {
                        this.termination = Some(Termination::Failed(error.clone()));
                        Poll::Ready(Some(Err(error)))
                    }
                    None => {
                        this.termination = Some(Termination::Closed);
                        Poll::Ready(None)
                    }
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        // Idempotent; also covers streams that already ended.
        self.registry.detach(&self.key, self.sink_id);
    }
}
