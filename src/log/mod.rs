//! Append Log: durable, key-partitioned, append-only store.
//!
//! Structure:
//! - `LogClient` (handle): the one shared "connection" to the store. Cheap to
//!   clone; every producer and the puller reuse it instead of opening their
//!   own readers.
//! - `LogActor` (1 per engine): owns all state and file I/O, processes
//!   commands sequentially so a batched read is atomic by construction.
//! - `codec`: CRC-framed on-disk record format.

pub mod actor;
pub mod client;
pub mod codec;

use std::collections::HashMap;
use std::future::Future;

use crate::error::ManifoldError;
use crate::record::{Cursor, Record};

pub use client::LogClient;

/// The puller's view of the store: one batched read covering many keys'
/// cursors. Keys with no new records are omitted from the result; any
/// failure fails the whole call (no partial success).
pub trait BatchSource: Clone + Send + Sync + 'static {
    fn read_batch(
        &self,
        cursors: HashMap<String, Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Record>, ManifoldError>> + Send;
}
