//! Observability models. An embedding service can serialize these for a
//! status endpoint; nothing in the engine depends on them being consumed.

use serde::Serialize;

use crate::record::Cursor;

#[derive(Debug, Serialize)]
pub struct EngineSnapshot {
    pub closed: bool,
    pub total_keys: usize,
    pub total_sinks: usize,
    pub keys: Vec<KeySnapshot>,
}

#[derive(Debug, Serialize)]
pub struct KeySnapshot {
    pub key: String,
    pub cursor: Cursor,
    pub sinks: usize,
}
