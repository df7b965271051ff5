#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use manifold::config::{AttachConfig, Config, LogConfig, PullerConfig};
use manifold::{EventStream, ManifoldEngine, Record};
use tempfile::TempDir;

/// Config with intervals tightened so tests settle in milliseconds.
pub fn test_config(data_dir: Option<&Path>) -> Config {
    Config {
        log: LogConfig {
            persistence_path: data_dir.map(|p| p.to_string_lossy().to_string()),
            flush_ms: 10,
            max_open_files: 64,
            max_ram_records: 10_000,
            actor_channel_capacity: 1024,
        },
        puller: PullerConfig {
            idle_poll_ms: 10,
            min_cycle_ms: 5,
            read_timeout_ms: 1000,
            backoff_base_ms: 20,
            backoff_ceiling_ms: 100,
            batch_limit: 500,
        },
        attach: AttachConfig {
            sink_capacity: 256,
            max_lifetime_ms: 60_000,
        },
    }
}

pub async fn setup_engine() -> (ManifoldEngine, TempDir) {
    manifold::utils::logging::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let engine = ManifoldEngine::new(test_config(Some(dir.path())));
    (engine, dir)
}

/// Engine with no persistence and a tweakable config.
pub fn setup_ram_engine(mutate: impl FnOnce(&mut Config)) -> ManifoldEngine {
    manifold::utils::logging::init_logging();
    let mut config = test_config(None);
    mutate(&mut config);
    ManifoldEngine::new(config)
}

/// Pull exactly `n` records off a stream, panicking on error, end, or stall.
pub async fn collect(stream: &mut EventStream, n: usize) -> Vec<Record> {
    let mut out = Vec::new();
    while out.len() < n {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(record))) => out.push(record),
            Ok(Some(Err(err))) => panic!("stream errored after {} of {} records: {err}", out.len(), n),
            Ok(None) => panic!("stream ended after {} of {} records", out.len(), n),
            Err(_) => panic!("timed out after {} of {} records", out.len(), n),
        }
    }
    out
}

pub fn payloads(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| String::from_utf8_lossy(&r.payload).to_string())
        .collect()
}

pub fn assert_strictly_increasing(records: &[Record]) {
    for pair in records.windows(2) {
        assert!(pair[0].id < pair[1].id, "ids out of order: {:?} then {:?}", pair[0].id, pair[1].id);
    }
}
