//! Storage actor: owns all log state and file I/O.
//!
//! Responsibilities:
//! - Assigns record ids: coarse wall-clock millisecond + tie-break sequence,
//!   monotonically non-decreasing per key even if the clock steps back.
//! - Keeps an in-RAM tail per key (capped) and, when persistence is
//!   configured, an append-only file per key written through `BufWriter`.
//! - Manages an LRU cache of open file handles to stay under OS limits.
//! - Flushes dirty writers on a periodic interval.
//! - Warm-starts from disk on boot, tolerating a torn tail.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lru::LruCache;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::LogConfig;
use crate::error::ManifoldError;
use crate::log::client::LogCommand;
use crate::log::codec;
use crate::record::{Cursor, Record, RecordId};
use crate::utils::utils_time::now_ms;

// ==========================================
// PER-KEY STATE
// ==========================================

struct KeyLog {
    /// In-RAM tail, ordered by id. A cache of the newest records; the file
    /// (when persistence is on) holds the full history.
    records: VecDeque<Record>,
    last_id: Option<RecordId>,
    /// True once records were evicted from RAM. With persistence they are
    /// still on disk; without it, reads older than the window clamp to the
    /// window start.
    spilled: bool,
}

impl KeyLog {
    fn new() -> Self {
        Self { records: VecDeque::new(), last_id: None, spilled: false }
    }

    fn next_id(&self, now: u64) -> RecordId {
        match self.last_id {
            Some(last) if now <= last.timestamp_ms => RecordId {
                timestamp_ms: last.timestamp_ms,
                sequence: last.sequence + 1,
            },
            _ => RecordId { timestamp_ms: now, sequence: 0 },
        }
    }
}

// ==========================================
// LOG ACTOR
// ==========================================

pub struct LogActor {
    rx: mpsc::Receiver<LogCommand>,
    dir: Option<PathBuf>,
    keys: HashMap<String, KeyLog>,
    writers: LruCache<String, BufWriter<File>>,
    dirty: bool,
    flush_interval: Duration,
    max_ram_records: usize,
}

impl LogActor {
    pub fn new(config: LogConfig, rx: mpsc::Receiver<LogCommand>) -> Self {
        Self {
            rx,
            dir: config.persistence_path.map(PathBuf::from),
            keys: HashMap::new(),
            writers: LruCache::new(NonZeroUsize::new(config.max_open_files).unwrap()),
            dirty: false,
            flush_interval: Duration::from_millis(config.flush_ms),
            max_ram_records: config.max_ram_records,
        }
    }

    pub async fn run(mut self) {
        if let Err(err) = self.recover().await {
            error!("[LogActor] Warm start failed: {}", err);
        }
        info!("[LogActor] Started ({} keys recovered)", self.keys.len());

        let mut flush_timer = tokio::time::interval(self.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(LogCommand::Stop { reply }) => {
                            self.flush_all().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                _ = flush_timer.tick() => {
                    self.flush_all().await;
                }
            }
        }

        self.flush_all().await;
        info!("[LogActor] Stopped");
    }

    async fn handle_command(&mut self, cmd: LogCommand) {
        match cmd {
            LogCommand::Append { key, payload, reply } => {
                let id = {
                    let key_log = self.keys.entry(key.clone()).or_insert_with(KeyLog::new);
                    key_log.next_id(now_ms())
                };

                // Disk first: a record is only acknowledged once its bytes
                // reached the writer.
                if let Some(dir) = self.dir.clone() {
                    if let Err(err) = self.append_frame(&dir, &key, id, &payload).await {
                        error!("[LogActor] Append to '{}' failed: {}", key, err);
                        let _ = reply.send(Err(ManifoldError::StoreUnavailable(err.to_string())));
                        return;
                    }
                    self.dirty = true;
                }

                let key_log = self.keys.get_mut(&key).unwrap();
                key_log.records.push_back(Record { key: key.clone(), id, payload });
                if key_log.records.len() > self.max_ram_records {
                    key_log.records.pop_front();
                    key_log.spilled = true;
                }
                key_log.last_id = Some(id);

                let _ = reply.send(Ok(id));
            }
            LogCommand::ReadBatch { cursors, limit, reply } => {
                let mut batch = Vec::new();
                for (key, cursor) in cursors {
                    match self.read_key(&key, cursor, limit).await {
                        Ok(mut records) => batch.append(&mut records),
                        Err(err) => {
                            error!("[LogActor] Batched read failed on '{}': {}", key, err);
                            let _ = reply.send(Err(ManifoldError::StoreUnavailable(err.to_string())));
                            return;
                        }
                    }
                }
                let _ = reply.send(Ok(batch));
            }
            LogCommand::Stop { .. } => unreachable!("Stop is handled in run()"),
        }
    }

    /// Records for one key from `cursor` on, oldest first, capped at `limit`.
    /// Unknown keys and keys with nothing new yield an empty result.
    async fn read_key(&mut self, key: &str, cursor: Cursor, limit: usize) -> std::io::Result<Vec<Record>> {
        let Some(key_log) = self.keys.get(key) else {
            return Ok(Vec::new());
        };
        let cursor_id = cursor.position();
        let front_id = key_log.records.front().map(|r| r.id);

        // The RAM tail serves every read unless the cursor points before it
        // and older records still exist on disk.
        let cold = key_log.spilled
            && self.dir.is_some()
            && front_id.map_or(true, |front| cursor_id < front);

        if !cold {
            return Ok(key_log
                .records
                .iter()
                .filter(|r| r.id >= cursor_id)
                .take(limit)
                .cloned()
                .collect());
        }

        let Some(dir) = self.dir.clone() else {
            return Ok(Vec::new());
        };
        // Make buffered appends visible to the file read.
        if let Some(writer) = self.writers.get_mut(key) {
            writer.flush().await?;
        }
        let path = dir.join(codec::log_file_name(key));
        let frames = codec::read_log_file(&path).await?;
        Ok(frames
            .into_iter()
            .filter(|(id, _)| *id >= cursor_id)
            .take(limit)
            .map(|(id, payload)| Record { key: key.to_string(), id, payload })
            .collect())
    }

    async fn append_frame(&mut self, dir: &Path, key: &str, id: RecordId, payload: &[u8]) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(20 + payload.len());
        codec::encode_record(&mut buf, id, payload);
        let writer = self.writer_for(dir, key).await?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    async fn writer_for(&mut self, dir: &Path, key: &str) -> std::io::Result<&mut BufWriter<File>> {
        if !self.writers.contains(key) {
            if !dir.exists() {
                tokio::fs::create_dir_all(dir).await?;
            }
            if self.writers.len() == self.writers.cap().get() {
                if let Some((_, mut evicted)) = self.writers.pop_lru() {
                    let _ = evicted.flush().await;
                }
            }
            let path = dir.join(codec::log_file_name(key));
            let file = OpenOptions::new().create(true).append(true).open(&path).await?;
            self.writers.put(key.to_string(), BufWriter::new(file));
        }
        Ok(self.writers.get_mut(key).unwrap())
    }

    async fn flush_all(&mut self) {
        if !self.dirty {
            return;
        }
        for (key, writer) in self.writers.iter_mut() {
            if let Err(err) = writer.flush().await {
                error!("[LogActor] Flush failed for '{}': {}", key, err);
            }
        }
        self.dirty = false;
    }

    /// Warm start: rebuild per-key state from whatever is on disk.
    async fn recover(&mut self) -> std::io::Result<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir).await?;
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(key) = codec::key_from_file_name(&name) else {
                continue;
            };

            let frames = codec::read_log_file(&path).await?;
            if frames.is_empty() {
                continue;
            }
            let total = frames.len();
            let skip = total.saturating_sub(self.max_ram_records);

            let mut key_log = KeyLog::new();
            key_log.spilled = skip > 0;
            key_log.last_id = frames.last().map(|(id, _)| *id);
            for (id, payload) in frames.into_iter().skip(skip) {
                key_log.records.push_back(Record { key: key.clone(), id, payload });
            }
            info!("[LogActor] Warm start: recovered key '{}' ({} records)", key, total);
            self.keys.insert(key, key_log);
        }
        Ok(())
    }
}
