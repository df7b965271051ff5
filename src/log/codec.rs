//! On-disk record framing: [Len:4][CRC:4][TimestampMs:8][Sequence:4][Payload].
//! CRC covers everything after itself. A frame that fails the checksum (or a
//! short read at the tail) ends the scan; everything before it is valid.

use std::path::Path;

use bytes::Bytes;
use crc32fast::Hasher;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::record::RecordId;

/// Serialize one record into a buffer (does NOT write to disk).
pub fn encode_record(buf: &mut Vec<u8>, id: RecordId, payload: &[u8]) {
    let len = (8 + 4 + payload.len()) as u32;
    let mut hasher = Hasher::new();
    hasher.update(&id.timestamp_ms.to_be_bytes());
    hasher.update(&id.sequence.to_be_bytes());
    hasher.update(payload);
    let crc = hasher.finalize();

    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.extend_from_slice(&id.timestamp_ms.to_be_bytes());
    buf.extend_from_slice(&id.sequence.to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Read every valid frame of a key's log file, in file order.
/// Stops at the first torn or corrupt frame; errors only if the file
/// cannot be opened or read at all.
pub async fn read_log_file(path: &Path) -> std::io::Result<Vec<(RecordId, Bytes)>> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut frames = Vec::new();

    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() { break; }
        let len = u32::from_be_bytes(len_buf);

        let mut crc_buf = [0u8; 4];
        if reader.read_exact(&mut crc_buf).await.is_err() { break; }
        let stored_crc = u32::from_be_bytes(crc_buf);

        let mut content_buf = vec![0u8; len as usize];
        if reader.read_exact(&mut content_buf).await.is_err() { break; }

        let mut hasher = Hasher::new();
        hasher.update(&content_buf);
        if hasher.finalize() != stored_crc { break; }

        if content_buf.len() < 12 { break; }
        let timestamp_ms = u64::from_be_bytes(content_buf[0..8].try_into().unwrap());
        let sequence = u32::from_be_bytes(content_buf[8..12].try_into().unwrap());
        let payload = Bytes::copy_from_slice(&content_buf[12..]);

        frames.push((RecordId { timestamp_ms, sequence }, payload));
    }

    Ok(frames)
}

/// File name for a key's log. Keys are arbitrary strings, so they are
/// hex-encoded to stay filesystem-safe.
pub fn log_file_name(key: &str) -> String {
    format!("{}.log", hex::encode(key))
}

/// Inverse of [`log_file_name`]; None for files that are not key logs.
pub fn key_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".log")?;
    let raw = hex::decode(stem).ok()?;
    String::from_utf8(raw).ok()
}
