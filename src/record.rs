use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Position of a record within its key's sequence.
///
/// Ordering is total within a key: coarse wall-clock millisecond first,
/// tie-break sequence second. Nothing is guaranteed across keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub timestamp_ms: u64,
    pub sequence: u32,
}

impl RecordId {
    /// The next assignable position after this one.
    pub fn successor(self) -> RecordId {
        match self.sequence.checked_add(1) {
            Some(sequence) => RecordId { timestamp_ms: self.timestamp_ms, sequence },
            None => RecordId { timestamp_ms: self.timestamp_ms + 1, sequence: 0 },
        }
    }
}

/// The next position to read for a key: exclusive of already-delivered
/// records, inclusive going forward. A record is visible from a cursor
/// when its id is at or past the cursor position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp_ms: u64,
    pub sequence: u32,
}

impl Cursor {
    pub const ZERO: Cursor = Cursor { timestamp_ms: 0, sequence: 0 };

    /// Cursor for "everything from this wall-clock millisecond on".
    /// The transport boundary hands offsets over as plain milliseconds.
    pub fn from_millis(timestamp_ms: u64) -> Cursor {
        Cursor { timestamp_ms, sequence: 0 }
    }

    /// Cursor pointing just past a delivered record.
    pub fn past(id: RecordId) -> Cursor {
        let next = id.successor();
        Cursor { timestamp_ms: next.timestamp_ms, sequence: next.sequence }
    }

    pub fn position(self) -> RecordId {
        RecordId { timestamp_ms: self.timestamp_ms, sequence: self.sequence }
    }
}

impl From<RecordId> for Cursor {
    fn from(id: RecordId) -> Cursor {
        Cursor { timestamp_ms: id.timestamp_ms, sequence: id.sequence }
    }
}

/// One appended update. Immutable once written; the payload is opaque to
/// the multiplexer and cheap to clone for fan-out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub id: RecordId,
    pub payload: Bytes,
}
