//! The persisted record: one session slot keyed by its sequence number.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Length of one synthesized session slot, in seconds.
pub const SLOT_SECONDS: i64 = 10;

/// A session record. `number` is unique per store and is the only field
/// used for ordering and filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Sequence number, the sort and partition key
    pub number: i32,
    /// Slot start
    pub start: DateTime<Utc>,
    /// Slot end
    pub end: DateTime<Utc>,
    /// Validity flag
    pub valid: bool,
}

impl Record {
    /// Build the record the populate workload inserts for `number`.
    ///
    /// The slot starts `number * 10s` after `epoch`, lasts 10 seconds and
    /// is valid for even numbers.
    pub fn synthesize(number: i32, epoch: DateTime<Utc>) -> Self {
        let start = epoch + Duration::seconds(i64::from(number) * SLOT_SECONDS);
        let end = start + Duration::seconds(SLOT_SECONDS);
        Self {
            number,
            start,
            end,
            valid: number % 2 == 0,
        }
    }

    /// Rebuild a record from its stored columns. Returns None for
    /// timestamps chrono cannot represent.
    pub(crate) fn from_columns(number: i32, start_ms: i64, end_ms: i64, valid: bool) -> Option<Self> {
        let start = Utc.timestamp_millis_opt(start_ms).single()?;
        let end = Utc.timestamp_millis_opt(end_ms).single()?;
        Some(Self { number, start, end, valid })
    }

    pub(crate) fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub(crate) fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}
