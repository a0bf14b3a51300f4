// 🔍 Duplicate Guard - Reject the same transfer reported twice
// Match: same sender name, same amount, slip times within the buffer window

use crate::store::SubmissionRecord;
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many recent log rows are compared (default: 50)
pub const DEFAULT_HISTORY_WINDOW: usize = 50;

/// Minutes within which two matching submissions are the same transfer (default: 30)
pub const DEFAULT_BUFFER_MINUTES: i64 = 30;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

// ============================================================================
// DUPLICATE MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    /// Index of the matching record in the history slice
    pub history_index: usize,

    /// The earlier submission
    pub previous: SubmissionRecord,

    /// Whole minutes between the two slip times
    pub minutes_apart: i64,

    /// Human-readable reason
    pub reason: String,
}

// ============================================================================
// DUPLICATE GUARD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateGuard {
    /// Buffer window in minutes (strictly-less-than comparison)
    pub buffer_minutes: i64,

    /// Number of most recent history entries scanned
    pub window: usize,
}

impl DuplicateGuard {
    /// Create guard with default buffer and window
    pub fn new() -> Self {
        DuplicateGuard {
            buffer_minutes: DEFAULT_BUFFER_MINUTES,
            window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn with_buffer_minutes(mut self, buffer_minutes: i64) -> Self {
        self.buffer_minutes = buffer_minutes;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// True if the candidate repeats a recent submission
    pub fn is_duplicate(
        &self,
        history: &[SubmissionRecord],
        candidate_name: &str,
        candidate_amount: i64,
        candidate_time: NaiveTime,
    ) -> bool {
        self.find_duplicate(history, candidate_name, candidate_amount, candidate_time)
            .is_some()
    }

    /// First recent submission the candidate repeats, if any.
    ///
    /// `history` is in submission order (oldest first); only the last
    /// `window` entries are scanned. Entries whose stored time does not
    /// parse are skipped.
    pub fn find_duplicate(
        &self,
        history: &[SubmissionRecord],
        candidate_name: &str,
        candidate_amount: i64,
        candidate_time: NaiveTime,
    ) -> Option<DuplicateMatch> {
        let name = candidate_name.trim();
        let amount = candidate_amount.to_string();
        let buffer_seconds = self.buffer_minutes.saturating_mul(60);
        let start = history.len().saturating_sub(self.window);

        for (offset, entry) in history[start..].iter().enumerate() {
            if entry.sender_name.trim() != name || entry.amount.trim() != amount {
                continue;
            }

            let stored_time = match parse_time_of_day(&entry.transfer_time) {
                Some(t) => t,
                None => {
                    debug!(
                        transfer_time = %entry.transfer_time,
                        "skipping log entry with unreadable transfer time"
                    );
                    continue;
                }
            };

            let seconds = seconds_apart(candidate_time, stored_time);
            if seconds < buffer_seconds {
                return Some(DuplicateMatch {
                    history_index: start + offset,
                    previous: entry.clone(),
                    minutes_apart: seconds / 60,
                    reason: format!(
                        "Duplicate: {} | {} | {} ≈ {}",
                        name,
                        amount,
                        stored_time.format("%H:%M"),
                        candidate_time.format("%H:%M")
                    ),
                });
            }
        }

        None
    }
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a candidate against history with the default window
pub fn is_duplicate(
    history: &[SubmissionRecord],
    candidate_name: &str,
    candidate_amount: i64,
    candidate_time: NaiveTime,
    buffer_minutes: i64,
) -> bool {
    DuplicateGuard::new()
        .with_buffer_minutes(buffer_minutes)
        .is_duplicate(history, candidate_name, candidate_amount, candidate_time)
}

/// Distance between two times of day on the 24-hour circle, in seconds.
///
/// 23:55 and 00:05 are ten minutes apart.
pub fn seconds_apart(a: NaiveTime, b: NaiveTime) -> i64 {
    let diff = (a.num_seconds_from_midnight() as i64 - b.num_seconds_from_midnight() as i64).abs();
    diff.min(SECONDS_PER_DAY - diff)
}

/// Parse a stored time-of-day cell.
///
/// Accepts `HH:MM:SS`, `HH:MM:SS.ffffff`, `HH:MM`, the `HH.MM` form printed
/// on slips, and a full `YYYY-MM-DD HH:MM:SS` timestamp (date ignored).
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();

    for format in ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M", "%H.%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(s, format) {
            return Some(time);
        }
    }

    if let Ok(datetime) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(datetime.time());
    }

    None
}

// ============================================================================
// TESTS
// ============================================================================
