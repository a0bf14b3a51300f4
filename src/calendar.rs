// 📅 Entitlement Calendar - Codec for "which months is a member paid through"
//
// Wire format (stored in the member directory, edited by hand):
//   "2567:11-12:* , 2568:1-3:* , 2568:5:*"
//
// Each segment is YEAR:RANGE:* where RANGE is a single month or START-END.
// The trailing ":*" is a fixed literal kept for compatibility.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Separator between segments in the serialized form
pub const SEGMENT_SEPARATOR: &str = " , ";

/// Marker closing every segment
pub const SEGMENT_MARKER: &str = "*";

/// Cell values that mean "no coverage at all"
pub const PLACEHOLDERS: [&str; 4] = ["-", "", "nan", "None"];

/// Earliest year a token may carry
pub const MIN_YEAR: i32 = 1;

/// Latest year a token may carry
pub const MAX_YEAR: i32 = 9999;

// ============================================================================
// MONTH TOKEN
// ============================================================================

/// A (year, month) pair.
///
/// Year uses whatever numbering the caller stores (the club uses the
/// Buddhist Era, Gregorian + 543). Ordering is lexicographic on
/// (year, month), which is what "latest covered month" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthToken {
    pub year: i32,
    pub month: u32,
}

impl MonthToken {
    /// Create a token, rejecting months outside 1-12 and years outside
    /// `MIN_YEAR..=MAX_YEAR`
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (MIN_YEAR..=MAX_YEAR).contains(&year) {
            Some(MonthToken { year, month })
        } else {
            None
        }
    }

    /// Month containing `date`, with `year_offset` added to the Gregorian year
    pub fn from_date(date: NaiveDate, year_offset: i32) -> Self {
        MonthToken {
            year: date.year().saturating_add(year_offset),
            month: date.month(),
        }
    }

    /// Following month (December rolls into January of the next year).
    /// `None` past `MAX_YEAR`.
    pub fn next(self) -> Option<Self> {
        if self.month >= 12 {
            MonthToken::new(self.year.checked_add(1)?, 1)
        } else {
            MonthToken::new(self.year, self.month + 1)
        }
    }

    /// Preceding month (January rolls back into December of the previous year).
    /// `None` before `MIN_YEAR`.
    pub fn previous(self) -> Option<Self> {
        if self.month <= 1 {
            MonthToken::new(self.year.checked_sub(1)?, 12)
        } else {
            MonthToken::new(self.year, self.month - 1)
        }
    }
}

impl fmt::Display for MonthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthToken {
    type Err = String;

    /// Parse `YEAR-MM` (the CLI's `--now` argument)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected YEAR-MM, got {:?}", s))?;
        let year: i32 = year
            .trim()
            .parse()
            .map_err(|_| format!("invalid year in {:?}", s))?;
        let month: u32 = month
            .trim()
            .parse()
            .map_err(|_| format!("invalid month in {:?}", s))?;
        MonthToken::new(year, month).ok_or_else(|| format!("month out of range in {:?}", s))
    }
}

// ============================================================================
// COVERED MONTHS
// ============================================================================

/// Set of months a member is paid through.
///
/// Backed by a `BTreeSet` so iteration (and therefore encoding) is always
/// years ascending, months ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredMonths {
    months: BTreeSet<MonthToken>,
}

impl CoveredMonths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a month; returns false if it was already covered
    pub fn insert(&mut self, token: MonthToken) -> bool {
        self.months.insert(token)
    }

    pub fn contains(&self, token: &MonthToken) -> bool {
        self.months.contains(token)
    }

    pub fn len(&self) -> usize {
        self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }

    /// Latest covered month, if any
    pub fn latest(&self) -> Option<MonthToken> {
        self.months.iter().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonthToken> {
        self.months.iter()
    }
}

impl FromIterator<MonthToken> for CoveredMonths {
    fn from_iter<I: IntoIterator<Item = MonthToken>>(iter: I) -> Self {
        CoveredMonths {
            months: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for CoveredMonths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

impl FromStr for CoveredMonths {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(decode(s))
    }
}

// ============================================================================
// DECODE
// ============================================================================

/// Parse a serialized entitlement into the set of covered months.
///
/// Never fails: placeholders decode to an empty set and malformed segments
/// are skipped, since the directory is maintained by hand.
pub fn decode(serialized: &str) -> CoveredMonths {
    let mut covered = CoveredMonths::new();

    if is_placeholder(serialized) {
        return covered;
    }

    for segment in serialized.split(',') {
        if let Some(months) = decode_segment(segment.trim()) {
            for token in months {
                covered.insert(token);
            }
        }
    }

    covered
}

/// True for the cell values that mean "no coverage"
pub fn is_placeholder(serialized: &str) -> bool {
    PLACEHOLDERS.contains(&serialized.trim())
}

/// Decode one `YEAR:RANGE:*` segment; `None` means the segment is discarded
fn decode_segment(segment: &str) -> Option<Vec<MonthToken>> {
    let fields: Vec<&str> = segment.split(':').collect();
    if fields.len() < 2 {
        debug!(segment, "skipping segment without YEAR:RANGE fields");
        return None;
    }

    let year: i32 = match fields[0].trim().parse() {
        Ok(year) => year,
        Err(_) => {
            debug!(segment, "skipping segment with unparseable year");
            return None;
        }
    };

    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        warn!(segment, year, "year out of range, segment discarded");
        return None;
    }

    let range = fields[1].trim();
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (parse_month(start)?, parse_month(end)?),
        None => {
            let month = parse_month(range)?;
            (month, month)
        }
    };

    // Both ends checked before any range is built
    let (first, last) = match (MonthToken::new(year, start), MonthToken::new(year, end)) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            warn!(segment, start, end, "month outside 1-12, segment discarded");
            return None;
        }
    };

    if first > last {
        warn!(segment, start, end, "degenerate month range, no months added");
        return Some(Vec::new());
    }

    Some(
        (first.month..=last.month)
            .filter_map(|month| MonthToken::new(year, month))
            .collect(),
    )
}

fn parse_month(field: &str) -> Option<u32> {
    match field.trim().parse() {
        Ok(month) => Some(month),
        Err(_) => {
            debug!(field, "skipping segment with unparseable month");
            None
        }
    }
}

// ============================================================================
// ENCODE
// ============================================================================

/// Serialize covered months into the canonical compact form.
///
/// Consecutive months within a year collapse into `START-END`; a run of one
/// month prints bare. Empty coverage encodes to `""`.
pub fn encode(months: &CoveredMonths) -> String {
    let mut segments = Vec::new();
    let mut run: Option<(i32, u32, u32)> = None; // (year, start, end)

    // BTreeSet order is already (year asc, month asc)
    for token in months.iter() {
        run = match run {
            Some((year, start, end)) if year == token.year && token.month == end + 1 => {
                Some((year, start, token.month))
            }
            Some((year, start, end)) => {
                segments.push(format_segment(year, start, end));
                Some((token.year, token.month, token.month))
            }
            None => Some((token.year, token.month, token.month)),
        };
    }

    if let Some((year, start, end)) = run {
        segments.push(format_segment(year, start, end));
    }

    segments.join(SEGMENT_SEPARATOR)
}

fn format_segment(year: i32, start: u32, end: u32) -> String {
    if start == end {
        format!("{}:{}:{}", year, start, SEGMENT_MARKER)
    } else {
        format!("{}:{}-{}:{}", year, start, end, SEGMENT_MARKER)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(pairs: &[(i32, u32)]) -> CoveredMonths {
        pairs
            .iter()
            .map(|&(y, m)| MonthToken::new(y, m).unwrap())
            .collect()
    }

    #[test]
    fn test_decode_ranges_and_singles() {
        let covered = decode("2024:1-3:* , 2024:5:*");
        assert_eq!(covered, tokens(&[(2024, 1), (2024, 2), (2024, 3), (2024, 5)]));
    }

    #[test]
    fn test_decode_placeholders() {
        for placeholder in ["-", "", "nan", "None", "  -  ", "   "] {
            assert!(decode(placeholder).is_empty(), "{:?} should be empty", placeholder);
        }
    }

    #[test]
    fn test_decode_skips_malformed_segments() {
        // Missing range, bad year, bad month, triple range
        let covered = decode("2568 , abc:3:* , 2568:x:* , 2568:1-2-3:* , 2568:7:*");
        assert_eq!(covered, tokens(&[(2568, 7)]));
    }

    #[test]
    fn test_decode_tolerates_whitespace_and_missing_marker() {
        let covered = decode(" 2568 : 2 - 4 ,2568:6");
        assert_eq!(covered, tokens(&[(2568, 2), (2568, 3), (2568, 4), (2568, 6)]));
    }

    #[test]
    fn test_decode_degenerate_range_adds_nothing() {
        let covered = decode("2568:5-2:* , 2568:9:*");
        assert_eq!(covered, tokens(&[(2568, 9)]));
    }

    #[test]
    fn test_decode_rejects_out_of_range_month() {
        assert!(decode("2568:0:*").is_empty());
        assert!(decode("2568:11-13:*").is_empty());
    }

    #[test]
    fn test_decode_unions_overlapping_segments() {
        let covered = decode("2568:1-3:* , 2568:2-4:*");
        assert_eq!(covered.len(), 4);
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&CoveredMonths::new()), "");
    }

    #[test]
    fn test_encode_compresses_runs_per_year() {
        let covered = tokens(&[
            (2568, 3),
            (2567, 12),
            (2568, 1),
            (2568, 2),
            (2567, 11),
            (2568, 7),
        ]);
        assert_eq!(encode(&covered), "2567:11-12:* , 2568:1-3:* , 2568:7:*");
    }

    #[test]
    fn test_encode_does_not_join_across_years() {
        let covered = tokens(&[(2567, 12), (2568, 1)]);
        assert_eq!(encode(&covered), "2567:12:* , 2568:1:*");
    }

    #[test]
    fn test_canonical_string_survives_reencode() {
        for canonical in [
            "2568:6-8:*",
            "2024:1-3:* , 2024:5:*",
            "2566:12:* , 2567:1-12:* , 2568:1:*",
        ] {
            assert_eq!(encode(&decode(canonical)), canonical);
        }
    }

    #[test]
    fn test_set_survives_encode_then_decode() {
        let covered = tokens(&[(2567, 2), (2567, 4), (2567, 5), (2569, 12)]);
        assert_eq!(decode(&encode(&covered)), covered);
    }

    #[test]
    fn test_month_token_rollover() {
        let dec = MonthToken::new(2567, 12).unwrap();
        assert_eq!(dec.next(), MonthToken::new(2568, 1));
        assert_eq!(dec.next().and_then(MonthToken::previous), Some(dec));
        assert_eq!(
            MonthToken::new(2568, 5).unwrap().previous(),
            MonthToken::new(2568, 4)
        );
    }

    #[test]
    fn test_month_token_stops_at_year_bounds() {
        assert_eq!(MonthToken::new(MAX_YEAR, 12).unwrap().next(), None);
        assert_eq!(MonthToken::new(MIN_YEAR, 1).unwrap().previous(), None);
        assert_eq!(MonthToken::new(MAX_YEAR + 1, 1), None);
        assert_eq!(MonthToken::new(0, 6), None);
    }

    #[test]
    fn test_decode_huge_month_range_is_discarded() {
        // Would overflow or allocate gigabytes if the range were built first
        let covered = decode("2568:0-4294967295:* , 2568:5:*");
        assert_eq!(covered, tokens(&[(2568, 5)]));

        let covered = decode("2568:1-4000000000:* , 2568:7:*");
        assert_eq!(covered, tokens(&[(2568, 7)]));
    }

    #[test]
    fn test_decode_rejects_out_of_range_year() {
        let covered = decode("2147483647:12:* , -5:1:* , 0:3:* , 2568:2:*");
        assert_eq!(covered, tokens(&[(2568, 2)]));
    }

    #[test]
    fn test_month_token_from_date_applies_offset() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        assert_eq!(MonthToken::from_date(date, 543), MonthToken::new(2568, 6).unwrap());
    }

    #[test]
    fn test_month_token_parse() {
        assert_eq!("2568-06".parse::<MonthToken>(), Ok(MonthToken::new(2568, 6).unwrap()));
        assert!("2568-13".parse::<MonthToken>().is_err());
        assert!("2568".parse::<MonthToken>().is_err());
    }

    #[test]
    fn test_latest() {
        let covered = decode("2568:1-3:* , 2567:12:*");
        assert_eq!(covered.latest(), MonthToken::new(2568, 3));
        assert_eq!(CoveredMonths::new().latest(), None);
    }
}
