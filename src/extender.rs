// ➕ Entitlement Extender - Turn a paid amount into extra covered months
//
// Rules:
//   months = amount / unit_price (integer division)
//   anchor = latest covered month, or the month before "now" if none
//   new months are appended one by one after the anchor
//   at most `max_months` per payment

use crate::calendar::{decode, encode, CoveredMonths, MonthToken};
use crate::error::ExtendError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Price of one month of membership, in currency units
pub const DEFAULT_UNIT_PRICE: i64 = 100;

/// Months one payment may buy (ten years)
pub const DEFAULT_MAX_MONTHS: u32 = 120;

// ============================================================================
// EXTENSION RESULT
// ============================================================================

/// Summary of one extension, for messages and the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    /// Entitlement string before the payment (as stored)
    pub previous: String,

    /// Entitlement string after the payment (canonical)
    pub updated: String,

    /// Number of months appended
    pub months_added: u32,

    /// First appended month (None when nothing was added)
    pub first_added: Option<MonthToken>,

    /// Last appended month (None when nothing was added)
    pub last_added: Option<MonthToken>,
}

impl Extension {
    fn unchanged(current: &str) -> Self {
        Extension {
            previous: current.to_string(),
            updated: current.to_string(),
            months_added: 0,
            first_added: None,
            last_added: None,
        }
    }
}

// ============================================================================
// ENTITLEMENT EXTENDER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitlementExtender {
    /// Price of one month (default: 100)
    pub unit_price: i64,

    /// Largest number of months one payment may add (default: 120)
    pub max_months: u32,
}

impl EntitlementExtender {
    /// Create extender with the standard price of 100 per month
    pub fn new() -> Self {
        Self::with_unit_price(DEFAULT_UNIT_PRICE)
    }

    pub fn with_unit_price(unit_price: i64) -> Self {
        EntitlementExtender {
            unit_price,
            max_months: DEFAULT_MAX_MONTHS,
        }
    }

    pub fn with_max_months(mut self, max_months: u32) -> Self {
        self.max_months = max_months;
        self
    }

    /// Months for `amount_paid`, refused when above `max_months`
    pub fn checked_months(&self, amount_paid: i64) -> Result<u32, ExtendError> {
        let months = self.months_for_amount(amount_paid);
        if months > self.max_months {
            return Err(ExtendError::TooManyMonths {
                months,
                max: self.max_months,
            });
        }
        Ok(months)
    }

    /// Whole months bought by `amount_paid`; zero for non-positive amounts
    pub fn months_for_amount(&self, amount_paid: i64) -> u32 {
        if self.unit_price <= 0 || amount_paid <= 0 {
            return 0;
        }
        u32::try_from(amount_paid / self.unit_price).unwrap_or(u32::MAX)
    }

    /// Extend `current` by the months `amount_paid` buys and re-encode.
    ///
    /// `now` is the caller's current month in the stored year numbering;
    /// it only matters when `current` covers nothing. An amount the
    /// extender refuses leaves `current` unchanged.
    pub fn extend(&self, current: &str, amount_paid: i64, now: MonthToken) -> String {
        match self.extend_detailed(current, amount_paid, now) {
            Ok(ext) => ext.updated,
            Err(e) => {
                warn!(current, amount_paid, error = %e, "extension refused, entitlement unchanged");
                current.to_string()
            }
        }
    }

    /// Same as [`extend`](Self::extend), also reporting which months were added
    pub fn extend_detailed(
        &self,
        current: &str,
        amount_paid: i64,
        now: MonthToken,
    ) -> Result<Extension, ExtendError> {
        let months_to_add = self.checked_months(amount_paid)?;
        if months_to_add == 0 {
            return Ok(Extension::unchanged(current));
        }

        let mut covered = decode(current);
        let mut cursor =
            anchor_month(&covered, now).ok_or(ExtendError::CalendarLimit { last: now })?;
        let mut first_added = None;

        for _ in 0..months_to_add {
            cursor = cursor
                .next()
                .ok_or(ExtendError::CalendarLimit { last: cursor })?;
            first_added.get_or_insert(cursor);
            covered.insert(cursor);
        }

        Ok(Extension {
            previous: current.to_string(),
            updated: encode(&covered),
            months_added: months_to_add,
            first_added,
            last_added: Some(cursor),
        })
    }
}

impl Default for EntitlementExtender {
    fn default() -> Self {
        Self::new()
    }
}

/// Month right before the first month to add.
///
/// With no coverage the anchor is the month before `now`, so the first
/// added month is the current one.
pub fn anchor_month(covered: &CoveredMonths, now: MonthToken) -> Option<MonthToken> {
    covered.latest().or_else(|| now.previous())
}

/// Extend with the standard unit price
pub fn extend(current: &str, amount_paid: i64, now: MonthToken) -> String {
    EntitlementExtender::new().extend(current, amount_paid, now)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn month(year: i32, month: u32) -> MonthToken {
        MonthToken::new(year, month).unwrap()
    }

    #[test]
    fn test_extend_after_latest_covered_month() {
        let updated = extend("2024:1-3:* , 2024:5:*", 200, month(2030, 1));
        assert_eq!(updated, "2024:1-3:* , 2024:5-7:*");
    }

    #[test]
    fn test_extend_empty_starts_at_current_month() {
        assert_eq!(extend("-", 300, month(2568, 6)), "2568:6-8:*");
        assert_eq!(extend("", 100, month(2568, 6)), "2568:6:*");
        assert_eq!(extend("None", 100, month(2568, 6)), "2568:6:*");
    }

    #[test]
    fn test_extend_empty_in_january_anchors_on_previous_december() {
        assert_eq!(extend("nan", 200, month(2568, 1)), "2568:1-2:*");
    }

    #[test]
    fn test_extend_rolls_over_year() {
        let updated = extend("2567:10-12:*", 300, month(2568, 1));
        assert_eq!(updated, "2567:10-12:* , 2568:1-3:*");
    }

    #[test]
    fn test_extend_ignores_now_when_coverage_exists() {
        // Lapsed member: resumes from the last paid month, not from now
        let updated = extend("2566:3:*", 100, month(2568, 9));
        assert_eq!(updated, "2566:3-4:*");
    }

    #[test]
    fn test_zero_amount_is_noop() {
        for current in ["2568:1:*", "-", "garbage", " 2568 : 1 "] {
            assert_eq!(extend(current, 0, month(2568, 6)), current);
        }
    }

    #[test]
    fn test_partial_unit_rounds_down() {
        assert_eq!(extend("-", 250, month(2568, 6)), "2568:6-7:*");
        assert_eq!(extend("2568:1:*", 99, month(2568, 6)), "2568:1:*");
    }

    #[test]
    fn test_negative_amount_is_noop() {
        assert_eq!(extend("2568:1:*", -300, month(2568, 6)), "2568:1:*");
    }

    #[test]
    fn test_extension_count_grows_by_months_paid() {
        for (current, amount) in [("2568:1-3:*", 400), ("-", 1200), ("2567:2:* , 2567:8:*", 500)] {
            let before = decode(current).len();
            let after = decode(&extend(current, amount, month(2568, 6))).len();
            assert_eq!(after, before + (amount / 100) as usize);
        }
    }

    #[test]
    fn test_extend_normalizes_hand_edited_input() {
        let updated = extend("2568:2-1:* , 2568: 3 :*", 100, month(2568, 6));
        assert_eq!(updated, "2568:3-4:*");
    }

    #[test]
    fn test_extend_detailed_reports_added_months() {
        let extender = EntitlementExtender::new();
        let ext = extender.extend_detailed("2567:12:*", 200, month(2568, 6)).unwrap();

        assert_eq!(ext.previous, "2567:12:*");
        assert_eq!(ext.updated, "2567:12:* , 2568:1-2:*");
        assert_eq!(ext.months_added, 2);
        assert_eq!(ext.first_added, Some(month(2568, 1)));
        assert_eq!(ext.last_added, Some(month(2568, 2)));
    }

    #[test]
    fn test_custom_unit_price() {
        let extender = EntitlementExtender::with_unit_price(150);
        assert_eq!(extender.months_for_amount(450), 3);
        assert_eq!(extender.extend("-", 300, month(2568, 6)), "2568:6-7:*");
    }

    #[test]
    fn test_amount_above_cap_is_refused() {
        let extender = EntitlementExtender::new().with_max_months(12);

        assert_eq!(extender.checked_months(1200), Ok(12));
        assert_eq!(
            extender.extend_detailed("-", 1300, month(2568, 6)),
            Err(ExtendError::TooManyMonths { months: 13, max: 12 })
        );
        // The plain form leaves the string alone
        assert_eq!(extender.extend("2568:1:*", 1300, month(2568, 6)), "2568:1:*");

        let err = EntitlementExtender::new().extend_detailed("-", i64::MAX, month(2568, 6));
        assert!(matches!(err, Err(ExtendError::TooManyMonths { months: u32::MAX, .. })));
    }

    #[test]
    fn test_extend_stops_at_calendar_limit() {
        let extender = EntitlementExtender::new();
        let last = month(crate::calendar::MAX_YEAR, 12);

        assert_eq!(
            extender.extend_detailed("9999:11-12:*", 100, month(2568, 6)),
            Err(ExtendError::CalendarLimit { last })
        );
        // Out-of-range stored years are discarded, so this starts from now
        assert_eq!(extend("2147483647:12:*", 100, month(2568, 6)), "2568:6:*");
    }
}
