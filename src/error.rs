//! Error types for submissions and configuration.

use crate::calendar::MonthToken;
use chrono::NaiveTime;
use thiserror::Error;

/// Why an entitlement could not be extended
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtendError {
    #[error("Amount buys {months} months, more than the {max} allowed per payment")]
    TooManyMonths { months: u32, max: u32 },

    #[error("Entitlement cannot be extended past {last}")]
    CalendarLimit { last: MonthToken },
}

/// Why a submission was refused
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Please upload the payment slip")]
    MissingSlip,

    #[error("Please enter the sender name")]
    MissingSenderName,

    #[error("Amount must be a whole multiple of {unit_price} (got {amount})")]
    InvalidAmount { amount: i64, unit_price: i64 },

    #[error("Could not read the transfer time from the slip")]
    SlipTimeUnreadable,

    #[error("Could not read the transfer time from the slip and no time was entered")]
    MissingTransferTime,

    #[error("This transfer was already reported at {previous_time} ({minutes_apart} min apart)")]
    Duplicate {
        previous_time: NaiveTime,
        minutes_apart: i64,
    },

    #[error(transparent)]
    Extend(#[from] ExtendError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SubmissionError {
    /// True for mistakes the member can fix on the form
    pub fn is_user_error(&self) -> bool {
        !matches!(self, SubmissionError::Store(_))
    }
}

/// Configuration file problems
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = SubmissionError::InvalidAmount { amount: 150, unit_price: 100 };
        assert_eq!(err.to_string(), "Amount must be a whole multiple of 100 (got 150)");

        let err = SubmissionError::Duplicate {
            previous_time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            minutes_apart: 20,
        };
        assert!(err.to_string().contains("14:00:00"));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_extend_error_is_user_error() {
        let err: SubmissionError = ExtendError::TooManyMonths { months: 500, max: 120 }.into();
        assert!(err.is_user_error());
        assert_eq!(
            err.to_string(),
            "Amount buys 500 months, more than the 120 allowed per payment"
        );
    }

    #[test]
    fn test_store_error_is_not_user_error() {
        let err: SubmissionError = anyhow::anyhow!("disk full").into();
        assert!(!err.is_user_error());
        assert_eq!(err.to_string(), "disk full");
    }
}
