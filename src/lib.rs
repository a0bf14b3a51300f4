// Slip Renewal - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod calendar;       // Entitlement string codec
pub mod extender;       // Amount → extra covered months
pub mod deduplication;  // Duplicate Guard
pub mod store;          // Member directory + log contracts
pub mod db;             // SQLite stores
pub mod slip;           // Slip time extraction
pub mod submission;     // Orchestrator
pub mod config;
pub mod error;

// Re-export commonly used types
pub use calendar::{decode, encode, CoveredMonths, MonthToken};
pub use extender::{extend, EntitlementExtender, Extension};
pub use deduplication::{is_duplicate, parse_time_of_day, DuplicateGuard, DuplicateMatch};
pub use store::{
    InMemoryStore, LogEntry, LogStore, MemberRecord, MemberStore, RenewalStore, SubmissionRecord,
};
pub use db::{
    AuditEvent, AuditKind, EntitlementChange, ImportSummary, SqliteStore,
    setup_database, load_members_csv, read_members_csv, upsert_members,
    list_members, count_members, record_event, entitlement_history,
};
pub use slip::{
    CommandRecognizer, NoSlipReader, OcrSlipReader, SlipTimeExtractor, TextRecognizer,
    find_time_in_text, slip_fingerprint,
};
pub use submission::{PreparedSubmission, SubmissionForm, SubmissionOutcome, SubmissionService};
pub use config::{AppConfig, OcrConfig, ServerConfig, SlipPolicy};
pub use error::{ConfigError, ExtendError, SubmissionError};

use std::sync::Arc;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the slip extractor described by the config.
///
/// The OCR engine is created here once and shared by every submission.
pub fn build_extractor(config: &AppConfig) -> Arc<dyn SlipTimeExtractor> {
    match &config.ocr {
        Some(ocr) => {
            let recognizer: Arc<dyn TextRecognizer> = Arc::new(ocr.recognizer());
            Arc::new(OcrSlipReader::new(recognizer))
        }
        None => Arc::new(NoSlipReader),
    }
}
