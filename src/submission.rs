// 📨 Submission Orchestrator - One reported transfer, end to end
//
//   form → slip time → duplicate guard → member lookup
//        → decode → extend → encode → write entitlement + append log

use crate::calendar::MonthToken;
use crate::config::{AppConfig, SlipPolicy};
use crate::deduplication::DuplicateGuard;
use crate::error::{ConfigError, SubmissionError};
use crate::extender::EntitlementExtender;
use crate::slip::{slip_fingerprint, SlipTimeExtractor};
use crate::store::{RenewalStore, SubmissionRecord};
use anyhow::Context;
use chrono::{DateTime, Local, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Log status for a transfer whose sender is not in the directory
pub const STATUS_NAME_NOT_FOUND: &str = "Error: Name Not Found";

/// Log status for an accepted transfer
pub fn success_status(months: u32) -> String {
    format!("Success: +{} months", months)
}

// ============================================================================
// FORM + OUTCOME
// ============================================================================

/// What the member filled in
#[derive(Debug, Clone, Default)]
pub struct SubmissionForm {
    pub sender_name: String,
    pub amount: i64,
    pub slip_image: Vec<u8>,

    /// Time typed by the member (used only under the lenient policy)
    pub manual_time: Option<NaiveTime>,
}

/// Result of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Member found and entitlement extended
    Extended {
        member_id: String,
        member_name: String,
        months_added: u32,
        previous_entitlement: String,
        new_entitlement: String,
        transfer_time: NaiveTime,
    },

    /// Transfer logged, but nobody in the directory has that name
    MemberNotFound {
        sender_name: String,
        transfer_time: NaiveTime,
    },
}

impl SubmissionOutcome {
    /// Message shown to the member
    pub fn message(&self) -> String {
        match self {
            SubmissionOutcome::Extended {
                member_name,
                months_added,
                new_entitlement,
                ..
            } => format!(
                "Done! {} received {} more month(s). New entitlement: {}",
                member_name, months_added, new_entitlement
            ),
            SubmissionOutcome::MemberNotFound { sender_name, .. } => format!(
                "Transfer recorded, but '{}' was not found in the member list \
                 (entitlement not updated). Please contact an admin.",
                sender_name
            ),
        }
    }
}

/// A form that passed validation and had its slip read.
///
/// Produced by [`SubmissionService::prepare`] without touching any store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSubmission {
    sender_name: String,
    amount: i64,
    transfer_time: NaiveTime,
    slip_fingerprint: String,
}

impl PreparedSubmission {
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn transfer_time(&self) -> NaiveTime {
        self.transfer_time
    }
}

// ============================================================================
// SUBMISSION SERVICE
// ============================================================================

pub struct SubmissionService {
    extractor: Arc<dyn SlipTimeExtractor>,
    guard: DuplicateGuard,
    extender: EntitlementExtender,
    policy: SlipPolicy,
    year_offset: i32,

    /// Held across read-check-write so two handlers cannot lose an update
    write_lock: Mutex<()>,
}

impl SubmissionService {
    /// Service with the default settings
    pub fn new(extractor: Arc<dyn SlipTimeExtractor>) -> Self {
        Self::build(extractor, &AppConfig::default())
    }

    /// Service for `config`, which is validated first
    pub fn from_config(
        extractor: Arc<dyn SlipTimeExtractor>,
        config: &AppConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(extractor, config))
    }

    fn build(extractor: Arc<dyn SlipTimeExtractor>, config: &AppConfig) -> Self {
        SubmissionService {
            extractor,
            guard: DuplicateGuard::new()
                .with_buffer_minutes(config.buffer_minutes)
                .with_window(config.history_window),
            extender: EntitlementExtender::with_unit_price(config.unit_price)
                .with_max_months(config.max_months_per_submission),
            policy: config.slip_policy,
            year_offset: config.year_offset,
            write_lock: Mutex::new(()),
        }
    }

    pub fn extender(&self) -> &EntitlementExtender {
        &self.extender
    }

    pub fn policy(&self) -> SlipPolicy {
        self.policy
    }

    /// Current month in the stored year numbering
    pub fn current_month(&self, now: DateTime<Local>) -> MonthToken {
        MonthToken::from_date(now.date_naive(), self.year_offset)
    }

    /// Process one form submission: [`prepare`](Self::prepare) then
    /// [`commit`](Self::commit).
    pub fn submit<S>(
        &self,
        store: &S,
        form: &SubmissionForm,
        now: DateTime<Local>,
    ) -> Result<SubmissionOutcome, SubmissionError>
    where
        S: RenewalStore + ?Sized,
    {
        let prepared = self.prepare(form)?;
        self.commit(store, &prepared, now)
    }

    /// Validate the form and read the slip.
    ///
    /// Touches no store, so callers can run it (and the OCR inside it)
    /// before taking any lock around the store.
    pub fn prepare(&self, form: &SubmissionForm) -> Result<PreparedSubmission, SubmissionError> {
        self.validate(form)?;
        let transfer_time = self.resolve_transfer_time(form)?;

        Ok(PreparedSubmission {
            sender_name: form.sender_name.trim().to_string(),
            amount: form.amount,
            transfer_time,
            slip_fingerprint: slip_fingerprint(&form.slip_image),
        })
    }

    /// Duplicate check, lookup, extension and write for a prepared form.
    ///
    /// Duplicates leave both stores untouched. An unknown sender is still
    /// logged so an admin can follow up.
    pub fn commit<S>(
        &self,
        store: &S,
        prepared: &PreparedSubmission,
        now: DateTime<Local>,
    ) -> Result<SubmissionOutcome, SubmissionError>
    where
        S: RenewalStore + ?Sized,
    {
        let sender_name = prepared.sender_name.as_str();
        let transfer_time = prepared.transfer_time;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let history = store
            .recent_entries(self.guard.window)
            .context("Failed to read recent transaction log")?;

        if let Some(found) =
            self.guard
                .find_duplicate(&history, sender_name, prepared.amount, transfer_time)
        {
            warn!(sender = sender_name, amount = prepared.amount, reason = %found.reason, "duplicate submission rejected");
            let previous_time = crate::deduplication::parse_time_of_day(&found.previous.transfer_time)
                .unwrap_or(transfer_time);
            return Err(SubmissionError::Duplicate {
                previous_time,
                minutes_apart: found.minutes_apart,
            });
        }

        let record = SubmissionRecord::new(now, sender_name, prepared.amount, transfer_time)
            .with_fingerprint(prepared.slip_fingerprint.clone());

        let member = store
            .lookup(sender_name)
            .context("Failed to look up member")?;

        let member = match member {
            Some(member) => member,
            None => {
                store
                    .append_entry(&record, STATUS_NAME_NOT_FOUND)
                    .context("Failed to append transaction log entry")?;
                warn!(sender = sender_name, "sender not found in member directory");
                return Ok(SubmissionOutcome::MemberNotFound {
                    sender_name: sender_name.to_string(),
                    transfer_time,
                });
            }
        };

        let extension = self.extender.extend_detailed(
            &member.entitlement,
            prepared.amount,
            self.current_month(now),
        )?;

        store
            .record_renewal(
                &member.member_id,
                &extension.updated,
                &record,
                &success_status(extension.months_added),
            )
            .context("Failed to record renewal")?;

        info!(
            member = %member.member_id,
            months = extension.months_added,
            entitlement = %extension.updated,
            "entitlement extended"
        );

        Ok(SubmissionOutcome::Extended {
            member_id: member.member_id,
            member_name: member.name,
            months_added: extension.months_added,
            previous_entitlement: extension.previous,
            new_entitlement: extension.updated,
            transfer_time,
        })
    }

    /// Form checks done before anything else
    pub fn validate(&self, form: &SubmissionForm) -> Result<(), SubmissionError> {
        if form.slip_image.is_empty() {
            return Err(SubmissionError::MissingSlip);
        }
        if form.sender_name.trim().is_empty() {
            return Err(SubmissionError::MissingSenderName);
        }

        let unit_price = self.extender.unit_price;
        if unit_price <= 0 || form.amount < unit_price || form.amount % unit_price != 0 {
            return Err(SubmissionError::InvalidAmount {
                amount: form.amount,
                unit_price,
            });
        }

        self.extender.checked_months(form.amount)?;
        Ok(())
    }

    fn resolve_transfer_time(&self, form: &SubmissionForm) -> Result<NaiveTime, SubmissionError> {
        if let Some(time) = self.extractor.extract_time(&form.slip_image) {
            return Ok(time);
        }

        match self.policy {
            SlipPolicy::Guarded => Err(SubmissionError::SlipTimeUnreadable),
            SlipPolicy::Lenient => form.manual_time.ok_or(SubmissionError::MissingTransferTime),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
