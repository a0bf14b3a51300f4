// 🗂️ Store Contracts - Member directory + transaction log
//
// The directory and the log are spreadsheets at heart: every cell is text.
// Records here keep that string shape; the core converts to typed values
// (MonthToken, NaiveTime, i64) only inside its own algorithms.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

// ============================================================================
// MEMBER RECORD
// ============================================================================

/// One row of the member directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Primary id (stable, used as the row reference for writes)
    pub member_id: String,

    /// Display name, as members type it on the form
    pub name: String,

    /// Comma-separated alternative names, e.g. "Nok, น้อย"
    pub aliases: String,

    /// Serialized entitlement, e.g. "2568:1-6:*"
    pub entitlement: String,
}

impl MemberRecord {
    pub fn new(member_id: &str, name: &str, aliases: &str, entitlement: &str) -> Self {
        MemberRecord {
            member_id: member_id.to_string(),
            name: name.to_string(),
            aliases: aliases.to_string(),
            entitlement: entitlement.to_string(),
        }
    }

    /// Aliases split out of the comma-separated field, trimmed, blanks dropped
    pub fn alias_list(&self) -> Vec<&str> {
        self.aliases
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect()
    }

    /// Exact match on id, display name or any alias (after trimming)
    pub fn matches(&self, key: &str) -> bool {
        let key = key.trim();
        if key.is_empty() {
            return false;
        }

        self.member_id.trim() == key
            || self.name.trim() == key
            || self.alias_list().iter().any(|alias| *alias == key)
    }
}

// ============================================================================
// SUBMISSION RECORD
// ============================================================================

/// One reported transfer, as written to the transaction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Submission id (UUID)
    pub id: String,

    /// Wall-clock time the form was submitted (informational only)
    pub timestamp: String,

    pub sender_name: String,

    /// Amount as text, e.g. "500"
    pub amount: String,

    /// Time of day printed on the slip, e.g. "14:20:00"
    pub transfer_time: String,

    /// SHA-256 of the slip image (empty when unknown)
    pub slip_fingerprint: String,
}

impl SubmissionRecord {
    /// Build a record from typed form values
    pub fn new(
        submitted_at: DateTime<Local>,
        sender_name: &str,
        amount: i64,
        transfer_time: NaiveTime,
    ) -> Self {
        SubmissionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: submitted_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            sender_name: sender_name.trim().to_string(),
            amount: amount.to_string(),
            transfer_time: transfer_time.format("%H:%M:%S").to_string(),
            slip_fingerprint: String::new(),
        }
    }

    /// Builder pattern: attach the slip fingerprint
    pub fn with_fingerprint(mut self, fingerprint: String) -> Self {
        self.slip_fingerprint = fingerprint;
        self
    }
}

/// A log row: the submission plus the outcome status text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub record: SubmissionRecord,

    /// e.g. "Success: +3 months", "Error: Name Not Found"
    pub status: String,
}

// ============================================================================
// STORE TRAITS
// ============================================================================

/// Member directory
pub trait MemberStore {
    /// Find a member by primary id, display name or alias
    fn lookup(&self, key: &str) -> Result<Option<MemberRecord>>;

    /// Replace the entitlement of `member_id`
    fn write_entitlement(&self, member_id: &str, entitlement: &str) -> Result<()>;
}

/// Transaction log
pub trait LogStore {
    /// Append one row
    fn append_entry(&self, record: &SubmissionRecord, status: &str) -> Result<()>;

    /// Last `limit` rows, oldest first
    fn recent_log(&self, limit: usize) -> Result<Vec<LogEntry>>;

    /// Last `limit` submissions, oldest first
    fn recent_entries(&self, limit: usize) -> Result<Vec<SubmissionRecord>> {
        Ok(self
            .recent_log(limit)?
            .into_iter()
            .map(|entry| entry.record)
            .collect())
    }
}

/// Member directory and log that can change together.
///
/// A renewal either updates the entitlement and appends its log row, or
/// leaves both untouched. A half-applied renewal would hide the transfer
/// from the duplicate check while keeping the extra months.
pub trait RenewalStore: MemberStore + LogStore {
    fn record_renewal(
        &self,
        member_id: &str,
        entitlement: &str,
        record: &SubmissionRecord,
        status: &str,
    ) -> Result<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Both stores held in memory (tests, dry runs)
#[derive(Clone, Default)]
pub struct InMemoryStore {
    members: Arc<RwLock<Vec<MemberRecord>>>,
    log: Arc<RwLock<Vec<LogEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create store pre-filled with members
    pub fn with_members(members: Vec<MemberRecord>) -> Self {
        InMemoryStore {
            members: Arc::new(RwLock::new(members)),
            log: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add_member(&self, member: MemberRecord) -> Result<()> {
        let mut members = self
            .members
            .write()
            .map_err(|_| anyhow!("member list lock poisoned"))?;
        members.push(member);
        Ok(())
    }

    /// Snapshot of every member
    pub fn members(&self) -> Result<Vec<MemberRecord>> {
        let members = self
            .members
            .read()
            .map_err(|_| anyhow!("member list lock poisoned"))?;
        Ok(members.clone())
    }

    /// Number of log rows
    pub fn log_len(&self) -> Result<usize> {
        let log = self.log.read().map_err(|_| anyhow!("log lock poisoned"))?;
        Ok(log.len())
    }
}

impl MemberStore for InMemoryStore {
    fn lookup(&self, key: &str) -> Result<Option<MemberRecord>> {
        let members = self
            .members
            .read()
            .map_err(|_| anyhow!("member list lock poisoned"))?;
        Ok(members.iter().find(|m| m.matches(key)).cloned())
    }

    fn write_entitlement(&self, member_id: &str, entitlement: &str) -> Result<()> {
        let mut members = self
            .members
            .write()
            .map_err(|_| anyhow!("member list lock poisoned"))?;
        let member = members
            .iter_mut()
            .find(|m| m.member_id == member_id)
            .ok_or_else(|| anyhow!("Member not found: {}", member_id))?;
        member.entitlement = entitlement.to_string();
        Ok(())
    }
}

impl LogStore for InMemoryStore {
    fn append_entry(&self, record: &SubmissionRecord, status: &str) -> Result<()> {
        let mut log = self.log.write().map_err(|_| anyhow!("log lock poisoned"))?;
        log.push(LogEntry {
            record: record.clone(),
            status: status.to_string(),
        });
        Ok(())
    }

    fn recent_log(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let log = self.log.read().map_err(|_| anyhow!("log lock poisoned"))?;
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }
}

impl RenewalStore for InMemoryStore {
    fn record_renewal(
        &self,
        member_id: &str,
        entitlement: &str,
        record: &SubmissionRecord,
        status: &str,
    ) -> Result<()> {
        // Both locks taken and the member found before anything is changed
        let mut members = self
            .members
            .write()
            .map_err(|_| anyhow!("member list lock poisoned"))?;
        let mut log = self.log.write().map_err(|_| anyhow!("log lock poisoned"))?;

        let member = members
            .iter_mut()
            .find(|m| m.member_id == member_id)
            .ok_or_else(|| anyhow!("Member not found: {}", member_id))?;

        member.entitlement = entitlement.to_string();
        log.push(LogEntry {
            record: record.clone(),
            status: status.to_string(),
        });
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_members() -> Vec<MemberRecord> {
        vec![
            MemberRecord::new("M001", "Somchai", "Chai, ชัย", "2568:1-3:*"),
            MemberRecord::new("M002", "Malee", "", "-"),
        ]
    }

    fn record(name: &str, amount: i64, h: u32, m: u32) -> SubmissionRecord {
        let at = Local.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        SubmissionRecord::new(at, name, amount, NaiveTime::from_hms_opt(h, m, 0).unwrap())
    }

    #[test]
    fn test_member_matches_id_name_and_alias() {
        let member = &sample_members()[0];

        assert!(member.matches("M001"));
        assert!(member.matches("Somchai"));
        assert!(member.matches(" Chai "));
        assert!(member.matches("ชัย"));
        assert!(!member.matches("somchai"));
        assert!(!member.matches("Cha"));
        assert!(!member.matches(""));
    }

    #[test]
    fn test_alias_list_drops_blanks() {
        let member = MemberRecord::new("M9", "X", " a ,, b ,", "-");
        assert_eq!(member.alias_list(), vec!["a", "b"]);
    }

    #[test]
    fn test_submission_record_formats_cells() {
        let rec = record("  Somchai ", 500, 14, 5);
        assert_eq!(rec.sender_name, "Somchai");
        assert_eq!(rec.amount, "500");
        assert_eq!(rec.transfer_time, "14:05:00");
        assert_eq!(rec.timestamp, "2025-06-01 12:00:00");
        assert_eq!(rec.id.len(), 36);
    }

    #[test]
    fn test_in_memory_lookup_and_write() {
        let store = InMemoryStore::with_members(sample_members());

        let found = store.lookup("Chai").unwrap().unwrap();
        assert_eq!(found.member_id, "M001");
        assert!(store.lookup("Nobody").unwrap().is_none());

        store.write_entitlement("M002", "2568:6:*").unwrap();
        assert_eq!(store.lookup("Malee").unwrap().unwrap().entitlement, "2568:6:*");

        assert!(store.write_entitlement("M404", "2568:6:*").is_err());
    }

    #[test]
    fn test_in_memory_recent_entries_keeps_tail_in_order() {
        let store = InMemoryStore::new();
        for minute in 0..5 {
            store.append_entry(&record("A", 100, 10, minute), "Success: +1 months").unwrap();
        }

        let recent = store.recent_entries(3).unwrap();
        let times: Vec<&str> = recent.iter().map(|r| r.transfer_time.as_str()).collect();
        assert_eq!(times, vec!["10:02:00", "10:03:00", "10:04:00"]);

        assert_eq!(store.recent_log(10).unwrap().len(), 5);
        assert_eq!(store.log_len().unwrap(), 5);
    }

    #[test]
    fn test_in_memory_renewal_updates_both_or_neither() {
        let store = InMemoryStore::with_members(sample_members());

        store
            .record_renewal("M002", "2568:6:*", &record("Malee", 100, 9, 0), "Success: +1 months")
            .unwrap();
        assert_eq!(store.lookup("M002").unwrap().unwrap().entitlement, "2568:6:*");
        assert_eq!(store.log_len().unwrap(), 1);

        assert!(store
            .record_renewal("M404", "2568:6:*", &record("Ghost", 100, 9, 5), "Success: +1 months")
            .is_err());
        assert_eq!(store.log_len().unwrap(), 1);
    }
}
