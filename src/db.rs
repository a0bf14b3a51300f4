use crate::store::{LogEntry, LogStore, MemberRecord, MemberStore, RenewalStore, SubmissionRecord};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use tracing::info;

/// What an audit row records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    EntitlementUpdated,
    MembersImported,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::EntitlementUpdated => "entitlement_updated",
            AuditKind::MembersImported => "members_imported",
        }
    }
}

/// One audit trail row: every entitlement change and import is kept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub recorded_at: DateTime<Utc>,
    pub kind: AuditKind,

    /// member_id, or "members" for directory-wide events
    pub subject: String,

    /// Transaction log row behind the change, if any
    pub submission_id: Option<String>,

    pub data: serde_json::Value,
}

impl AuditEvent {
    fn new(kind: AuditKind, subject: &str, submission_id: Option<&str>, data: serde_json::Value) -> Self {
        AuditEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            kind,
            subject: subject.to_string(),
            submission_id: submission_id.map(str::to_string),
            data,
        }
    }

    pub fn entitlement_updated(
        member_id: &str,
        previous: &str,
        updated: &str,
        submission_id: Option<&str>,
    ) -> Self {
        Self::new(
            AuditKind::EntitlementUpdated,
            member_id,
            submission_id,
            serde_json::json!({ "previous": previous, "updated": updated }),
        )
    }

    pub fn members_imported(summary: ImportSummary) -> Self {
        Self::new(
            AuditKind::MembersImported,
            "members",
            None,
            serde_json::json!({ "inserted": summary.inserted, "updated": summary.updated }),
        )
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Member directory (one entitlement string per member)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            member_id TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            aliases TEXT NOT NULL DEFAULT '',
            entitlement TEXT NOT NULL DEFAULT '-',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Transaction log (cells kept as text, like the sheet it replaces)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transaction_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            amount TEXT NOT NULL,
            transfer_time TEXT NOT NULL,
            status TEXT NOT NULL,
            slip_fingerprint TEXT NOT NULL DEFAULT '',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            recorded_at TEXT NOT NULL,
            kind TEXT NOT NULL,
            subject TEXT NOT NULL,
            submission_id TEXT,
            data TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_name ON members(name)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_logs_sender ON transaction_logs(sender_name)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_subject ON events(kind, subject)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// MEMBER IMPORT (spreadsheet export → members table)
// ============================================================================

/// One row of the member sheet export
#[derive(Debug, Deserialize)]
struct MemberCsvRow {
    #[serde(rename = "Member_ID")]
    member_id: String,

    #[serde(rename = "Name")]
    name: String,

    #[serde(rename = "Aliases", default)]
    aliases: String,

    #[serde(rename = "Entitlement", default)]
    entitlement: String,
}

impl From<MemberCsvRow> for MemberRecord {
    fn from(row: MemberCsvRow) -> Self {
        MemberRecord {
            member_id: row.member_id.trim().to_string(),
            name: row.name.trim().to_string(),
            aliases: row.aliases.trim().to_string(),
            entitlement: row.entitlement.trim().to_string(),
        }
    }
}

/// Load members from a CSV file with columns Member_ID, Name, Aliases, Entitlement
pub fn load_members_csv(csv_path: &Path) -> Result<Vec<MemberRecord>> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open CSV file: {:?}", csv_path))?;
    read_members_csv(file)
}

pub fn read_members_csv<R: Read>(reader: R) -> Result<Vec<MemberRecord>> {
    let mut rdr = csv::Reader::from_reader(reader);

    let mut members = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: MemberCsvRow =
            result.with_context(|| format!("Failed to deserialize member on row {}", line + 2))?;
        if row.member_id.trim().is_empty() {
            continue;
        }
        members.push(row.into());
    }

    Ok(members)
}

/// Counts from one import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Insert new members, refresh existing ones (matched by member_id)
pub fn upsert_members(conn: &Connection, members: &[MemberRecord]) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for member in members {
        let result = conn.execute(
            "INSERT INTO members (member_id, name, aliases, entitlement)
             VALUES (?1, ?2, ?3, ?4)",
            params![member.member_id, member.name, member.aliases, member.entitlement],
        );

        match result {
            Ok(_) => summary.inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                conn.execute(
                    "UPDATE members
                     SET name = ?2, aliases = ?3, entitlement = ?4, updated_at = CURRENT_TIMESTAMP
                     WHERE member_id = ?1",
                    params![member.member_id, member.name, member.aliases, member.entitlement],
                )?;
                summary.updated += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    record_event(conn, &AuditEvent::members_imported(summary))?;

    info!(inserted = summary.inserted, updated = summary.updated, "members imported");
    Ok(summary)
}

pub fn list_members(conn: &Connection) -> Result<Vec<MemberRecord>> {
    let mut stmt = conn.prepare(
        "SELECT member_id, name, aliases, entitlement
         FROM members
         ORDER BY name",
    )?;

    let members = stmt
        .query_map([], row_to_member)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(members)
}

pub fn count_members(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))?;

    Ok(count)
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemberRecord> {
    Ok(MemberRecord {
        member_id: row.get(0)?,
        name: row.get(1)?,
        aliases: row.get(2)?,
        entitlement: row.get(3)?,
    })
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

pub fn record_event(conn: &Connection, event: &AuditEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO events (event_id, recorded_at, kind, subject, submission_id, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.recorded_at.to_rfc3339(),
            event.kind.as_str(),
            event.subject,
            event.submission_id,
            serde_json::to_string(&event.data)?,
        ],
    )?;

    Ok(())
}

/// One past change of a member's entitlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementChange {
    pub recorded_at: DateTime<Utc>,
    pub previous: String,
    pub updated: String,
    pub submission_id: Option<String>,
}

/// Entitlement changes of `member_id`, newest first
pub fn entitlement_history(
    conn: &Connection,
    member_id: &str,
    limit: usize,
) -> Result<Vec<EntitlementChange>> {
    let mut stmt = conn.prepare(
        "SELECT recorded_at, submission_id, data
         FROM events
         WHERE kind = ?1 AND subject = ?2
         ORDER BY id DESC
         LIMIT ?3",
    )?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(
            params![AuditKind::EntitlementUpdated.as_str(), member_id, limit],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(recorded_at, submission_id, data)| {
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .with_context(|| format!("Bad event timestamp: {}", recorded_at))?
                .with_timezone(&Utc);
            let data: serde_json::Value =
                serde_json::from_str(&data).context("Bad event payload")?;
            let field = |name: &str| data[name].as_str().unwrap_or_default().to_string();

            Ok(EntitlementChange {
                recorded_at,
                previous: field("previous"),
                updated: field("updated"),
                submission_id,
            })
        })
        .collect()
}

/// Replace one entitlement and audit it, inside the caller's transaction
fn update_entitlement(
    conn: &Connection,
    member_id: &str,
    entitlement: &str,
    submission_id: Option<&str>,
) -> Result<()> {
    let previous: Option<String> = conn
        .query_row(
            "SELECT entitlement FROM members WHERE member_id = ?1",
            [member_id],
            |row| row.get(0),
        )
        .optional()?;

    let previous = match previous {
        Some(previous) => previous,
        None => bail!("Member not found: {}", member_id),
    };

    conn.execute(
        "UPDATE members
         SET entitlement = ?2, updated_at = CURRENT_TIMESTAMP
         WHERE member_id = ?1",
        params![member_id, entitlement],
    )?;

    record_event(
        conn,
        &AuditEvent::entitlement_updated(member_id, &previous, entitlement, submission_id),
    )
}

fn insert_log_row(conn: &Connection, record: &SubmissionRecord, status: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO transaction_logs (
            submission_id, timestamp, sender_name, amount, transfer_time, status, slip_fingerprint
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id,
            record.timestamp,
            record.sender_name,
            record.amount,
            record.transfer_time,
            status,
            record.slip_fingerprint,
        ],
    )
    .context("Failed to append transaction log entry")?;

    Ok(())
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Member directory + transaction log in one SQLite database
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    /// Fresh in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl MemberStore for SqliteStore {
    fn lookup(&self, key: &str) -> Result<Option<MemberRecord>> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(None);
        }

        // SQL narrows candidates; alias matching is exact per alias, done in Rust
        let mut stmt = self.conn.prepare(
            "SELECT member_id, name, aliases, entitlement
             FROM members
             WHERE trim(member_id) = ?1 OR trim(name) = ?1 OR instr(aliases, ?1) > 0
             ORDER BY id",
        )?;

        let candidates = stmt
            .query_map([key], row_to_member)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(candidates.into_iter().find(|m| m.matches(key)))
    }

    fn write_entitlement(&self, member_id: &str, entitlement: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        update_entitlement(&tx, member_id, entitlement, None)?;
        tx.commit()?;
        Ok(())
    }
}

impl RenewalStore for SqliteStore {
    fn record_renewal(
        &self,
        member_id: &str,
        entitlement: &str,
        record: &SubmissionRecord,
        status: &str,
    ) -> Result<()> {
        // Dropping the transaction on any error rolls back the entitlement too
        let tx = self.conn.unchecked_transaction()?;
        update_entitlement(&tx, member_id, entitlement, Some(&record.id))?;
        insert_log_row(&tx, record, status)?;
        tx.commit()?;
        Ok(())
    }
}

impl LogStore for SqliteStore {
    fn append_entry(&self, record: &SubmissionRecord, status: &str) -> Result<()> {
        insert_log_row(&self.conn, record, status)
    }

    fn recent_log(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT submission_id, timestamp, sender_name, amount, transfer_time, status, slip_fingerprint
             FROM transaction_logs
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut entries = stmt
            .query_map([limit], |row| {
                Ok(LogEntry {
                    record: SubmissionRecord {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        sender_name: row.get(2)?,
                        amount: row.get(3)?,
                        transfer_time: row.get(4)?,
                        slip_fingerprint: row.get(6)?,
                    },
                    status: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Oldest first, like the sheet
        entries.reverse();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, NaiveTime, TimeZone};

    fn create_test_member(member_id: &str, name: &str, aliases: &str, entitlement: &str) -> MemberRecord {
        MemberRecord::new(member_id, name, aliases, entitlement)
    }

    fn create_test_record(name: &str, amount: i64, h: u32, m: u32) -> SubmissionRecord {
        let at = Local.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        SubmissionRecord::new(at, name, amount, NaiveTime::from_hms_opt(h, m, 0).unwrap())
    }

    fn seeded_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        upsert_members(
            store.connection(),
            &[
                create_test_member("M001", "Somchai", "Chai, Somchai J.", "2568:1-3:*"),
                create_test_member("M002", "Malee", "", "-"),
                create_test_member("M003", "Chaiwat", "", "2567:12:*"),
            ],
        )
        .unwrap();
        store
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();
        assert_eq!(count_members(&conn).unwrap(), 0);
    }

    #[test]
    fn test_upsert_twice_updates() {
        let store = seeded_store();
        let conn = store.connection();

        let summary = upsert_members(
            conn,
            &[
                create_test_member("M002", "Malee", "Lee", "2568:6:*"),
                create_test_member("M004", "Niran", "", "-"),
            ],
        )
        .unwrap();

        assert_eq!(summary, ImportSummary { inserted: 1, updated: 1 });
        assert_eq!(count_members(conn).unwrap(), 4);
        assert_eq!(store.lookup("Lee").unwrap().unwrap().entitlement, "2568:6:*");
    }

    #[test]
    fn test_lookup_by_id_name_and_alias() {
        let store = seeded_store();

        assert_eq!(store.lookup("M001").unwrap().unwrap().name, "Somchai");
        assert_eq!(store.lookup("Somchai").unwrap().unwrap().member_id, "M001");
        assert_eq!(store.lookup("Chai").unwrap().unwrap().member_id, "M001");
        assert_eq!(store.lookup("Somchai J.").unwrap().unwrap().member_id, "M001");
        // "Chai" is a substring of "Chaiwat" but only an exact alias matches
        assert_eq!(store.lookup("Chaiwat").unwrap().unwrap().member_id, "M003");
        assert!(store.lookup("Cha").unwrap().is_none());
        assert!(store.lookup("  ").unwrap().is_none());
    }

    #[test]
    fn test_write_entitlement_records_history() {
        let store = seeded_store();

        store.write_entitlement("M001", "2568:1-5:*").unwrap();
        store.write_entitlement("M001", "2568:1-6:*").unwrap();
        assert_eq!(store.lookup("M001").unwrap().unwrap().entitlement, "2568:1-6:*");

        let history = entitlement_history(store.connection(), "M001", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].previous, "2568:1-5:*");
        assert_eq!(history[0].updated, "2568:1-6:*");
        assert_eq!(history[1].previous, "2568:1-3:*");
        assert_eq!(history[1].submission_id, None);

        assert_eq!(entitlement_history(store.connection(), "M001", 1).unwrap().len(), 1);
        assert!(entitlement_history(store.connection(), "M002", 10).unwrap().is_empty());
    }

    #[test]
    fn test_renewal_links_history_to_log_row() {
        let store = seeded_store();
        let rec = create_test_record("Malee", 100, 9, 0);

        store.record_renewal("M002", "2568:6:*", &rec, "Success: +1 months").unwrap();

        assert_eq!(store.lookup("M002").unwrap().unwrap().entitlement, "2568:6:*");
        assert_eq!(store.recent_log(10).unwrap()[0].record.id, rec.id);

        let history = entitlement_history(store.connection(), "M002", 10).unwrap();
        assert_eq!(history[0].submission_id.as_deref(), Some(rec.id.as_str()));
    }

    #[test]
    fn test_renewal_rolls_back_when_log_append_fails() {
        let store = seeded_store();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_log BEFORE INSERT ON transaction_logs
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let rec = create_test_record("Somchai", 100, 9, 0);
        assert!(store
            .record_renewal("M001", "2568:1-4:*", &rec, "Success: +1 months")
            .is_err());

        assert_eq!(store.lookup("M001").unwrap().unwrap().entitlement, "2568:1-3:*");
        assert!(entitlement_history(store.connection(), "M001", 10).unwrap().is_empty());
        assert!(store.recent_log(10).unwrap().is_empty());
    }

    #[test]
    fn test_write_entitlement_unknown_member_fails() {
        let store = seeded_store();
        assert!(store.write_entitlement("M404", "2568:1:*").is_err());
    }

    #[test]
    fn test_log_append_and_recent_order() {
        let store = seeded_store();

        for minute in 0..4 {
            let rec = create_test_record("Somchai", 300, 9, minute).with_fingerprint("ab".to_string());
            store.append_entry(&rec, "Success: +3 months").unwrap();
        }

        let recent = store.recent_log(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record.transfer_time, "09:02:00");
        assert_eq!(recent[1].record.transfer_time, "09:03:00");
        assert_eq!(recent[1].status, "Success: +3 months");
        assert_eq!(recent[1].record.slip_fingerprint, "ab");

        assert_eq!(store.recent_entries(100).unwrap().len(), 4);
    }

    #[test]
    fn test_read_members_csv() {
        let data = "Member_ID,Name,Aliases,Entitlement\n\
                    M001,Somchai,\"Chai, ชัย\",2568:1-3:*\n\
                    ,Blank row,,\n\
                    M002, Malee ,,-\n";

        let members = read_members_csv(data.as_bytes()).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].alias_list(), vec!["Chai", "ชัย"]);
        assert_eq!(members[1].name, "Malee");
        assert_eq!(members[1].entitlement, "-");
    }

    #[test]
    fn test_load_members_csv_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("members.csv");
        std::fs::write(&path, "Member_ID,Name,Aliases,Entitlement\nM9,Niran,,\n").unwrap();

        let members = load_members_csv(&path).unwrap();
        assert_eq!(members, vec![create_test_member("M9", "Niran", "", "")]);
    }

    #[test]
    fn test_import_is_audited() {
        let store = seeded_store();

        let kind: String = store
            .connection()
            .query_row(
                "SELECT kind FROM events WHERE subject = 'members' ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(kind, AuditKind::MembersImported.as_str());
    }
}
