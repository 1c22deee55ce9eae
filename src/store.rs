//! Embedded account store.
//!
//! One sqlite file (`keyset.db`) in WAL mode holds the fleet: who exists,
//! which profile directory they own, their proxy, their status and
//! cooldown, and the solver key. The schema only ever grows: adding a
//! column that already exists is a no-op, so old databases open cleanly.
//!
//! All strings go in and come out as UTF-8; the `encoding` pragma pins the
//! file encoding so historical mojibake cannot re-enter through the store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::Result;

/// Account lifecycle status as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountStatus {
    Ok,
    Cooldown,
    Error,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Ok => "ok",
            AccountStatus::Cooldown => "cooldown",
            AccountStatus::Error => "error",
            AccountStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(AccountStatus::Ok),
            "cooldown" => Some(AccountStatus::Cooldown),
            "error" => Some(AccountStatus::Error),
            "disabled" => Some(AccountStatus::Disabled),
            _ => None,
        }
    }
}

/// One persisted account row. The profile directory path is the key.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub profile: PathBuf,
    pub login: String,
    pub proxy: Option<String>,
    pub status: AccountStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub notes: Option<String>,
    pub captcha_key: Option<String>,
}

/// Thread-safe handle to the embedded store. Writes auto-commit; readers
/// see a committed snapshot (WAL).
pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    /// Open or create the store at `path` and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        // Only effective before the first table is created; pins new files
        // to UTF-8.
        conn.pragma_update(None, "encoding", "UTF-8").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                profile        TEXT PRIMARY KEY,
                login          TEXT NOT NULL,
                proxy          TEXT,
                status         TEXT NOT NULL DEFAULT 'ok',
                cooldown_until TEXT,
                last_ok        TEXT,
                last_error     TEXT,
                notes          TEXT
            )",
            [],
        )?;

        let store = Self { conn: Mutex::new(conn) };
        // Columns added after the first release; additive only.
        store.ensure_column("captcha_key", "TEXT")?;
        info!("account store ready at {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                profile        TEXT PRIMARY KEY,
                login          TEXT NOT NULL,
                proxy          TEXT,
                status         TEXT NOT NULL DEFAULT 'ok',
                cooldown_until TEXT,
                last_ok        TEXT,
                last_error     TEXT,
                notes          TEXT
            )",
            [],
        )?;
        let store = Self { conn: Mutex::new(conn) };
        store.ensure_column("captcha_key", "TEXT")?;
        Ok(store)
    }

    /// Add `column` if the accounts table does not have it yet.
    pub fn ensure_column(&self, column: &str, sql_type: &str) -> Result<()> {
        let conn = self.lock();
        let exists = {
            let mut stmt = conn.prepare("PRAGMA table_info(accounts)")?;
            let mut present = false;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                if name == column {
                    present = true;
                    break;
                }
            }
            present
        };
        if exists {
            debug!("column {} already present", column);
            return Ok(());
        }
        conn.execute(
            &format!("ALTER TABLE accounts ADD COLUMN {} {}", column, sql_type),
            [],
        )?;
        info!("added column {} to accounts", column);
        Ok(())
    }

    /// Create or update an account by profile key. A fresh row starts as
    /// `ok`; an existing row keeps its status and timestamps.
    pub fn upsert(
        &self,
        profile: &Path,
        login: &str,
        proxy: Option<&str>,
        captcha_key: Option<&str>,
        notes: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO accounts (profile, login, proxy, status, notes, captcha_key)
             VALUES (?1, ?2, ?3, 'ok', ?4, ?5)
             ON CONFLICT(profile) DO UPDATE SET
                 login = excluded.login,
                 proxy = excluded.proxy,
                 notes = excluded.notes,
                 captcha_key = excluded.captcha_key",
            params![path_str(profile), login, proxy, notes, captcha_key],
        )?;
        Ok(())
    }

    /// Status transition, used by the Session Pool.
    pub fn update_status(
        &self,
        profile: &Path,
        status: AccountStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE accounts SET status = ?2, last_error = ?3 WHERE profile = ?1",
            params![path_str(profile), status.as_str(), last_error],
        )?;
        Ok(())
    }

    /// Record a successful login.
    pub fn mark_ok(&self, profile: &Path) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE accounts
             SET status = 'ok', last_ok = ?2, last_error = NULL, cooldown_until = NULL
             WHERE profile = ?1",
            params![path_str(profile), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Put the account on cooldown until `until`.
    pub fn set_cooldown(&self, profile: &Path, until: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE accounts SET status = 'cooldown', cooldown_until = ?2 WHERE profile = ?1",
            params![path_str(profile), until.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Rows ordered by profile, optionally restricted to a status set.
    pub fn list(&self, filter: Option<&[AccountStatus]>) -> Result<Vec<AccountRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT profile, login, proxy, status, cooldown_until, last_ok,
                    last_error, notes, captcha_key
             FROM accounts ORDER BY profile",
        )?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            let record = row?;
            if let Some(filter) = filter {
                if !filter.contains(&record.status) {
                    continue;
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Single row by profile key.
    pub fn get(&self, profile: &Path) -> Result<Option<AccountRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT profile, login, proxy, status, cooldown_until, last_ok,
                        last_error, notes, captcha_key
                 FROM accounts WHERE profile = ?1",
                params![path_str(profile)],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRecord> {
    let status_text: String = row.get(3)?;
    Ok(AccountRecord {
        profile: PathBuf::from(row.get::<_, String>(0)?),
        login: row.get(1)?,
        proxy: row.get(2)?,
        // An unknown status string means the row predates this binary;
        // treat it as disabled rather than failing the whole listing.
        status: AccountStatus::parse(&status_text).unwrap_or(AccountStatus::Disabled),
        cooldown_until: parse_ts(row.get::<_, Option<String>>(4)?),
        last_ok: parse_ts(row.get::<_, Option<String>>(5)?),
        last_error: row.get(6)?,
        notes: row.get(7)?,
        captcha_key: row.get(8)?,
    })
}

fn parse_ts(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyset.db");
        {
            let store = AccountStore::open(&path).unwrap();
            store
                .upsert(Path::new("profiles/anna"), "anna", None, None, None)
                .unwrap();
        }
        let store = AccountStore::open(&path).unwrap();
        let rows = store.list(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].login, "anna");
    }

    #[test]
    fn ensure_column_twice_is_noop() {
        let store = AccountStore::open_in_memory().unwrap();
        store.ensure_column("captcha_key", "TEXT").unwrap();
        store.ensure_column("captcha_key", "TEXT").unwrap();
    }

    #[test]
    fn upsert_creates_then_updates_without_losing_status() {
        let store = AccountStore::open_in_memory().unwrap();
        let profile = Path::new("profiles/anna");

        store.upsert(profile, "anna", Some("1.2.3.4:8080"), None, None).unwrap();
        store.update_status(profile, AccountStatus::Error, Some("boom")).unwrap();
        store.upsert(profile, "anna", Some("1.2.3.4:8080"), Some("k"), Some("n")).unwrap();

        let record = store.get(profile).unwrap().unwrap();
        assert_eq!(record.status, AccountStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert_eq!(record.captcha_key.as_deref(), Some("k"));
    }

    #[test]
    fn mark_ok_clears_error_and_cooldown() {
        let store = AccountStore::open_in_memory().unwrap();
        let profile = Path::new("profiles/anna");
        store.upsert(profile, "anna", None, None, None).unwrap();
        store.set_cooldown(profile, Utc::now()).unwrap();
        store.update_status(profile, AccountStatus::Error, Some("x")).unwrap();

        store.mark_ok(profile).unwrap();
        let record = store.get(profile).unwrap().unwrap();
        assert_eq!(record.status, AccountStatus::Ok);
        assert!(record.last_ok.is_some());
        assert!(record.last_error.is_none());
        assert!(record.cooldown_until.is_none());
    }

    #[test]
    fn list_filters_by_status_and_orders_by_profile() {
        let store = AccountStore::open_in_memory().unwrap();
        store.upsert(Path::new("profiles/b"), "boris", None, None, None).unwrap();
        store.upsert(Path::new("profiles/a"), "anna", None, None, None).unwrap();
        store
            .update_status(Path::new("profiles/b"), AccountStatus::Disabled, None)
            .unwrap();

        let all = store.list(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].login, "anna");

        let ok_only = store.list(Some(&[AccountStatus::Ok])).unwrap();
        assert_eq!(ok_only.len(), 1);
        assert_eq!(ok_only[0].login, "anna");
    }

    #[test]
    fn cyrillic_round_trips_as_utf8() {
        let store = AccountStore::open_in_memory().unwrap();
        let profile = Path::new("profiles/анна");
        store
            .upsert(profile, "анна", None, None, Some("заметка про прокси"))
            .unwrap();
        let record = store.get(profile).unwrap().unwrap();
        assert_eq!(record.login, "анна");
        assert_eq!(record.notes.as_deref(), Some("заметка про прокси"));
    }
}
