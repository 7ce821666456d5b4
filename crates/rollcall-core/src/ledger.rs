//! Attendance ledger: per-identity entry/exit timestamps in a CSV file.
//!
//! Schema: header `Name,Timestamp,ExitTime`, then one line per entry with
//! an empty exit field while the shift is open. Every mutating call rewrites
//! the whole file. The store assumes it is the only writer of that file;
//! within the process, writes are serialized by an internal lock.

use crate::types::{validate_identity, IdentityError, FIELD_DELIMITER};
use chrono::{Duration, NaiveDateTime, Timelike};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const LEDGER_HEADER: &str = "Name,Timestamp,ExitTime";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Minimum time between check-in and a valid check-out.
pub const DEFAULT_MIN_SHIFT_SECS: i64 = 8 * 60 * 60;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed ledger line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("invalid identity: {0}")]
    Identity(#[from] IdentityError),
}

/// Position of one identity in the check-in/check-out state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShiftState {
    NoRecord,
    CheckedIn,
    CheckedOut,
}

/// What a `record` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New entry created with the entry timestamp.
    EntryMarked,
    /// Open entry closed with the exit timestamp.
    ExitMarked,
    /// Shift still running; nothing written.
    TooEarly { remaining: Duration },
    /// Exit already set; nothing written.
    AlreadyCheckedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub entry: NaiveDateTime,
    pub exit: Option<NaiveDateTime>,
}

impl LedgerEntry {
    pub fn state(&self) -> ShiftState {
        if self.exit.is_some() {
            ShiftState::CheckedOut
        } else {
            ShiftState::CheckedIn
        }
    }

    fn to_line(&self) -> String {
        let exit = self
            .exit
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();
        format!(
            "{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{exit}",
            self.identity,
            self.entry.format(TIMESTAMP_FORMAT)
        )
    }
}

/// File-backed attendance ledger.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    min_shift: Duration,
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>, min_shift: Duration) -> Self {
        Self {
            path: path.into(),
            min_shift,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_shift(&self) -> Duration {
        self.min_shift
    }

    /// Advance `identity` through NoRecord → CheckedIn → CheckedOut.
    ///
    /// Timestamps are stored with second precision.
    pub fn record(&self, identity: &str, now: NaiveDateTime) -> Result<RecordOutcome, LedgerError> {
        let identity = validate_identity(identity)?;
        let now = now.with_nanosecond(0).unwrap_or(now);

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.read_entries()?;

        // Legacy append-only files may hold several lines per identity; the last one is current.
        let outcome = match entries.iter().rposition(|e| e.identity == identity) {
            None => {
                entries.push(LedgerEntry {
                    identity: identity.to_string(),
                    entry: now,
                    exit: None,
                });
                RecordOutcome::EntryMarked
            }
            Some(idx) => {
                let current = &mut entries[idx];
                if current.exit.is_some() {
                    tracing::debug!(identity, "already checked out");
                    return Ok(RecordOutcome::AlreadyCheckedOut);
                }
                let elapsed = now - current.entry;
                if elapsed < self.min_shift {
                    let remaining = self.min_shift - elapsed;
                    tracing::debug!(
                        identity,
                        remaining_secs = remaining.num_seconds(),
                        "too early to check out"
                    );
                    return Ok(RecordOutcome::TooEarly { remaining });
                }
                current.exit = Some(now);
                RecordOutcome::ExitMarked
            }
        };

        self.write_entries(&entries)?;

        let at = now.format(TIMESTAMP_FORMAT).to_string();
        match outcome {
            RecordOutcome::EntryMarked => tracing::info!(identity, at, "entry marked"),
            RecordOutcome::ExitMarked => tracing::info!(identity, at, "exit marked"),
            _ => {}
        }
        Ok(outcome)
    }

    /// Current shift state of `identity`, trimmed and validated as in [`Ledger::record`].
    pub fn state_of(&self, identity: &str) -> Result<ShiftState, LedgerError> {
        let identity = validate_identity(identity)?;
        let entries = self.list_all()?;
        Ok(entries
            .iter()
            .rev()
            .find(|e| e.identity == identity)
            .map_or(ShiftState::NoRecord, LedgerEntry::state))
    }

    /// All entries in file order.
    pub fn list_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_entries()
    }

    /// Write the ledger in canonical form to `destination`. Returns the entry count.
    pub fn export(&self, destination: &Path) -> Result<usize, LedgerError> {
        let entries = self.list_all()?;
        fs::write(destination, render(&entries)).map_err(|source| LedgerError::Storage {
            path: destination.to_path_buf(),
            source,
        })?;
        tracing::info!(destination = %destination.display(), entries = entries.len(), "ledger exported");
        Ok(entries.len())
    }

    // ── Storage helpers ───────────────────────────────────────────────────────

    /// Read and parse the store, creating it once if it does not exist.
    fn read_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "ledger missing; creating empty store");
                self.create_empty()?;
                fs::read_to_string(&self.path).map_err(|source| self.storage_error(source))?
            }
            Err(source) => return Err(self.storage_error(source)),
        };
        parse(&contents)
    }

    fn create_empty(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.storage_error(source))?;
        }
        fs::write(&self.path, render(&[])).map_err(|source| self.storage_error(source))
    }

    /// Replace the whole file, header included.
    fn write_entries(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, render(entries)).map_err(|source| self.storage_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.storage_error(source))
    }

    fn storage_error(&self, source: io::Error) -> LedgerError {
        LedgerError::Storage {
            path: self.path.clone(),
            source,
        }
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn render(entries: &[LedgerEntry]) -> String {
    let mut out = String::with_capacity(LEDGER_HEADER.len() + 1 + entries.len() * 48);
    out.push_str(LEDGER_HEADER);
    out.push('\n');
    for entry in entries {
        out.push_str(&entry.to_line());
        out.push('\n');
    }
    out
}

/// Parse ledger contents. Accepts a missing header, blank lines and legacy
/// two-field `Name,Timestamp` lines.
fn parse(contents: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
    let mut entries = Vec::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line == LEDGER_HEADER {
            continue;
        }

        let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        let (name, entry, exit) = match fields.as_slice() {
            [name, entry] => (*name, *entry, ""),
            [name, entry, exit] => (*name, *entry, *exit),
            _ => {
                return Err(LedgerError::Malformed {
                    line: line_no,
                    reason: format!("expected 2 or 3 fields, got {}", fields.len()),
                })
            }
        };

        let identity = name.trim();
        if identity.is_empty() {
            return Err(LedgerError::Malformed {
                line: line_no,
                reason: "empty name".into(),
            });
        }

        let exit = exit.trim();
        entries.push(LedgerEntry {
            identity: identity.to_string(),
            entry: parse_timestamp(entry, line_no)?,
            exit: if exit.is_empty() {
                None
            } else {
                Some(parse_timestamp(exit, line_no)?)
            },
        });
    }

    Ok(entries)
}

fn parse_timestamp(field: &str, line: usize) -> Result<NaiveDateTime, LedgerError> {
    NaiveDateTime::parse_from_str(field.trim(), TIMESTAMP_FORMAT).map_err(|e| LedgerError::Malformed {
        line,
        reason: format!("bad timestamp {:?}: {e}", field.trim()),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn ledger_in(dir: &tempfile::TempDir) -> Ledger {
        Ledger::new(dir.path().join("attendance.csv"), Duration::seconds(DEFAULT_MIN_SHIFT_SECS))
    }

    #[test]
    fn test_first_record_creates_store_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        assert!(!ledger.path().exists());

        let outcome = ledger.record("Bob", at(9, 0, 0)).unwrap();
        assert_eq!(outcome, RecordOutcome::EntryMarked);

        let contents = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(contents, "Name,Timestamp,ExitTime\nBob,2026-10-17 09:00:00,\n");
        assert_eq!(ledger.state_of("Bob").unwrap(), ShiftState::CheckedIn);
    }

    #[test]
    fn test_same_instant_twice_yields_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        assert_eq!(ledger.record("Alice", at(9, 0, 0)).unwrap(), RecordOutcome::EntryMarked);
        assert!(matches!(
            ledger.record("Alice", at(9, 0, 0)).unwrap(),
            RecordOutcome::TooEarly { .. }
        ));

        let entries = ledger.list_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state(), ShiftState::CheckedIn);
    }

    #[test]
    fn test_checkout_before_shift_elapsed_is_too_early() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.record("Alice", at(9, 0, 0)).unwrap();
        let outcome = ledger.record("Alice", at(16, 59, 59)).unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::TooEarly {
                remaining: Duration::seconds(1)
            }
        );
        assert_eq!(ledger.list_all().unwrap()[0].exit, None);
    }

    #[test]
    fn test_checkout_at_exact_shift_length() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.record("Alice", at(9, 0, 0)).unwrap();
        assert_eq!(ledger.record("Alice", at(17, 0, 0)).unwrap(), RecordOutcome::ExitMarked);

        let entries = ledger.list_all().unwrap();
        assert_eq!(entries[0].exit, Some(at(17, 0, 0)));
        assert_eq!(ledger.state_of("Alice").unwrap(), ShiftState::CheckedOut);
    }

    #[test]
    fn test_checked_out_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.record("Alice", at(8, 0, 0)).unwrap();
        ledger.record("Alice", at(17, 0, 0)).unwrap();
        let before = fs::read_to_string(ledger.path()).unwrap();

        assert_eq!(ledger.record("Alice", at(23, 0, 0)).unwrap(), RecordOutcome::AlreadyCheckedOut);
        assert_eq!(fs::read_to_string(ledger.path()).unwrap(), before);
    }

    #[test]
    fn test_list_all_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("a.csv"), Duration::minutes(30));

        ledger.record("Carol", at(8, 0, 0)).unwrap();
        ledger.record("Alice", at(8, 5, 0)).unwrap();
        ledger.record("Bob", at(8, 10, 0)).unwrap();
        ledger.record("Alice", at(9, 0, 0)).unwrap();

        let entries = ledger.list_all().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(names, ["Carol", "Alice", "Bob"]);
        assert_eq!(entries[0].entry, at(8, 0, 0));
        assert_eq!(entries[0].exit, None);
        assert_eq!(entries[1].entry, at(8, 5, 0));
        assert_eq!(entries[1].exit, Some(at(9, 0, 0)));
        assert_eq!(entries[2].entry, at(8, 10, 0));
    }

    #[test]
    fn test_subsecond_timestamps_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        let now = at(9, 0, 0) + Duration::milliseconds(750);

        ledger.record("Dana", now).unwrap();
        assert_eq!(ledger.list_all().unwrap()[0].entry, at(9, 0, 0));
    }

    #[test]
    fn test_legacy_file_is_read_and_rewritten_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        fs::write(
            ledger.path(),
            "\nAlice,2026-10-17 07:00:00\nBob,2026-10-17 07:30:00\r\nAlice,2026-10-17 08:00:00",
        )
        .unwrap();

        let entries = ledger.list_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.exit.is_none()));

        // The last Alice line is the current shift
        ledger.record("Alice", at(16, 0, 0)).unwrap();
        let contents = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(
            contents,
            "Name,Timestamp,ExitTime\n\
             Alice,2026-10-17 07:00:00,\n\
             Bob,2026-10-17 07:30:00,\n\
             Alice,2026-10-17 08:00:00,2026-10-17 16:00:00\n"
        );
    }

    #[test]
    fn test_malformed_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        fs::write(ledger.path(), "Name,Timestamp,ExitTime\nAlice,yesterday,\n").unwrap();

        let err = ledger.record("Bob", at(9, 0, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::Malformed { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_unreadable_store_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be cannot be read
        let ledger = Ledger::new(dir.path().to_path_buf(), Duration::hours(8));
        let err = ledger.record("Bob", at(9, 0, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::Storage { .. }), "{err}");
    }

    #[test]
    fn test_store_below_a_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();

        let ledger = Ledger::new(blocker.join("attendance.csv"), Duration::hours(8));
        let err = ledger.list_all().unwrap_err();
        assert!(matches!(err, LedgerError::Storage { .. }), "{err}");
    }

    #[test]
    fn test_invalid_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        assert!(matches!(
            ledger.record("Doe, Jane", at(9, 0, 0)),
            Err(LedgerError::Identity(IdentityError::ContainsDelimiter(_)))
        ));
        assert!(matches!(
            ledger.record("  ", at(9, 0, 0)),
            Err(LedgerError::Identity(IdentityError::Empty))
        ));
    }

    #[test]
    fn test_state_of_trims_like_record() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        ledger.record(" Alice", at(9, 0, 0)).unwrap();

        assert_eq!(ledger.state_of(" Alice").unwrap(), ShiftState::CheckedIn);
        assert_eq!(ledger.state_of("Alice \t").unwrap(), ShiftState::CheckedIn);
        assert!(matches!(
            ledger.state_of("Doe, Jane"),
            Err(LedgerError::Identity(IdentityError::ContainsDelimiter(_)))
        ));
    }

    #[test]
    fn test_export_writes_canonical_copy() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        ledger.record("Alice", at(9, 0, 0)).unwrap();
        ledger.record("Bob", at(9, 1, 0)).unwrap();

        let dest = dir.path().join("export.csv");
        assert_eq!(ledger.export(&dest).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            fs::read_to_string(ledger.path()).unwrap()
        );
    }

    #[test]
    fn test_export_of_missing_ledger_is_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        let dest = dir.path().join("empty.csv");
        assert_eq!(ledger.export(&dest).unwrap(), 0);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "Name,Timestamp,ExitTime\n");
    }
}
