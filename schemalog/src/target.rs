//! The connection interface the [Migrator](crate::Migrator) drives.
//!
//! A [Target] is a live database session. The migrator only ever begins, commits and rolls back
//! transactions, executes statements produced by the [Interpreter](crate::Interpreter), and
//! reads or writes the ledger through it. Implementations exist for `rusqlite::Connection`,
//! `postgres::Client` and `mysql::Conn` behind their respective features.

use crate::core::{AppliedMigration, MigrationId};
use crate::error::Error;
use crate::provider::Provider;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of trying to take the run lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Another run holds the lock. `holder` identifies it when the engine can tell.
    Held { holder: Option<String> },
}

pub trait Target {
    fn provider(&self) -> Provider;

    /// Apply session settings before a run, such as how long to wait for locks held by others.
    fn prepare_session(&mut self, lock_wait: Duration) -> Result<(), Error>;

    fn begin(&mut self) -> Result<(), Error>;

    fn commit(&mut self) -> Result<(), Error>;

    fn rollback(&mut self) -> Result<(), Error>;

    /// Execute one statement (or a batch the engine accepts as one unit), discarding any rows.
    fn execute(&mut self, sql: &str) -> Result<(), Error>;

    fn ledger_exists(&mut self, ledger: &str) -> Result<bool, Error>;

    /// Create the ledger table if it does not exist yet.
    fn create_ledger(&mut self, ledger: &str) -> Result<(), Error>;

    /// Every ledger row, ordered by migration id.
    fn applied_migrations(&mut self, ledger: &str) -> Result<Vec<AppliedMigration>, Error>;

    fn insert_applied(&mut self, ledger: &str, applied: &AppliedMigration) -> Result<(), Error>;

    fn delete_applied(&mut self, ledger: &str, id: &MigrationId) -> Result<(), Error>;

    /// Try to take the exclusive run lock for `ledger` without waiting.
    fn try_lock(&mut self, ledger: &str, owner: &str) -> Result<LockOutcome, Error>;

    fn unlock(&mut self, ledger: &str, owner: &str) -> Result<(), Error>;

    /// Clear a lock left behind by a run that died. Returns whether a lock was cleared.
    /// Session scoped locks disappear with their session, so engines using them return `false`.
    fn force_unlock(&mut self, ledger: &str) -> Result<bool, Error>;
}

pub(crate) fn parse_applied_at(value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::Generic(format!("invalid applied_at '{}' in ledger: {}", value, e)))
}

/// Name of the engine-level lock guarding a ledger. Kept short enough for MySQL's 64 character limit.
pub(crate) fn lock_name(ledger: &str) -> String {
    format!("schemalog:{}", ledger).chars().take(64).collect()
}

/// Stable 64-bit key for PostgreSQL advisory locks.
#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
pub(crate) fn lock_key(ledger: &str) -> i64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(lock_name(ledger).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

impl std::fmt::Display for LockOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOutcome::Acquired => f.write_str("acquired"),
            LockOutcome::Held { holder: Some(holder) } => write!(f, "held by {}", holder),
            LockOutcome::Held { holder: None } => f.write_str("held"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        assert_eq!(lock_key("_schemalog_history_"), lock_key("_schemalog_history_"));
        assert_ne!(lock_key("_schemalog_history_"), lock_key("other_history"));
    }

    #[test]
    fn lock_names_fit_mysql_limit() {
        assert!(lock_name(&"x".repeat(100)).len() <= 64);
    }

    #[test]
    fn parses_rfc3339_timestamps() {
        let at = parse_applied_at("2024-01-02T03:04:05+00:00").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert!(parse_applied_at("yesterday").is_err());
    }

    #[test]
    fn describes_lock_outcomes() {
        assert_eq!(
            LockOutcome::Held {
                holder: Some("abc".to_string())
            }
            .to_string(),
            "held by abc"
        );
    }
}
