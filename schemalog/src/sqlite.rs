//! [Target] implementation for `rusqlite::Connection`.
//!
//! SQLite has no engine-level named locks, so the run lock is a single-row table next to the
//! ledger (`<ledger>_lock`). A run that crashes leaves its row behind; clear it with
//! [Migrator::force_unlock](crate::Migrator::force_unlock).
//!
//! ```
//! use rusqlite::Connection;
//! use schemalog::{ColumnDef, ColumnType, MigrationRecord, Migrator, SchemaOperation};
//!
//! let migrator = Migrator::new(vec![MigrationRecord::new("20240101000000_CreateUsers")
//!     .up(vec![SchemaOperation::create_table(
//!         "users",
//!         vec![
//!             ColumnDef::new("id", ColumnType::Int).not_null(),
//!             ColumnDef::new("name", ColumnType::String).not_null(),
//!         ],
//!         None,
//!     )])
//!     .down(vec![SchemaOperation::drop_table("users")])]);
//!
//! let mut conn = Connection::open_in_memory().unwrap();
//! migrator.apply(&mut conn).unwrap();
//!
//! let mut stmt = conn.prepare("PRAGMA table_info(users)").unwrap();
//! let columns: Vec<String> = stmt
//!     .query_map([], |row| row.get(1))
//!     .unwrap()
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(columns, vec!["id", "name"]);
//! ```

use crate::core::{AppliedMigration, MigrationId};
use crate::error::Error;
use crate::interpreter::Interpreter;
use crate::provider::Provider;
use crate::target::{parse_applied_at, LockOutcome, Target};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

fn quote(identifier: &str) -> String {
    Interpreter::new(Provider::Sqlite).quote(identifier)
}

fn lock_table(ledger: &str) -> String {
    quote(&format!("{}_lock", ledger))
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, Error> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
    let exists = stmt.query([name])?.next()?.is_some();
    Ok(exists)
}

impl Target for Connection {
    fn provider(&self) -> Provider {
        Provider::Sqlite
    }

    fn prepare_session(&mut self, lock_wait: Duration) -> Result<(), Error> {
        // Wait on a locked database file instead of failing with SQLITE_BUSY
        self.busy_timeout(lock_wait)?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        // Take the write lock up front so two writers can't deadlock upgrading from a read lock
        self.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if !self.is_autocommit() {
            self.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.execute_batch(sql)?;
        Ok(())
    }

    fn ledger_exists(&mut self, ledger: &str) -> Result<bool, Error> {
        table_exists(self, ledger)
    }

    fn create_ledger(&mut self, ledger: &str) -> Result<(), Error> {
        self.execute_batch(&Interpreter::new(Provider::Sqlite).ledger_create_sql(ledger))?;
        Ok(())
    }

    fn applied_migrations(&mut self, ledger: &str) -> Result<Vec<AppliedMigration>, Error> {
        let mut stmt = self.prepare(&format!(
            "SELECT migration_id, applied_at, checksum, product_version FROM {} ORDER BY migration_id",
            quote(ledger)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, applied_at, checksum, product_version)| {
                Ok(AppliedMigration {
                    id: MigrationId::new(id),
                    applied_at: parse_applied_at(&applied_at)?,
                    checksum,
                    product_version,
                })
            })
            .collect()
    }

    fn insert_applied(&mut self, ledger: &str, applied: &AppliedMigration) -> Result<(), Error> {
        Connection::execute(
            self,
            &format!(
                "INSERT INTO {} (migration_id, applied_at, checksum, product_version) VALUES (?1, ?2, ?3, ?4)",
                quote(ledger)
            ),
            params![
                applied.id.as_str(),
                applied.applied_at.to_rfc3339(),
                applied.checksum,
                applied.product_version
            ],
        )?;
        Ok(())
    }

    fn delete_applied(&mut self, ledger: &str, id: &MigrationId) -> Result<(), Error> {
        Connection::execute(
            self,
            &format!("DELETE FROM {} WHERE migration_id = ?1", quote(ledger)),
            [id.as_str()],
        )?;
        Ok(())
    }

    fn try_lock(&mut self, ledger: &str, owner: &str) -> Result<LockOutcome, Error> {
        let table = lock_table(ledger);
        self.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY CHECK (id = 1), owner TEXT NOT NULL, acquired_at TEXT NOT NULL)",
            table
        ))?;
        let inserted = Connection::execute(
            self,
            &format!(
                "INSERT OR IGNORE INTO {} (id, owner, acquired_at) VALUES (1, ?1, ?2)",
                table
            ),
            params![owner, Utc::now().to_rfc3339()],
        )?;
        if inserted == 1 {
            return Ok(LockOutcome::Acquired);
        }
        let holder: Option<String> = self
            .query_row(
                &format!("SELECT owner FROM {} WHERE id = 1", table),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(LockOutcome::Held { holder })
    }

    fn unlock(&mut self, ledger: &str, owner: &str) -> Result<(), Error> {
        Connection::execute(
            self,
            &format!("DELETE FROM {} WHERE owner = ?1", lock_table(ledger)),
            [owner],
        )?;
        Ok(())
    }

    fn force_unlock(&mut self, ledger: &str) -> Result<bool, Error> {
        if !table_exists(self, &format!("{}_lock", ledger))? {
            return Ok(false);
        }
        let cleared = Connection::execute(self, &format!("DELETE FROM {}", lock_table(ledger)), [])?;
        Ok(cleared > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DEFAULT_LEDGER_TABLE_NAME;

    #[test]
    fn ledger_round_trip() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert!(!conn.ledger_exists(DEFAULT_LEDGER_TABLE_NAME).unwrap());
        conn.create_ledger(DEFAULT_LEDGER_TABLE_NAME).unwrap();
        // Creating twice is harmless.
        conn.create_ledger(DEFAULT_LEDGER_TABLE_NAME).unwrap();
        assert!(conn.ledger_exists(DEFAULT_LEDGER_TABLE_NAME).unwrap());

        let applied_at = parse_applied_at("2024-01-02T03:04:05+00:00").unwrap();
        for id in ["20240102000000_B", "20240101000000_A"] {
            conn.insert_applied(
                DEFAULT_LEDGER_TABLE_NAME,
                &AppliedMigration {
                    id: MigrationId::new(id),
                    applied_at,
                    checksum: format!("checksum-{}", id),
                    product_version: "0.3.0".to_string(),
                },
            )
            .unwrap();
        }

        let rows = conn.applied_migrations(DEFAULT_LEDGER_TABLE_NAME).unwrap();
        assert_eq!(
            rows.iter().map(|row| row.id.as_str()).collect::<Vec<_>>(),
            vec!["20240101000000_A", "20240102000000_B"]
        );
        assert_eq!(rows[0].applied_at, applied_at);
        assert_eq!(rows[0].checksum, "checksum-20240101000000_A");

        conn.delete_applied(DEFAULT_LEDGER_TABLE_NAME, &MigrationId::new("20240101000000_A"))
            .unwrap();
        assert_eq!(conn.applied_migrations(DEFAULT_LEDGER_TABLE_NAME).unwrap().len(), 1);
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(conn.try_lock("ledger", "first").unwrap(), LockOutcome::Acquired);
        assert_eq!(
            conn.try_lock("ledger", "second").unwrap(),
            LockOutcome::Held {
                holder: Some("first".to_string())
            }
        );
        // Only the owner releases the lock.
        conn.unlock("ledger", "second").unwrap();
        assert!(matches!(
            conn.try_lock("ledger", "second").unwrap(),
            LockOutcome::Held { .. }
        ));
        conn.unlock("ledger", "first").unwrap();
        assert_eq!(conn.try_lock("ledger", "second").unwrap(), LockOutcome::Acquired);
    }

    #[test]
    fn locks_are_per_ledger() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(conn.try_lock("one", "a").unwrap(), LockOutcome::Acquired);
        assert_eq!(conn.try_lock("two", "b").unwrap(), LockOutcome::Acquired);
    }

    #[test]
    fn force_unlock_without_lock_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert!(!conn.force_unlock("ledger").unwrap());
        conn.try_lock("ledger", "crashed").unwrap();
        assert!(conn.force_unlock("ledger").unwrap());
        assert_eq!(conn.try_lock("ledger", "next").unwrap(), LockOutcome::Acquired);
    }

    #[test]
    fn rolled_back_statements_leave_no_trace() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.begin().unwrap();
        Target::execute(&mut conn, "CREATE TABLE t (id INTEGER)").unwrap();
        conn.rollback().unwrap();
        assert!(!table_exists(&conn, "t").unwrap());
        // Nothing open, nothing to roll back.
        conn.rollback().unwrap();
    }
}
