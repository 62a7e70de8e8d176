//! [Target] implementation for `mysql::Conn`.
//!
//! MySQL commits implicitly around every DDL statement, so the interpreter marks DDL as running
//! outside the record's transaction. A record mixing DDL with a later failing statement surfaces
//! as [Error::PartialApplication] and needs manual repair.
//!
//! The run lock is a named `GET_LOCK` lock held by the session.

use crate::core::{AppliedMigration, MigrationId};
use crate::error::Error;
use crate::interpreter::Interpreter;
use crate::provider::Provider;
use crate::target::{lock_name, parse_applied_at, LockOutcome, Target};
use mysql::prelude::*;
use mysql::Conn;
use std::time::Duration;

fn quote(identifier: &str) -> String {
    Interpreter::new(Provider::MySql).quote(identifier)
}

impl Target for Conn {
    fn provider(&self) -> Provider {
        Provider::MySql
    }

    fn prepare_session(&mut self, lock_wait: Duration) -> Result<(), Error> {
        // Both settings are whole seconds with a minimum of one
        let seconds = lock_wait.as_secs().max(1);
        self.query_drop(format!(
            "SET SESSION lock_wait_timeout = {0}, SESSION innodb_lock_wait_timeout = {0}",
            seconds
        ))?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.query_drop("START TRANSACTION")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.query_drop("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.query_drop("ROLLBACK")?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.query_drop(sql)?;
        Ok(())
    }

    fn ledger_exists(&mut self, ledger: &str) -> Result<bool, Error> {
        let count: Option<i64> = self.exec_first(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
            (ledger,),
        )?;
        Ok(count.unwrap_or(0) > 0)
    }

    fn create_ledger(&mut self, ledger: &str) -> Result<(), Error> {
        self.query_drop(Interpreter::new(Provider::MySql).ledger_create_sql(ledger))?;
        Ok(())
    }

    fn applied_migrations(&mut self, ledger: &str) -> Result<Vec<AppliedMigration>, Error> {
        let rows: Vec<(String, String, String, String)> = self.query(format!(
            "SELECT migration_id, applied_at, checksum, product_version FROM {} ORDER BY migration_id",
            quote(ledger)
        ))?;
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
        self.exec_drop(
            format!(
                "INSERT INTO {} (migration_id, applied_at, checksum, product_version) VALUES (?, ?, ?, ?)",
                quote(ledger)
            ),
            (
                applied.id.as_str(),
                applied.applied_at.to_rfc3339(),
                applied.checksum.as_str(),
                applied.product_version.as_str(),
            ),
        )?;
        Ok(())
    }

    fn delete_applied(&mut self, ledger: &str, id: &MigrationId) -> Result<(), Error> {
        self.exec_drop(
            format!("DELETE FROM {} WHERE migration_id = ?", quote(ledger)),
            (id.as_str(),),
        )?;
        Ok(())
    }

    fn try_lock(&mut self, ledger: &str, _owner: &str) -> Result<LockOutcome, Error> {
        let name = lock_name(ledger);
        let acquired: Option<Option<i64>> = self.exec_first("SELECT GET_LOCK(?, 0)", (name.as_str(),))?;
        if acquired.flatten() == Some(1) {
            return Ok(LockOutcome::Acquired);
        }
        let holder: Option<Option<u64>> = self.exec_first("SELECT IS_USED_LOCK(?)", (name.as_str(),))?;
        Ok(LockOutcome::Held {
            holder: holder
                .flatten()
                .map(|connection| format!("connection {}", connection)),
        })
    }

    fn unlock(&mut self, ledger: &str, _owner: &str) -> Result<(), Error> {
        let _: Option<Option<i64>> = self.exec_first("SELECT RELEASE_LOCK(?)", (lock_name(ledger),))?;
        Ok(())
    }

    fn force_unlock(&mut self, _ledger: &str) -> Result<bool, Error> {
        Ok(false)
    }
}
