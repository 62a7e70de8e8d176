//! [Target] implementation for `postgres::Client`.
//!
//! The run lock is a session-level advisory lock keyed by the ledger name, so it disappears with
//! the session that took it and [Target::force_unlock] has nothing to clear.
//! [Migrator::with_lock_wait_timeout](crate::Migrator::with_lock_wait_timeout) maps to `lock_timeout`.

use crate::core::{AppliedMigration, MigrationId};
use crate::error::Error;
use crate::interpreter::Interpreter;
use crate::provider::Provider;
use crate::target::{lock_key, parse_applied_at, LockOutcome, Target};
use postgres::Client;
use std::time::Duration;

fn quote(identifier: &str) -> String {
    Interpreter::new(Provider::Postgres).quote(identifier)
}

impl Target for Client {
    fn provider(&self) -> Provider {
        Provider::Postgres
    }

    fn prepare_session(&mut self, lock_wait: Duration) -> Result<(), Error> {
        self.batch_execute(&format!("SET lock_timeout = '{}ms'", lock_wait.as_millis()))?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.batch_execute("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        // Outside a transaction this only raises a warning
        self.batch_execute("ROLLBACK")?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.batch_execute(sql)?;
        Ok(())
    }

    fn ledger_exists(&mut self, ledger: &str) -> Result<bool, Error> {
        let row = self.query_one(
            "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1)",
            &[&ledger],
        )?;
        Ok(row.get(0))
    }

    fn create_ledger(&mut self, ledger: &str) -> Result<(), Error> {
        self.batch_execute(&Interpreter::new(Provider::Postgres).ledger_create_sql(ledger))?;
        Ok(())
    }

    fn applied_migrations(&mut self, ledger: &str) -> Result<Vec<AppliedMigration>, Error> {
        let rows = self.query(
            &format!(
                "SELECT migration_id, applied_at, checksum, product_version FROM {} ORDER BY migration_id",
                quote(ledger)
            ),
            &[],
        )?;
        rows.iter()
            .map(|row| {
                let applied_at: String = row.get(1);
                Ok(AppliedMigration {
                    id: MigrationId::new(row.get::<_, String>(0)),
                    applied_at: parse_applied_at(&applied_at)?,
                    checksum: row.get(2),
                    product_version: row.get(3),
                })
            })
            .collect()
    }

    fn insert_applied(&mut self, ledger: &str, applied: &AppliedMigration) -> Result<(), Error> {
        Client::execute(
            self,
            &format!(
                "INSERT INTO {} (migration_id, applied_at, checksum, product_version) VALUES ($1, $2, $3, $4)",
                quote(ledger)
            ),
            &[
                &applied.id.as_str(),
                &applied.applied_at.to_rfc3339(),
                &applied.checksum,
                &applied.product_version,
            ],
        )?;
        Ok(())
    }

    fn delete_applied(&mut self, ledger: &str, id: &MigrationId) -> Result<(), Error> {
        Client::execute(
            self,
            &format!("DELETE FROM {} WHERE migration_id = $1", quote(ledger)),
            &[&id.as_str()],
        )?;
        Ok(())
    }

    fn try_lock(&mut self, ledger: &str, _owner: &str) -> Result<LockOutcome, Error> {
        let key = lock_key(ledger);
        let acquired: bool = self
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])?
            .get(0);
        if acquired {
            return Ok(LockOutcome::Acquired);
        }
        // A bigint advisory key is split across classid and objid
        let holder = self
            .query_opt(
                "SELECT pid FROM pg_locks WHERE locktype = 'advisory' AND granted AND objsubid = 1 \
                 AND ((classid::bigint << 32) | objid::bigint) = $1 LIMIT 1",
                &[&key],
            )?
            .map(|row| format!("backend pid {}", row.get::<_, i32>(0)));
        Ok(LockOutcome::Held { holder })
    }

    fn unlock(&mut self, ledger: &str, _owner: &str) -> Result<(), Error> {
        self.query_one("SELECT pg_advisory_unlock($1)", &[&lock_key(ledger)])?;
        Ok(())
    }

    fn force_unlock(&mut self, _ledger: &str) -> Result<bool, Error> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::DEFAULT_LEDGER_TABLE_NAME;
    use crate::operation::{ColumnDef, ColumnType, IdentityStrategy, PrimaryKeyDef, SchemaOperation};
    use crate::test_postgres::{connect_to, fresh_postgres_db, get_test_client};
    use crate::{Error, LockOutcome, MigrationId, MigrationRecord, Migrator, Target};
    use postgres::Client;

    fn table_exists(client: &mut Client, name: &str) -> bool {
        client
            .query_one(
                "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1)",
                &[&name],
            )
            .unwrap()
            .get(0)
    }

    fn foo_records() -> Vec<MigrationRecord> {
        vec![
            MigrationRecord::new("20240101000000_CreateFoo")
                .up(vec![SchemaOperation::create_table(
                    "Foo",
                    vec![ColumnDef::new("Id", ColumnType::Int).not_null()],
                    Some(PrimaryKeyDef {
                        name: "PK_Foo".to_string(),
                        columns: vec!["Id".to_string()],
                    }),
                )])
                .down(vec![SchemaOperation::drop_table("Foo")]),
            MigrationRecord::new("20240102000000_AddBar")
                .up(vec![SchemaOperation::add_column(
                    "Foo",
                    ColumnDef::new("Bar", ColumnType::String).max_length(200),
                )])
                .down(vec![SchemaOperation::drop_column("Foo", "Bar")]),
        ]
    }

    #[test]
    fn apply_and_roll_back() {
        let mut client = get_test_client();
        let migrator = Migrator::new(foo_records());

        let report = migrator.apply(&mut client).unwrap();
        assert!(report.ledger_created);
        assert_eq!(report.migrations_run.len(), 2);

        let data_type: String = client
            .query_one(
                "SELECT data_type FROM information_schema.columns WHERE table_name = 'Foo' AND column_name = 'Bar'",
                &[],
            )
            .unwrap()
            .get(0);
        assert_eq!(data_type, "character varying");

        migrator.rollback_to(&mut client, None).unwrap();
        assert!(!table_exists(&mut client, "Foo"));
        assert!(table_exists(&mut client, DEFAULT_LEDGER_TABLE_NAME));
        assert_eq!(migrator.current(&mut client).unwrap(), None);
    }

    #[test]
    fn failed_record_is_rolled_back_with_its_ddl() {
        let mut client = get_test_client();
        let migrator = Migrator::new(vec![MigrationRecord::new("20240101000000_Broken").up(vec![
            SchemaOperation::create_table(
                "test",
                vec![ColumnDef::new("id", ColumnType::Int).not_null()],
                None,
            ),
            SchemaOperation::sql("THIS IS NOT VALID SQL"),
        ])]);

        let report = migrator.apply(&mut client).unwrap();
        let failure = report.failing_migration.unwrap();
        assert_eq!(failure.operation_index(), Some(1));
        assert!(!table_exists(&mut client, "test"));
        assert!(migrator.history(&mut client).unwrap().is_empty());
    }

    #[test]
    fn converting_a_key_to_identity_keeps_existing_rows() {
        let mut client = get_test_client();
        let key = ColumnDef::new("Id", ColumnType::Int).not_null();
        let migrator = Migrator::new(vec![
            foo_records().remove(0),
            MigrationRecord::new("20240102000000_SeedFoo")
                .up(vec![SchemaOperation::sql(
                    "INSERT INTO \"Foo\" (\"Id\") VALUES (1), (2)",
                )])
                .down(vec![SchemaOperation::sql("DELETE FROM \"Foo\"")]),
            MigrationRecord::new("20240103000000_MakeIdsSerial")
                .up(vec![SchemaOperation::alter_column(
                    "Foo",
                    key.clone(),
                    key.clone().identity(IdentityStrategy::Serial),
                )])
                .down(vec![SchemaOperation::alter_column(
                    "Foo",
                    key.clone().identity(IdentityStrategy::Serial),
                    key.clone(),
                )]),
        ]);
        migrator.apply(&mut client).unwrap().into_result().unwrap();

        client
            .batch_execute("INSERT INTO \"Foo\" DEFAULT VALUES")
            .unwrap();
        let max: i32 = client
            .query_one("SELECT MAX(\"Id\") FROM \"Foo\"", &[])
            .unwrap()
            .get(0);
        assert_eq!(max, 3);

        let seed = MigrationId::new("20240102000000_SeedFoo");
        migrator
            .rollback_to(&mut client, Some(&seed))
            .unwrap()
            .into_result()
            .unwrap();
        assert!(client
            .batch_execute("INSERT INTO \"Foo\" DEFAULT VALUES")
            .is_err());
    }

    #[test]
    fn advisory_lock_blocks_a_second_session() {
        let (mut first, db_name) = fresh_postgres_db();
        let mut second = connect_to(&db_name);

        assert_eq!(
            first.try_lock(DEFAULT_LEDGER_TABLE_NAME, "first").unwrap(),
            LockOutcome::Acquired
        );
        match Migrator::new(foo_records()).apply(&mut second) {
            Err(Error::LockContention { holder, .. }) => assert!(holder.is_some()),
            other => panic!("expected lock contention, got {:?}", other),
        }

        first.unlock(DEFAULT_LEDGER_TABLE_NAME, "first").unwrap();
        let migrator = Migrator::new(foo_records());
        let report = migrator.apply(&mut second).unwrap();
        assert_eq!(report.migrations_run.len(), 2);
    }

    #[test]
    fn dropping_the_session_releases_the_lock() {
        let (mut first, db_name) = fresh_postgres_db();
        first.try_lock(DEFAULT_LEDGER_TABLE_NAME, "first").unwrap();
        drop(first);

        let mut second = connect_to(&db_name);
        assert!(!second.force_unlock(DEFAULT_LEDGER_TABLE_NAME).unwrap());
        assert_eq!(
            second.try_lock(DEFAULT_LEDGER_TABLE_NAME, "second").unwrap(),
            LockOutcome::Acquired
        );
    }
}
