//! Testing utilities for developing and verifying records against SQLite.
//!
//! This module provides a harness with state control, assertion helpers and schema snapshots,
//! including a whole-ledger reversibility check.

use crate::{Error, MigrationId, Migrator};
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A test harness for SQLite that provides state control and assertion helpers.
///
/// # Example
///
/// ```
/// use schemalog::testing::sqlite::SqliteTestHarness;
/// use schemalog::{sql_migration, Error, Migrator};
///
/// # fn test() -> Result<(), Error> {
/// let mut harness = SqliteTestHarness::new(Migrator::new(vec![sql_migration!(
///     "20240101000000_CreateUsers",
///     up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
///     down: "DROP TABLE users"
/// )]));
///
/// harness.migrate_to("20240101000000_CreateUsers")?;
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
/// harness.assert_table_exists("users")?;
///
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, "alice");
/// # Ok(())
/// # }
/// # test().unwrap();
/// ```
pub struct SqliteTestHarness {
    conn: Connection,
    migrator: Migrator,
}

/// A captured database schema for comparison and snapshotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub column: String,
    pub principal_table: String,
    pub principal_column: Option<String>,
    pub on_delete: String,
}

fn assertion(message: String) -> Error {
    Error::Generic(message)
}

impl SqliteTestHarness {
    /// Create a harness around the migrator used in production, on an in-memory database.
    /// As the ledger grows, assertions about earlier records SHOULD NOT CHANGE.
    pub fn new(migrator: Migrator) -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory test database");
        Self { conn, migrator }
    }

    /// Create a harness with a custom connection, e.g. a file database.
    pub fn with_connection(conn: Connection, migrator: Migrator) -> Self {
        Self { conn, migrator }
    }

    /// Apply or roll back until `id` is the current record.
    pub fn migrate_to(&mut self, id: &str) -> Result<(), Error> {
        let target = MigrationId::new(id);
        if self.migrator.find(&target).is_none() {
            return Err(Error::UnknownMigration(target));
        }
        match self.current()? {
            Some(current) if current > target => {
                self.migrator
                    .rollback_to(&mut self.conn, Some(&target))?
                    .into_result()?;
            }
            Some(current) if current == target => {}
            _ => {
                self.migrator
                    .apply_to(&mut self.conn, &target)?
                    .into_result()?;
            }
        }
        Ok(())
    }

    /// Roll back every applied record.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.migrator
            .rollback_to(&mut self.conn, None)?
            .into_result()?;
        Ok(())
    }

    /// Apply exactly the next pending record.
    pub fn migrate_up_one(&mut self) -> Result<(), Error> {
        let next = self
            .migrator
            .pending(&mut self.conn)?
            .first()
            .map(|record| record.id().clone())
            .ok_or_else(|| assertion("No pending migrations, cannot migrate up".to_string()))?;
        self.migrator
            .apply_to(&mut self.conn, &next)?
            .into_result()?;
        Ok(())
    }

    /// Roll back exactly the current record.
    pub fn migrate_down_one(&mut self) -> Result<(), Error> {
        let history = self.migrator.history(&mut self.conn)?;
        if history.is_empty() {
            return Err(assertion(
                "No applied migrations, cannot migrate down".to_string(),
            ));
        }
        let previous = history.len().checked_sub(2).map(|i| history[i].id.clone());
        self.migrator
            .rollback_to(&mut self.conn, previous.as_ref())?
            .into_result()?;
        Ok(())
    }

    pub fn current(&mut self) -> Result<Option<MigrationId>, Error> {
        self.migrator.current(&mut self.conn)
    }

    /// Execute a SQL statement (for setting up test data).
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute(sql, [])?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&mut self, sql: &str) -> Result<T, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let result = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(result)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&mut self, sql: &str) -> Result<Vec<T>, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    pub fn query_map<T, F>(&mut self, sql: &str, f: F) -> Result<Vec<T>, Error>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    fn count_objects(&mut self, kind: &str, name: &str) -> Result<i64, Error> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type=?1 AND name=?2",
            [kind, name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn assert_table_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.count_objects("table", table_name)? == 0 {
            return Err(assertion(format!("Table '{}' does not exist", table_name)));
        }
        Ok(())
    }

    pub fn assert_table_not_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.count_objects("table", table_name)? > 0 {
            return Err(assertion(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    pub fn assert_column_exists(
        &mut self,
        table_name: &str,
        column_name: &str,
    ) -> Result<(), Error> {
        let columns = self.get_columns(table_name)?;
        if !columns.iter().any(|c| c.name == column_name) {
            return Err(assertion(format!(
                "Column '{}' does not exist in table '{}'",
                column_name, table_name
            )));
        }
        Ok(())
    }

    pub fn assert_index_exists(&mut self, index_name: &str) -> Result<(), Error> {
        if self.count_objects("index", index_name)? == 0 {
            return Err(assertion(format!("Index '{}' does not exist", index_name)));
        }
        Ok(())
    }

    /// Capture the user schema, leaving out SQLite internals, the ledger and its lock table.
    pub fn capture_schema(&mut self) -> Result<SchemaSnapshot, Error> {
        let ledger = self.migrator.ledger_table_name().to_string();
        let lock = format!("{}_lock", ledger);
        let table_names: Vec<String> = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != ?1 AND name != ?2",
            )?
            .query_map([&ledger, &lock], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = BTreeMap::new();
        for table_name in table_names {
            let schema = TableSchema {
                columns: self.get_columns(&table_name)?,
                indexes: self.get_indexes(&table_name)?,
                foreign_keys: self.get_foreign_keys(&table_name)?,
            };
            tables.insert(table_name, schema);
        }
        Ok(SchemaSnapshot { tables })
    }

    /// Assert that the current schema matches a previously captured snapshot.
    pub fn assert_schema_matches(&mut self, expected: &SchemaSnapshot) -> Result<(), Error> {
        let actual = self.capture_schema()?;
        if actual == *expected {
            return Ok(());
        }

        let mut differences = Vec::new();
        for table_name in expected.tables.keys() {
            if !actual.tables.contains_key(table_name) {
                differences.push(format!("  - Table '{}' is missing", table_name));
            }
        }
        for table_name in actual.tables.keys() {
            if !expected.tables.contains_key(table_name) {
                differences.push(format!("  - Unexpected table '{}' found", table_name));
            }
        }
        for (table_name, expected_table) in &expected.tables {
            let Some(actual_table) = actual.tables.get(table_name) else {
                continue;
            };
            if expected_table.columns != actual_table.columns {
                let expected_cols: Vec<_> =
                    expected_table.columns.iter().map(|c| &c.name).collect();
                let actual_cols: Vec<_> = actual_table.columns.iter().map(|c| &c.name).collect();
                if expected_cols != actual_cols {
                    differences.push(format!(
                        "  - Table '{}' column mismatch:\n    Expected columns: {:?}\n    Actual columns:   {:?}",
                        table_name, expected_cols, actual_cols
                    ));
                } else {
                    for (expected_col, actual_col) in
                        expected_table.columns.iter().zip(&actual_table.columns)
                    {
                        if expected_col != actual_col {
                            differences.push(format!(
                                "  - Table '{}' column '{}' properties differ:\n    Expected: {:?}\n    Actual:   {:?}",
                                table_name, expected_col.name, expected_col, actual_col
                            ));
                        }
                    }
                }
            }
            if expected_table.indexes != actual_table.indexes {
                let expected_idxs: Vec<_> =
                    expected_table.indexes.iter().map(|i| &i.name).collect();
                let actual_idxs: Vec<_> = actual_table.indexes.iter().map(|i| &i.name).collect();
                differences.push(format!(
                    "  - Table '{}' index mismatch:\n    Expected indexes: {:?}\n    Actual indexes:   {:?}",
                    table_name, expected_idxs, actual_idxs
                ));
            }
            if expected_table.foreign_keys != actual_table.foreign_keys {
                differences.push(format!(
                    "  - Table '{}' foreign key mismatch:\n    Expected: {:?}\n    Actual:   {:?}",
                    table_name, expected_table.foreign_keys, actual_table.foreign_keys
                ));
            }
        }

        Err(assertion(format!(
            "Schema mismatch detected:\n{}",
            differences.join("\n")
        )))
    }

    /// Walk the whole ledger from an empty database. Each record is applied, rolled back, checked
    /// against the schema before it, and applied again. Irreversible records are applied and the
    /// walk continues without checking them.
    pub fn assert_round_trip(&mut self) -> Result<(), Error> {
        self.reset()?;
        let records: Vec<(MigrationId, bool)> = self
            .migrator
            .records()
            .iter()
            .map(|record| (record.id().clone(), record.is_reversible()))
            .collect();
        for (id, reversible) in records {
            let before = self.capture_schema()?;
            self.migrate_up_one()?;
            if !reversible {
                continue;
            }
            self.migrate_down_one()?;
            self.assert_schema_matches(&before)
                .map_err(|e| assertion(format!("Rolling back {} did not restore the schema: {}", id, e)))?;
            self.migrate_up_one()?;
        }
        Ok(())
    }

    fn get_columns(&mut self, table_name: &str) -> Result<Vec<ColumnInfo>, Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info(\"{}\")", table_name.replace('"', "\"\"")))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    type_name: row.get(2)?,
                    not_null: row.get::<_, i32>(3)? != 0,
                    default_value: row.get(4)?,
                    primary_key: row.get::<_, i32>(5)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn get_indexes(&mut self, table_name: &str) -> Result<Vec<IndexInfo>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name, sql FROM sqlite_master WHERE type='index' AND tbl_name=?1 AND sql IS NOT NULL ORDER BY name",
        )?;
        let indexes = stmt
            .query_map([table_name], |row| {
                let sql: String = row.get(1)?;
                Ok(IndexInfo {
                    name: row.get(0)?,
                    unique: sql.to_uppercase().contains("UNIQUE"),
                    sql,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(indexes)
    }

    fn get_foreign_keys(&mut self, table_name: &str) -> Result<Vec<ForeignKeyInfo>, Error> {
        let mut stmt = self.conn.prepare(&format!(
            "PRAGMA foreign_key_list(\"{}\")",
            table_name.replace('"', "\"\"")
        ))?;
        let foreign_keys = stmt
            .query_map([], |row| {
                Ok(ForeignKeyInfo {
                    principal_table: row.get(2)?,
                    column: row.get(3)?,
                    principal_column: row.get(4)?,
                    on_delete: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(foreign_keys)
    }

    /// Get a reference to the underlying connection for advanced usage.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
