#![cfg_attr(docsrs, feature(doc_cfg))]
//! `schemalog` manages database schema evolution as an ordered ledger of records.
//!
//! Core concepts:
//! - A [MigrationRecord] is an identified pair of [SchemaOperation] lists, one to move forward
//!   and optionally one to undo it.
//! - An [Interpreter] turns operations into SQL for one [Provider], honoring its capabilities.
//! - A [Migrator] compares the records with the ledger table stored in the database and applies
//!   or rolls back the difference, one transaction per record where the provider allows it.
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "sqlite")]
//! # fn main() -> Result<(), schemalog::Error> {
//! use schemalog::{ColumnDef, ColumnType, MigrationRecord, Migrator, PrimaryKeyDef, SchemaOperation};
//!
//! let migrator = Migrator::new(vec![
//!     MigrationRecord::new("20240101000000_CreateFoo")
//!         .up(vec![SchemaOperation::create_table(
//!             "Foo",
//!             vec![ColumnDef::new("Id", ColumnType::Int).not_null()],
//!             Some(PrimaryKeyDef { name: "PK_Foo".to_string(), columns: vec!["Id".to_string()] }),
//!         )])
//!         .down(vec![SchemaOperation::drop_table("Foo")]),
//! ]);
//!
//! let mut conn = rusqlite::Connection::open_in_memory().unwrap();
//! let report = migrator.apply(&mut conn)?;
//! assert_eq!(report.migrations_run.len(), 1);
//! assert!(migrator.pending(&mut conn)?.is_empty());
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! ```
//!
//! # Features
//! - Checksums detect records edited after they were applied.
//! - A ledger lock keeps concurrent runners from interleaving.
//! - Rollback to any earlier record, refused across irreversible records.
//! - Dry-run scripts for review.
//! - Observability hooks and cancellation between records.
//! - Tracing integration - available with the `tracing` feature flag.
//! - Testing utilities - available with the `testing` feature flag.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag.
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.

mod core;
pub use core::{
    AppliedMigration, Direction, MigrationFailure, MigrationId, MigrationRecord, MigrationReport,
};

mod error;
pub use error::Error;

#[macro_use]
mod macros;

mod operation;
pub use operation::{
    AlterColumn, ColumnChanges, ColumnDef, ColumnType, Condition, CreateTable, DefaultValue,
    ForeignKeyDef, IdentityStrategy, IndexDef, PrimaryKeyDef, RawStatement, ReferentialAction,
    SchemaOperation,
};

mod provider;
pub use provider::{Capabilities, Capability, Provider, ProviderContext};

mod interpreter;
pub use interpreter::{Interpreter, PlannedStatement, Statement};

mod target;
pub use target::{LockOutcome, Target};

mod runner;
pub use runner::{CancellationFlag, Migrator};

pub mod loader;

pub mod model;
pub use model::{check_reversibility, ReversibilityIssue, SchemaModel, TableModel};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(all(test, feature = "mysql"))]
pub(crate) mod test_mysql;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
