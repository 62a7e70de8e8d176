//! Applying and rolling back records against a [Target].
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "sqlite")]
//! # {
//! use rusqlite::Connection;
//! use schemalog::{ColumnDef, ColumnType, MigrationRecord, Migrator, PrimaryKeyDef, SchemaOperation};
//!
//! let migrator = Migrator::new(vec![
//!     MigrationRecord::new("20240101000000_CreateFoo")
//!         .up(vec![SchemaOperation::create_table(
//!             "Foo",
//!             vec![ColumnDef::new("Id", ColumnType::Int).not_null()],
//!             Some(PrimaryKeyDef {
//!                 name: "PK_Foo".to_string(),
//!                 columns: vec!["Id".to_string()],
//!             }),
//!         )])
//!         .down(vec![SchemaOperation::drop_table("Foo")]),
//!     MigrationRecord::new("20240102000000_AddBar")
//!         .up(vec![SchemaOperation::add_column(
//!             "Foo",
//!             ColumnDef::new("Bar", ColumnType::String),
//!         )])
//!         .down(vec![SchemaOperation::drop_column("Foo", "Bar")]),
//! ]);
//!
//! let mut conn = Connection::open_in_memory().unwrap();
//! let report = migrator.apply(&mut conn).unwrap();
//! assert_eq!(report.migrations_run.len(), 2);
//! assert!(report.failing_migration.is_none());
//!
//! migrator.rollback_to(&mut conn, None).unwrap();
//! assert_eq!(migrator.current(&mut conn).unwrap(), None);
//! # }
//! ```

use crate::core::{
    AppliedMigration, Direction, MigrationFailure, MigrationId, MigrationRecord, MigrationReport,
    DEFAULT_LEDGER_TABLE_NAME, PRODUCT_VERSION,
};
use crate::error::Error;
use crate::interpreter::{Interpreter, PlannedStatement};
use crate::operation::SchemaOperation;
use crate::provider::{Provider, ProviderContext};
use crate::target::{LockOutcome, Target};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation for a run. Checked before each record; a record that has started
/// always runs to completion or failure.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The entrypoint for applying a ledger of [MigrationRecord]s.
/// Construct it with every record, oldest first. Ids must be well formed, unique and strictly ascending.
pub struct Migrator {
    records: Vec<MigrationRecord>,
    ledger_table_name: String,
    lock_wait_timeout: Duration,
    provider_context: Option<ProviderContext>,
    cancellation: Option<CancellationFlag>,
    on_migration_start: Option<Box<dyn Fn(&MigrationId, Direction) + Send + Sync>>,
    on_migration_complete: Option<Box<dyn Fn(&MigrationId, Direction, Duration) + Send + Sync>>,
    on_migration_error: Option<Box<dyn Fn(&MigrationId, Direction, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("records", &self.records)
            .field("ledger_table_name", &self.ledger_table_name)
            .field("lock_wait_timeout", &self.lock_wait_timeout)
            .field("provider_context", &self.provider_context)
            .field("cancellation", &self.cancellation)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

/// Where a failed record stopped, before it is attributed to the record.
struct RecordError {
    operation_index: Option<usize>,
    statement: Option<String>,
    durable: bool,
    error: Error,
}

impl Migrator {
    /// Create a new Migrator, validating the record ids.
    pub fn try_new(records: Vec<MigrationRecord>) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        for record in &records {
            record.id().validate()?;
            if !seen.insert(record.id()) {
                return Err(Error::DuplicateId(record.id().clone()));
            }
        }
        for pair in records.windows(2) {
            if pair[0].id() >= pair[1].id() {
                return Err(Error::OrderingViolation(format!(
                    "migration {} is listed after {}; records must be in ascending id order",
                    pair[1].id(),
                    pair[0].id()
                )));
            }
        }

        Ok(Self {
            records,
            ledger_table_name: DEFAULT_LEDGER_TABLE_NAME.to_string(),
            lock_wait_timeout: Duration::from_secs(30),
            provider_context: None,
            cancellation: None,
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        })
    }

    /// Create a new Migrator, panicking if the record ids are invalid.
    /// For a non-panicking version, use `try_new`.
    pub fn new(records: Vec<MigrationRecord>) -> Self {
        match Self::try_new(records) {
            Ok(migrator) => migrator,
            Err(err) => panic!("{}", err),
        }
    }

    /// Set a custom name for the ledger table.
    /// Defaults to "_schemalog_history_".
    pub fn with_ledger_table_name(mut self, name: impl Into<String>) -> Self {
        self.ledger_table_name = name.into();
        self
    }

    /// How long statements wait for locks held by other sessions before failing.
    /// Defaults to 30 seconds. This is not a statement timeout.
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Override the capabilities assumed for the target.
    /// The context's provider must match the provider of the targets this migrator runs against.
    pub fn with_provider_context(mut self, ctx: ProviderContext) -> Self {
        self.provider_context = Some(ctx);
        self
    }

    /// Stop a run between records once the flag is cancelled.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);
        self
    }

    /// Set a callback to be invoked when a record starts.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationId, Direction) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a record completes successfully.
    /// The callback also receives how long the record took.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationId, Direction, Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a record fails.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationId, Direction, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    pub fn records(&self) -> &[MigrationRecord] {
        &self.records
    }

    pub fn ledger_table_name(&self) -> &str {
        &self.ledger_table_name
    }

    pub fn find(&self, id: &MigrationId) -> Option<&MigrationRecord> {
        self.records.iter().find(|r| r.id() == id)
    }

    fn require_known(&self, id: &MigrationId) -> Result<&MigrationRecord, Error> {
        self.find(id)
            .ok_or_else(|| Error::UnknownMigration(id.clone()))
    }

    fn provider_context(&self, provider: Provider) -> Result<ProviderContext, Error> {
        match self.provider_context {
            Some(ctx) if ctx.provider() != provider => Err(Error::InvalidTarget(format!(
                "migrator is configured for {} but the target is {}",
                ctx.provider(),
                provider
            ))),
            Some(ctx) => Ok(ctx),
            None => Ok(ProviderContext::new(provider)),
        }
    }

    /// Id of the most recently applied record, `None` on a fresh database.
    pub fn current<T: Target + ?Sized>(&self, target: &mut T) -> Result<Option<MigrationId>, Error> {
        Ok(self.history(target)?.pop().map(|applied| applied.id))
    }

    /// Every ledger row, oldest first.
    pub fn history<T: Target + ?Sized>(&self, target: &mut T) -> Result<Vec<AppliedMigration>, Error> {
        if !target.ledger_exists(&self.ledger_table_name)? {
            return Ok(vec![]);
        }
        target.applied_migrations(&self.ledger_table_name)
    }

    /// Records an [Migrator::apply] would run, in order.
    pub fn pending<T: Target + ?Sized>(&self, target: &mut T) -> Result<Vec<&MigrationRecord>, Error> {
        let applied = self.history(target)?;
        self.validate_ledger(&applied)?;
        Ok(self.pending_records(&applied, None))
    }

    /// Records a [Migrator::rollback_to] with the same target would roll back, in order.
    pub fn preview_rollback<T: Target + ?Sized>(
        &self,
        target: &mut T,
        to: Option<&MigrationId>,
    ) -> Result<Vec<&MigrationRecord>, Error> {
        let applied = self.history(target)?;
        self.validate_ledger(&applied)?;
        self.rollback_records(&applied, to)
    }

    /// Check the ledger against the records before anything runs.
    fn validate_ledger(&self, applied: &[AppliedMigration]) -> Result<(), Error> {
        for row in applied {
            let record = self
                .find(&row.id)
                .ok_or_else(|| Error::UnknownAppliedMigration(row.id.clone()))?;
            let checksum = record.checksum();
            if checksum != row.checksum {
                return Err(Error::ChecksumMismatch {
                    id: row.id.clone(),
                    expected: row.checksum.clone(),
                    found: checksum,
                });
            }
        }
        // A record older than the newest applied one that never ran was added out of order.
        if let Some(latest) = applied.iter().map(|row| &row.id).max() {
            let applied_ids: HashSet<&MigrationId> = applied.iter().map(|row| &row.id).collect();
            if let Some(missing) = self
                .records
                .iter()
                .find(|r| r.id() < latest && !applied_ids.contains(r.id()))
            {
                return Err(Error::OrderingViolation(format!(
                    "migration {} exists but was not applied, yet the later migration {} is. \
                    It was likely added after {} was applied",
                    missing.id(),
                    latest,
                    latest
                )));
            }
        }
        Ok(())
    }

    fn pending_records(
        &self,
        applied: &[AppliedMigration],
        to: Option<&MigrationId>,
    ) -> Vec<&MigrationRecord> {
        let latest = applied.iter().map(|row| &row.id).max();
        self.records
            .iter()
            .filter(|r| latest.map_or(true, |latest| r.id() > latest))
            .take_while(|r| to.map_or(true, |to| r.id() <= to))
            .collect()
    }

    fn rollback_records(
        &self,
        applied: &[AppliedMigration],
        to: Option<&MigrationId>,
    ) -> Result<Vec<&MigrationRecord>, Error> {
        if let Some(to) = to {
            if !applied.iter().any(|row| &row.id == to) {
                return Err(Error::InvalidTarget(format!(
                    "cannot roll back to {}: it is not an applied migration",
                    to
                )));
            }
        }
        let mut records = applied
            .iter()
            .filter(|row| to.map_or(true, |to| &row.id > to))
            .map(|row| self.require_known(&row.id))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| b.id().cmp(a.id()));
        Ok(records)
    }

    /// Apply every pending record.
    ///
    /// Each record runs in its own transaction together with its ledger row. The run stops at the
    /// first failing record, which is reported in [MigrationReport::failing_migration]; errors that
    /// prevent the run from starting (lock contention, ledger validation) are returned as `Err`.
    pub fn apply<T: Target + ?Sized>(&self, target: &mut T) -> Result<MigrationReport<'_>, Error> {
        self.apply_internal(target, None)
    }

    /// Apply pending records up to and including `to`.
    pub fn apply_to<T: Target + ?Sized>(
        &self,
        target: &mut T,
        to: &MigrationId,
    ) -> Result<MigrationReport<'_>, Error> {
        self.require_known(to)?;
        self.apply_internal(target, Some(to))
    }

    fn apply_internal<T: Target + ?Sized>(
        &self,
        target: &mut T,
        to: Option<&MigrationId>,
    ) -> Result<MigrationReport<'_>, Error> {
        let interpreter = Interpreter::new(self.provider_context(target.provider())?);
        self.locked(target, |target| {
            let ledger_existed = target.ledger_exists(&self.ledger_table_name)?;
            if !ledger_existed {
                target.create_ledger(&self.ledger_table_name)?;
            }
            let applied = target.applied_migrations(&self.ledger_table_name)?;
            self.validate_ledger(&applied)?;
            let pending = self.pending_records(&applied, to);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                current = ?applied.last().map(|row| row.id.as_str()),
                target = ?to.map(|id| id.as_str()),
                pending = ?pending.iter().map(|r| r.id().as_str()).collect::<Vec<_>>(),
                "Considering migrations to run"
            );

            // All records of one run share the same timestamp
            let batch_applied_at = Utc::now();
            let mut report = MigrationReport {
                ledger_existed,
                ledger_created: !ledger_existed,
                migrations_run: vec![],
                failing_migration: None,
                cancelled: false,
            };
            for record in pending {
                if self.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let outcome = self.run_record(target, &interpreter, record, Direction::Up, |target| {
                    target.insert_applied(
                        &self.ledger_table_name,
                        &AppliedMigration {
                            id: record.id().clone(),
                            applied_at: batch_applied_at,
                            checksum: record.checksum(),
                            product_version: PRODUCT_VERSION.to_string(),
                        },
                    )
                });
                match outcome {
                    Ok(()) => report.migrations_run.push(record.id().clone()),
                    Err(failure) => {
                        report.failing_migration = Some(failure);
                        break;
                    }
                }
            }
            Ok(report)
        })
    }

    /// Roll back applied records newer than `to`, newest first. `None` rolls back everything.
    ///
    /// `to` must be an applied record. Every record in range must be reversible; otherwise the call
    /// fails with [Error::Irreversible] before anything runs.
    pub fn rollback_to<T: Target + ?Sized>(
        &self,
        target: &mut T,
        to: Option<&MigrationId>,
    ) -> Result<MigrationReport<'_>, Error> {
        let interpreter = Interpreter::new(self.provider_context(target.provider())?);
        self.locked(target, |target| {
            let ledger_existed = target.ledger_exists(&self.ledger_table_name)?;
            let applied = if ledger_existed {
                target.applied_migrations(&self.ledger_table_name)?
            } else {
                vec![]
            };
            self.validate_ledger(&applied)?;
            let records = self.rollback_records(&applied, to)?;
            if let Some(irreversible) = records.iter().find(|r| !r.is_reversible()) {
                return Err(Error::Irreversible(irreversible.id().clone()));
            }

            let mut report = MigrationReport {
                ledger_existed,
                ledger_created: false,
                migrations_run: vec![],
                failing_migration: None,
                cancelled: false,
            };
            for record in records {
                if self.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let outcome =
                    self.run_record(target, &interpreter, record, Direction::Down, |target| {
                        target.delete_applied(&self.ledger_table_name, record.id())
                    });
                match outcome {
                    Ok(()) => report.migrations_run.push(record.id().clone()),
                    Err(failure) => {
                        report.failing_migration = Some(failure);
                        break;
                    }
                }
            }
            Ok(report)
        })
    }

    /// Clear a run lock left behind by a crashed run. Returns whether a lock was cleared.
    pub fn force_unlock<T: Target + ?Sized>(&self, target: &mut T) -> Result<bool, Error> {
        target.force_unlock(&self.ledger_table_name)
    }

    /// Render a deployment script moving a database from `from` to `to` without touching one.
    ///
    /// Up scripts cover records after `from` up to and including `to` and insert their ledger rows.
    /// Down scripts cover records after `to` up to and including `from`, newest first, and delete
    /// their ledger rows. `None` means the start or the end of the ledger respectively.
    pub fn script(
        &self,
        ctx: impl Into<ProviderContext>,
        direction: Direction,
        from: Option<&MigrationId>,
        to: Option<&MigrationId>,
    ) -> Result<String, Error> {
        for id in [from, to].into_iter().flatten() {
            self.require_known(id)?;
        }
        let interpreter = Interpreter::new(ctx.into());
        let mut script = String::new();
        match direction {
            Direction::Up => {
                let applied_at = Utc::now().to_rfc3339();
                interpreter.push_statement(
                    &mut script,
                    &interpreter.ledger_create_sql(&self.ledger_table_name),
                );
                script.push('\n');
                for record in self
                    .records
                    .iter()
                    .filter(|r| from.map_or(true, |from| r.id() > from))
                    .filter(|r| to.map_or(true, |to| r.id() <= to))
                {
                    interpreter.script_record(&mut script, record, Direction::Up)?;
                    interpreter.push_statement(
                        &mut script,
                        &interpreter.ledger_insert_sql(
                            &self.ledger_table_name,
                            record,
                            &applied_at,
                            PRODUCT_VERSION,
                        ),
                    );
                    script.push('\n');
                }
            }
            Direction::Down => {
                for record in self
                    .records
                    .iter()
                    .rev()
                    .filter(|r| from.map_or(true, |from| r.id() <= from))
                    .filter(|r| to.map_or(true, |to| r.id() > to))
                {
                    interpreter.script_record(&mut script, record, Direction::Down)?;
                    interpreter.push_statement(
                        &mut script,
                        &interpreter.ledger_delete_sql(&self.ledger_table_name, record),
                    );
                    script.push('\n');
                }
            }
        }
        Ok(script)
    }

    fn is_cancelled(&self) -> bool {
        let cancelled = self
            .cancellation
            .as_ref()
            .map_or(false, CancellationFlag::is_cancelled);
        #[cfg(feature = "tracing")]
        if cancelled {
            tracing::info!("Run cancelled before the next migration");
        }
        cancelled
    }

    /// Hold the run lock for the duration of `body`, releasing it whether or not `body` succeeds.
    fn locked<T: Target + ?Sized, R>(
        &self,
        target: &mut T,
        body: impl FnOnce(&mut T) -> Result<R, Error>,
    ) -> Result<R, Error> {
        target.prepare_session(self.lock_wait_timeout)?;
        let owner = uuid::Uuid::new_v4().to_string();
        match target.try_lock(&self.ledger_table_name, &owner)? {
            LockOutcome::Acquired => {}
            LockOutcome::Held { holder } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(ledger = %self.ledger_table_name, holder = ?holder, "Migration lock is held by another run");
                return Err(Error::LockContention {
                    ledger: self.ledger_table_name.clone(),
                    holder,
                });
            }
        }
        let result = body(target);
        let released = target.unlock(&self.ledger_table_name, &owner);
        let value = result?;
        released?;
        Ok(value)
    }

    fn run_record<'migration, T: Target + ?Sized>(
        &'migration self,
        target: &mut T,
        interpreter: &Interpreter,
        record: &'migration MigrationRecord,
        direction: Direction,
        update_ledger: impl FnOnce(&mut T) -> Result<(), Error>,
    ) -> Result<(), MigrationFailure<'migration>> {
        #[cfg(feature = "tracing")]
        let _span = match direction {
            Direction::Up => tracing::info_span!("migration_up", id = %record.id()),
            Direction::Down => tracing::info_span!("migration_down", id = %record.id()),
        }
        .entered();

        #[cfg(feature = "tracing")]
        tracing::info!("Starting migration");

        if let Some(ref callback) = self.on_migration_start {
            callback(record.id(), direction);
        }

        let migration_start = Instant::now();
        let result = record
            .operations(direction)
            .map_err(|error| RecordError {
                operation_index: None,
                statement: None,
                durable: false,
                error,
            })
            .and_then(|operations| plan_record(interpreter, operations))
            .and_then(|plan| execute_plan(target, &plan, update_ledger));

        match result {
            Ok(()) => {
                let migration_duration = migration_start.elapsed();

                #[cfg(feature = "tracing")]
                tracing::info!(
                    duration_ms = migration_duration.as_millis(),
                    "Migration completed successfully"
                );

                if let Some(ref callback) = self.on_migration_complete {
                    callback(record.id(), direction, migration_duration);
                }
                Ok(())
            }
            Err(failure) => {
                let operation_index = failure.operation_index;
                let error = attribute(record.id(), failure);

                #[cfg(feature = "tracing")]
                tracing::error!(
                    error = %error,
                    operation_index = ?operation_index,
                    "Migration failed"
                );

                if let Some(ref callback) = self.on_migration_error {
                    callback(record.id(), direction, &error);
                }

                Err(MigrationFailure {
                    record,
                    direction,
                    operation_index,
                    error,
                })
            }
        }
    }
}

/// Translate every operation of a record before any of it runs.
fn plan_record(
    interpreter: &Interpreter,
    operations: &[SchemaOperation],
) -> Result<Vec<PlannedStatement>, RecordError> {
    let mut plan = Vec::new();
    for (operation_index, operation) in operations.iter().enumerate() {
        let statements = interpreter.translate(operation).map_err(|error| RecordError {
            operation_index: Some(operation_index),
            statement: None,
            durable: false,
            error,
        })?;
        plan.extend(statements.into_iter().map(|statement| PlannedStatement {
            operation_index,
            statement,
        }));
    }
    Ok(plan)
}

/// Run a planned record. Transactional statements share one transaction with the ledger update;
/// a non-transactional statement commits what ran before it and runs on its own.
fn execute_plan<T: Target + ?Sized>(
    target: &mut T,
    plan: &[PlannedStatement],
    update_ledger: impl FnOnce(&mut T) -> Result<(), Error>,
) -> Result<(), RecordError> {
    let mut in_transaction = false;
    // Whether any statement of this record has been made permanent.
    let mut durable = false;

    for planned in plan {
        let statement = &planned.statement;
        let fail = |error: Error, durable: bool| RecordError {
            operation_index: Some(planned.operation_index),
            statement: Some(statement.sql.clone()),
            durable,
            error,
        };
        let result = if statement.transactional {
            if !in_transaction {
                target.begin().map_err(|e| fail(e, durable))?;
                in_transaction = true;
            }
            target.execute(&statement.sql)
        } else {
            if in_transaction {
                target.commit().map_err(|e| fail(e, durable))?;
                in_transaction = false;
                durable = true;
            }
            let result = target.execute(&statement.sql);
            durable |= result.is_ok();
            result
        };
        if let Err(error) = result {
            if in_transaction {
                let _ = target.rollback();
            }
            return Err(fail(error, durable));
        }
    }

    let fail = |error: Error| RecordError {
        operation_index: None,
        statement: None,
        durable,
        error,
    };
    if !in_transaction {
        target.begin().map_err(fail)?;
    }
    if let Err(error) = update_ledger(target).and_then(|_| target.commit()) {
        let _ = target.rollback();
        return Err(fail(error));
    }
    Ok(())
}

/// Attach the record id to a failure. Failures after durable work become [Error::PartialApplication].
fn attribute(id: &MigrationId, failure: RecordError) -> Error {
    match failure.error {
        // Raised before anything ran; already names the record or operation.
        error @ (Error::UnsupportedOperation { .. }
        | Error::LossyConversion { .. }
        | Error::Irreversible(_))
            if !failure.durable =>
        {
            error
        }
        error if failure.durable => Error::PartialApplication {
            id: id.clone(),
            operation_index: failure.operation_index,
            source: Box::new(error),
        },
        error => Error::Execution {
            id: id.clone(),
            operation_index: failure.operation_index,
            statement: failure.statement,
            source: Box::new(error),
        },
    }
}
