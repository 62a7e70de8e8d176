use crate::core::MigrationId;
use crate::provider::Provider;

/// Error type for the schemalog crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{operation} is not supported by {provider}: {detail}")]
    UnsupportedOperation {
        operation: &'static str,
        provider: Provider,
        detail: String,
    },
    #[error(
        "altering column '{column}' of table '{table}' from {from} to {to} could lose data; supply an explicit cast"
    )]
    LossyConversion {
        table: String,
        column: String,
        from: String,
        to: String,
    },
    #[error("migration {id} failed{}: {source}", describe_operation(*.operation_index))]
    Execution {
        id: MigrationId,
        operation_index: Option<usize>,
        statement: Option<String>,
        #[source]
        source: Box<Error>,
    },
    #[error(
        "migration {id} was partially applied{}: {source}. Statements outside the migration transaction already ran; the ledger was not updated and the database needs manual repair",
        describe_operation(*.operation_index)
    )]
    PartialApplication {
        id: MigrationId,
        operation_index: Option<usize>,
        #[source]
        source: Box<Error>,
    },
    #[error("Duplicate migration id found: {0}")]
    DuplicateId(MigrationId),
    #[error("Migration ordering violation: {0}")]
    OrderingViolation(String),
    #[error("Invalid migration id '{0}': expected <14-digit timestamp>_<name>")]
    InvalidId(String),
    #[error("Migration {0} is declared irreversible and cannot be rolled back")]
    Irreversible(MigrationId),
    #[error("Migration {0} does not exist in the migration list")]
    UnknownMigration(MigrationId),
    #[error(
        "Migration {0} was previously applied but is no longer present in the migration list. Applied migrations cannot be removed."
    )]
    UnknownAppliedMigration(MigrationId),
    #[error(
        "Migration {id} checksum mismatch. Expected '{expected}' but found '{found}'. This indicates the migration was modified after being applied."
    )]
    ChecksumMismatch {
        id: MigrationId,
        expected: String,
        found: String,
    },
    #[error("{0}")]
    InvalidTarget(String),
    #[error("another migration run holds the lock on '{ledger}'{}", describe_holder(.holder))]
    LockContention {
        ledger: String,
        holder: Option<String>,
    },
    #[error("failed to load {path}: {message}")]
    Load { path: String, message: String },
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),
    #[error("{0}")]
    Generic(String),
}

fn describe_operation(operation_index: Option<usize>) -> String {
    match operation_index {
        Some(index) => format!(" at operation {}", index),
        None => " while updating the ledger".to_string(),
    }
}

fn describe_holder(holder: &Option<String>) -> String {
    match holder {
        Some(holder) => format!(" (held by {})", holder),
        None => String::new(),
    }
}

impl Error {
    /// The id of the migration this error is attributed to, if any.
    pub fn migration_id(&self) -> Option<&MigrationId> {
        match self {
            Self::Execution { id, .. }
            | Self::PartialApplication { id, .. }
            | Self::DuplicateId(id)
            | Self::Irreversible(id)
            | Self::UnknownMigration(id)
            | Self::UnknownAppliedMigration(id)
            | Self::ChecksumMismatch { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Whether the database may be left in a state the ledger does not describe.
    pub fn is_partial_application(&self) -> bool {
        matches!(self, Self::PartialApplication { .. })
    }
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Driver errors don't all implement PartialEq, so compare variant and message.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.to_string() == other.to_string()
    }
}
