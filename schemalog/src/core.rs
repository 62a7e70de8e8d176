use crate::error::Error;
use crate::operation::SchemaOperation;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub(crate) const DEFAULT_LEDGER_TABLE_NAME: &str = "_schemalog_history_";

/// Identifier of a [MigrationRecord]: a 14-digit UTC timestamp, an underscore and a name,
/// e.g. `20170301113016_EntGroupLegalUnitLink`.
///
/// Ids sort lexicographically, which for well-formed ids is the same as sorting by timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(String);

impl MigrationId {
    /// Wrap a string without validating it. [MigrationId::validate] is run by the migrator.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate an id.
    pub fn parse(id: &str) -> Result<Self, Error> {
        let id = Self::new(id);
        id.validate()?;
        Ok(id)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let bytes = self.0.as_bytes();
        let well_formed = bytes.len() > 15
            && bytes[..14].iter().all(u8::is_ascii_digit)
            && bytes[14] == b'_'
            && bytes[15..]
                .iter()
                .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-');
        if well_formed {
            Ok(())
        } else {
            Err(Error::InvalidId(self.0.clone()))
        }
    }

    /// The `YYYYMMDDHHMMSS` prefix.
    pub fn timestamp(&self) -> &str {
        self.0.get(..14).unwrap_or(&self.0)
    }

    /// The human readable part after the timestamp.
    pub fn slug(&self) -> &str {
        self.0.get(15..).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MigrationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MigrationId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Which side of a [MigrationRecord] is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// One immutable schema delta with its forward and backward operations.
///
/// # IMPORTANT WARNING
///
/// **Once a record has been applied to any database, neither its id nor its operations may change.**
/// Both are part of the checksum stored in the ledger, and a mismatch stops every later run.
/// The description is free text and can be edited at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    id: MigrationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    up: Vec<SchemaOperation>,
    #[serde(default)]
    down: Option<Vec<SchemaOperation>>,
}

impl MigrationRecord {
    /// Start a record with no operations. It stays irreversible until [MigrationRecord::down]
    /// supplies its inverse.
    pub fn new(id: impl Into<MigrationId>) -> Self {
        Self {
            id: id.into(),
            description: None,
            up: Vec::new(),
            down: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the forward operations.
    pub fn up(mut self, operations: Vec<SchemaOperation>) -> Self {
        self.up = operations;
        self
    }

    /// Set the backward operations. They run in listed order on rollback.
    pub fn down(mut self, operations: Vec<SchemaOperation>) -> Self {
        self.down = Some(operations);
        self
    }

    /// Declare that this record has no inverse. Rolling back across it is refused.
    pub fn irreversible(mut self) -> Self {
        self.down = None;
        self
    }

    pub fn id(&self) -> &MigrationId {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn up_operations(&self) -> &[SchemaOperation] {
        &self.up
    }

    /// `None` for irreversible records.
    pub fn down_operations(&self) -> Option<&[SchemaOperation]> {
        self.down.as_deref()
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    /// The operations for one direction, or [Error::Irreversible] for the down side of an
    /// irreversible record.
    pub fn operations(&self, direction: Direction) -> Result<&[SchemaOperation], Error> {
        match direction {
            Direction::Up => Ok(&self.up),
            Direction::Down => self
                .down_operations()
                .ok_or_else(|| Error::Irreversible(self.id.clone())),
        }
    }

    /// Calculate the checksum stored in the ledger when this record is applied.
    /// It covers the id and both operation lists, but not the description.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(serde_json::to_vec(&self.up).unwrap_or_default());
        hasher.update(b"|");
        hasher.update(serde_json::to_vec(&self.down).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }
}

/// A row of the applied-migration ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMigration {
    pub id: MigrationId,
    /// When the record was applied. All records of one run share the same timestamp.
    pub applied_at: chrono::DateTime<Utc>,
    /// The checksum of the record at the time it was applied.
    pub checksum: String,
    /// Version of schemalog that applied the record.
    pub product_version: String,
}

pub(crate) const PRODUCT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Represents a failure while applying or rolling back a record.
#[derive(Debug, PartialEq)]
pub struct MigrationFailure<'migration> {
    pub(crate) record: &'migration MigrationRecord,
    pub(crate) direction: Direction,
    pub(crate) operation_index: Option<usize>,
    pub(crate) error: Error,
}

impl<'migration> MigrationFailure<'migration> {
    /// Get the record that failed.
    pub fn record(&self) -> &MigrationRecord {
        self.record
    }

    pub fn id(&self) -> &MigrationId {
        self.record.id()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index of the failing operation within the record, `None` when the ledger update failed.
    pub fn operation_index(&self) -> Option<usize> {
        self.operation_index
    }

    /// Get the error that caused the record to fail.
    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_error(self) -> Error {
        self.error
    }
}

/// A report of actions performed during a run.
#[derive(Debug, PartialEq)]
pub struct MigrationReport<'migration> {
    pub ledger_existed: bool,
    pub ledger_created: bool,
    /// Ids of the records applied (or rolled back), in execution order.
    pub migrations_run: Vec<MigrationId>,
    pub failing_migration: Option<MigrationFailure<'migration>>,
    /// The run stopped early because cancellation was requested.
    pub cancelled: bool,
}

impl<'migration> MigrationReport<'migration> {
    /// Turn a report carrying a failure into that failure's error.
    pub fn into_result(self) -> Result<Vec<MigrationId>, Error> {
        match self.failing_migration {
            Some(failure) => Err(failure.error),
            None => Ok(self.migrations_run),
        }
    }
}
