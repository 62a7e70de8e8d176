//! Declarative schema operations.
//!
//! Operations are plain data: they serialize to and from the ledger files read by
//! [`loader`](crate::loader) and are translated to SQL by the [`Interpreter`](crate::Interpreter).

use crate::provider::{Capability, Provider, ProviderContext};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical column types, mapped to a concrete type per provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    SmallInt,
    Int,
    BigInt,
    Decimal { precision: u8, scale: u8 },
    Real,
    Double,
    /// Character data, bounded by [ColumnDef::max_length] when set.
    String,
    Date,
    DateTime,
    DateTimeOffset,
    Guid,
    Binary,
    /// A provider specific type name, passed through verbatim.
    Custom(String),
}

impl ColumnType {
    fn integer_rank(&self) -> Option<u8> {
        match self {
            ColumnType::Boolean => Some(0),
            ColumnType::SmallInt => Some(1),
            ColumnType::Int => Some(2),
            ColumnType::BigInt => Some(3),
            _ => None,
        }
    }

    /// Whether every value of `self` (bounded by `from_length`) converts to `to` (bounded by
    /// `to_length`) without loss.
    pub fn converts_losslessly(
        &self,
        from_length: Option<u32>,
        to: &ColumnType,
        to_length: Option<u32>,
    ) -> bool {
        let fits = |needed: u32| to_length.map_or(true, |max| max >= needed);
        match (self, to) {
            (ColumnType::String, ColumnType::String) | (ColumnType::Binary, ColumnType::Binary) => {
                match (from_length, to_length) {
                    (_, None) => true,
                    (None, Some(_)) => false,
                    (Some(from), Some(to)) => to >= from,
                }
            }
            (a, b) if a == b => true,
            (a, b) if a.integer_rank().is_some() && b.integer_rank().is_some() => {
                a.integer_rank() <= b.integer_rank()
            }
            (ColumnType::SmallInt | ColumnType::Int, ColumnType::Double) => true,
            (ColumnType::SmallInt, ColumnType::Real) => true,
            (ColumnType::Real, ColumnType::Double) => true,
            (ColumnType::Date, ColumnType::DateTime | ColumnType::DateTimeOffset) => true,
            (ColumnType::DateTime, ColumnType::DateTimeOffset) => true,
            // Rendering as text: integers need at most 20 characters, a guid 36.
            (a, ColumnType::String) if a.integer_rank().is_some() => fits(20),
            (ColumnType::Guid, ColumnType::String) => fits(36),
            (ColumnType::Decimal { precision, .. }, ColumnType::String) => {
                fits(u32::from(*precision) + 2)
            }
            (ColumnType::Decimal { precision: p1, scale: s1 }, ColumnType::Decimal { precision: p2, scale: s2 }) => {
                s2 >= s1 && i16::from(*p2) - i16::from(*s2) >= i16::from(*p1) - i16::from(*s1)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::SmallInt => f.write_str("small_int"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::BigInt => f.write_str("big_int"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "decimal({}, {})", precision, scale)
            }
            ColumnType::Real => f.write_str("real"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::String => f.write_str("string"),
            ColumnType::Date => f.write_str("date"),
            ColumnType::DateTime => f.write_str("date_time"),
            ColumnType::DateTimeOffset => f.write_str("date_time_offset"),
            ColumnType::Guid => f.write_str("guid"),
            ColumnType::Binary => f.write_str("binary"),
            ColumnType::Custom(name) => f.write_str(name),
        }
    }
}

/// How key values are generated for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Values are assigned by the application.
    #[default]
    None,
    /// Engine identity column: `GENERATED BY DEFAULT AS IDENTITY`, `AUTO_INCREMENT`,
    /// `IDENTITY(1,1)` or SQLite `AUTOINCREMENT`.
    Identity,
    /// PostgreSQL sequence-backed `serial` column. Other providers treat it as [IdentityStrategy::Identity].
    Serial,
}

impl IdentityStrategy {
    pub fn is_generated(&self) -> bool {
        !matches!(self, IdentityStrategy::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Bool(bool),
    Integer(i64),
    String(String),
    /// Raw SQL expression such as `CURRENT_TIMESTAMP`.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub identity: IdentityStrategy,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    /// A nullable column with no length, default or identity.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            max_length: None,
            default: None,
            identity: IdentityStrategy::None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn default_value(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Generated key column. Identity columns are never nullable.
    pub fn identity(mut self, identity: IdentityStrategy) -> Self {
        self.identity = identity;
        if identity.is_generated() {
            self.nullable = false;
        }
        self
    }

    /// Human readable shape used in error messages, e.g. `string(200) not null`.
    pub fn describe(&self) -> String {
        let mut out = self.column_type.to_string();
        if let Some(length) = self.max_length {
            out.push_str(&format!("({})", length));
        }
        if !self.nullable {
            out.push_str(" not null");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyDef {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    pub principal_table: String,
    pub principal_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Partial index predicate (`WHERE ...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<PrimaryKeyDef>,
    /// Foreign keys declared inline; their `table` must equal [CreateTable::name].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterColumn {
    pub table: String,
    pub name: String,
    /// The column after the change.
    pub column: ColumnDef,
    /// The column before the change.
    pub old: ColumnDef,
    /// Conversion expression for changes that cannot be made implicitly, e.g.
    /// `"ReorgReferences"::integer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<String>,
}

/// What an [AlterColumn] changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnChanges {
    pub column_type: bool,
    pub max_length: bool,
    pub nullability: bool,
    pub default: bool,
    pub identity: bool,
}

impl ColumnChanges {
    pub fn storage(&self) -> bool {
        self.column_type || self.max_length
    }

    pub fn is_empty(&self) -> bool {
        *self == ColumnChanges::default()
    }
}

impl AlterColumn {
    pub fn changes(&self) -> ColumnChanges {
        ColumnChanges {
            column_type: self.column.column_type != self.old.column_type,
            max_length: self.column.max_length != self.old.max_length,
            nullability: self.column.nullable != self.old.nullable,
            default: self.column.default != self.old.default,
            identity: self.column.identity != self.old.identity,
        }
    }

    /// Whether existing values may not survive the change without an explicit cast.
    pub fn is_narrowing(&self) -> bool {
        let changes = self.changes();
        changes.storage()
            && !self.old.column_type.converts_losslessly(
                self.old.max_length,
                &self.column.column_type,
                self.column.max_length,
            )
    }
}

/// A raw SQL statement embedded in a record, typically a data fix-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatement {
    pub sql: String,
    /// Only run when the condition holds for the active provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    /// Run outside the record's transaction (engine-level DDL that refuses transactions).
    #[serde(default)]
    pub suppress_transaction: bool,
}

/// A provider or capability test guarding raw statements and conditional blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Provider(Vec<Provider>),
    NotProvider(Vec<Provider>),
    Capability(Capability),
    NotCapability(Capability),
}

impl Condition {
    pub fn holds(&self, ctx: &ProviderContext) -> bool {
        match self {
            Condition::Provider(providers) => providers.contains(&ctx.provider()),
            Condition::NotProvider(providers) => !providers.contains(&ctx.provider()),
            Condition::Capability(capability) => ctx.supports(*capability),
            Condition::NotCapability(capability) => !ctx.supports(*capability),
        }
    }
}

/// One declarative schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    CreateTable(CreateTable),
    DropTable {
        name: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        name: String,
    },
    AlterColumn(AlterColumn),
    CreateIndex(IndexDef),
    DropIndex {
        table: String,
        name: String,
    },
    AddForeignKey(ForeignKeyDef),
    DropForeignKey {
        table: String,
        name: String,
    },
    AddPrimaryKey {
        table: String,
        name: String,
        columns: Vec<String>,
    },
    DropPrimaryKey {
        table: String,
        name: String,
    },
    RenameTable {
        name: String,
        new_name: String,
    },
    RenameColumn {
        table: String,
        name: String,
        new_name: String,
    },
    RenameIndex {
        table: String,
        name: String,
        new_name: String,
    },
    Sql(RawStatement),
    /// Operations that only apply to some providers, with an alternative for the rest.
    Conditional {
        when: Condition,
        #[serde(default)]
        then: Vec<SchemaOperation>,
        #[serde(default)]
        otherwise: Vec<SchemaOperation>,
    },
}

impl SchemaOperation {
    /// Name of the operation kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SchemaOperation::CreateTable(_) => "CreateTable",
            SchemaOperation::DropTable { .. } => "DropTable",
            SchemaOperation::AddColumn { .. } => "AddColumn",
            SchemaOperation::DropColumn { .. } => "DropColumn",
            SchemaOperation::AlterColumn(_) => "AlterColumn",
            SchemaOperation::CreateIndex(_) => "CreateIndex",
            SchemaOperation::DropIndex { .. } => "DropIndex",
            SchemaOperation::AddForeignKey(_) => "AddForeignKey",
            SchemaOperation::DropForeignKey { .. } => "DropForeignKey",
            SchemaOperation::AddPrimaryKey { .. } => "AddPrimaryKey",
            SchemaOperation::DropPrimaryKey { .. } => "DropPrimaryKey",
            SchemaOperation::RenameTable { .. } => "RenameTable",
            SchemaOperation::RenameColumn { .. } => "RenameColumn",
            SchemaOperation::RenameIndex { .. } => "RenameIndex",
            SchemaOperation::Sql(_) => "Sql",
            SchemaOperation::Conditional { .. } => "Conditional",
        }
    }

    pub fn create_table(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        primary_key: Option<PrimaryKeyDef>,
    ) -> Self {
        SchemaOperation::CreateTable(CreateTable {
            name: name.into(),
            columns,
            primary_key,
            foreign_keys: Vec::new(),
        })
    }

    pub fn drop_table(name: impl Into<String>) -> Self {
        SchemaOperation::DropTable { name: name.into() }
    }

    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        SchemaOperation::AddColumn {
            table: table.into(),
            column,
        }
    }

    pub fn drop_column(table: impl Into<String>, name: impl Into<String>) -> Self {
        SchemaOperation::DropColumn {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn alter_column(table: impl Into<String>, old: ColumnDef, column: ColumnDef) -> Self {
        SchemaOperation::AlterColumn(AlterColumn {
            table: table.into(),
            name: old.name.clone(),
            column,
            old,
            cast: None,
        })
    }

    pub fn create_index(
        table: impl Into<String>,
        name: impl Into<String>,
        columns: &[&str],
        unique: bool,
    ) -> Self {
        SchemaOperation::CreateIndex(IndexDef {
            table: table.into(),
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
            filter: None,
        })
    }

    pub fn drop_index(table: impl Into<String>, name: impl Into<String>) -> Self {
        SchemaOperation::DropIndex {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn rename_column(
        table: impl Into<String>,
        name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        SchemaOperation::RenameColumn {
            table: table.into(),
            name: name.into(),
            new_name: new_name.into(),
        }
    }

    pub fn rename_table(name: impl Into<String>, new_name: impl Into<String>) -> Self {
        SchemaOperation::RenameTable {
            name: name.into(),
            new_name: new_name.into(),
        }
    }

    /// A transactional raw statement for every provider.
    pub fn sql(sql: impl Into<String>) -> Self {
        SchemaOperation::Sql(RawStatement {
            sql: sql.into(),
            when: None,
            suppress_transaction: false,
        })
    }

    /// A raw statement that only runs on the given providers.
    pub fn sql_for(providers: &[Provider], sql: impl Into<String>) -> Self {
        SchemaOperation::Sql(RawStatement {
            sql: sql.into(),
            when: Some(Condition::Provider(providers.to_vec())),
            suppress_transaction: false,
        })
    }

    /// A raw statement executed outside the record's transaction.
    pub fn sql_without_transaction(sql: impl Into<String>) -> Self {
        SchemaOperation::Sql(RawStatement {
            sql: sql.into(),
            when: None,
            suppress_transaction: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_string_length_is_lossless() {
        let alter = AlterColumn {
            table: "Address".to_string(),
            name: "GpsCoordinates".to_string(),
            old: ColumnDef::new("GpsCoordinates", ColumnType::String).max_length(15),
            column: ColumnDef::new("GpsCoordinates", ColumnType::String).max_length(256),
            cast: None,
        };
        assert!(alter.changes().max_length);
        assert!(!alter.is_narrowing());
    }

    #[test]
    fn bounding_an_unbounded_string_is_narrowing() {
        let alter = AlterColumn {
            table: "StatisticalUnits".to_string(),
            name: "WebAddress".to_string(),
            old: ColumnDef::new("WebAddress", ColumnType::String),
            column: ColumnDef::new("WebAddress", ColumnType::String).max_length(200),
            cast: None,
        };
        assert!(alter.is_narrowing());
    }

    #[test]
    fn int_to_short_string_is_narrowing_but_to_text_is_not() {
        let old = ColumnDef::new("ReorgReferences", ColumnType::Int);
        assert!(ColumnType::Int.converts_losslessly(None, &ColumnType::String, None));
        assert!(!ColumnType::Int.converts_losslessly(None, &ColumnType::String, Some(10)));
        assert!(ColumnType::Int.converts_losslessly(None, &ColumnType::String, Some(20)));
        let alter = AlterColumn {
            table: "StatisticalUnits".to_string(),
            name: old.name.clone(),
            column: ColumnDef::new("ReorgReferences", ColumnType::String).max_length(5),
            old,
            cast: None,
        };
        assert!(alter.is_narrowing());
    }

    #[test]
    fn nullability_only_change_is_not_narrowing() {
        let alter = AlterColumn {
            table: "StatisticalUnits".to_string(),
            name: "AddressId".to_string(),
            old: ColumnDef::new("AddressId", ColumnType::Int).not_null(),
            column: ColumnDef::new("AddressId", ColumnType::Int),
            cast: None,
        };
        let changes = alter.changes();
        assert!(changes.nullability);
        assert!(!changes.storage());
        assert!(!alter.is_narrowing());
    }

    #[test]
    fn conditions_follow_provider_and_capabilities() {
        let postgres = ProviderContext::new(Provider::Postgres);
        let sqlite = ProviderContext::new(Provider::Sqlite);
        let only_postgres = Condition::Provider(vec![Provider::Postgres]);
        assert!(only_postgres.holds(&postgres));
        assert!(!only_postgres.holds(&sqlite));
        let alterable = Condition::Capability(Capability::AlterColumn);
        assert!(alterable.holds(&postgres));
        assert!(!alterable.holds(&sqlite));
        assert!(Condition::NotCapability(Capability::AlterColumn).holds(&sqlite));
    }

    #[test]
    fn operations_deserialize_from_tagged_json() {
        let json = r#"{
            "op": "add_column",
            "table": "StatisticalUnits",
            "column": { "name": "EnterpriseGroupRegId", "type": "int" }
        }"#;
        let op: SchemaOperation = serde_json::from_str(json).unwrap();
        assert_eq!(
            op,
            SchemaOperation::add_column(
                "StatisticalUnits",
                ColumnDef::new("EnterpriseGroupRegId", ColumnType::Int)
            )
        );
    }
}
