//! An in-memory schema catalog rebuilt from operations, used to check that each record's `down`
//! really undoes its `up`.
//!
//! The catalog only understands structured operations. Raw SQL is opaque: a record containing raw
//! SQL that would run for the given provider is reported as [ReversibilityIssue::Opaque] rather
//! than compared. Operations naming objects the catalog does not know are ignored.

use crate::core::{MigrationId, MigrationRecord};
use crate::operation::{ColumnDef, ForeignKeyDef, IndexDef, PrimaryKeyDef, SchemaOperation};
use crate::provider::ProviderContext;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableModel {
    pub columns: BTreeMap<String, ColumnDef>,
    pub primary_key: Option<PrimaryKeyDef>,
    pub indexes: BTreeMap<String, IndexDef>,
    pub foreign_keys: BTreeMap<String, ForeignKeyDef>,
}

/// Tables by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaModel {
    pub tables: BTreeMap<String, TableModel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversibilityIssue {
    /// The record declares no inverse.
    Irreversible(MigrationId),
    /// Applying `up` then `down` does not restore the prior schema.
    Asymmetric {
        id: MigrationId,
        differences: Vec<String>,
    },
    /// The record runs raw SQL whose effect cannot be modelled.
    Opaque(MigrationId),
}

impl ReversibilityIssue {
    pub fn id(&self) -> &MigrationId {
        match self {
            ReversibilityIssue::Irreversible(id)
            | ReversibilityIssue::Asymmetric { id, .. }
            | ReversibilityIssue::Opaque(id) => id,
        }
    }
}

impl std::fmt::Display for ReversibilityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReversibilityIssue::Irreversible(id) => write!(f, "{}: declared irreversible", id),
            ReversibilityIssue::Asymmetric { id, differences } => write!(
                f,
                "{}: down does not undo up ({})",
                id,
                differences.join("; ")
            ),
            ReversibilityIssue::Opaque(id) => {
                write!(f, "{}: contains raw SQL, inverse not verified", id)
            }
        }
    }
}

fn rename_in(columns: &mut [String], from: &str, to: &str) {
    for column in columns.iter_mut().filter(|c| c.as_str() == from) {
        *column = to.to_string();
    }
}

impl SchemaModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply operations in order. Returns whether any raw SQL would have run.
    pub fn apply_all(&mut self, operations: &[SchemaOperation], ctx: &ProviderContext) -> bool {
        operations
            .iter()
            .fold(false, |opaque, operation| self.apply(operation, ctx) || opaque)
    }

    /// Apply one operation. Returns whether it (or a branch it selected) is raw SQL that would run.
    pub fn apply(&mut self, operation: &SchemaOperation, ctx: &ProviderContext) -> bool {
        match operation {
            SchemaOperation::CreateTable(create) => {
                let mut table = TableModel {
                    primary_key: create.primary_key.clone(),
                    ..TableModel::default()
                };
                for column in &create.columns {
                    table.columns.insert(column.name.clone(), column.clone());
                }
                for foreign_key in &create.foreign_keys {
                    table
                        .foreign_keys
                        .insert(foreign_key.name.clone(), foreign_key.clone());
                }
                self.tables.insert(create.name.clone(), table);
            }
            SchemaOperation::DropTable { name } => {
                self.tables.remove(name);
            }
            SchemaOperation::AddColumn { table, column } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.columns.insert(column.name.clone(), column.clone());
                }
            }
            SchemaOperation::DropColumn { table, name } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.columns.remove(name);
                }
            }
            SchemaOperation::AlterColumn(alter) => {
                if let Some(table) = self.tables.get_mut(&alter.table) {
                    if table.columns.contains_key(&alter.name) {
                        table.columns.insert(alter.name.clone(), alter.column.clone());
                    }
                }
            }
            SchemaOperation::CreateIndex(index) => {
                if let Some(table) = self.tables.get_mut(&index.table) {
                    table.indexes.insert(index.name.clone(), index.clone());
                }
            }
            SchemaOperation::DropIndex { table, name } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.indexes.remove(name);
                }
            }
            SchemaOperation::AddForeignKey(foreign_key) => {
                if let Some(table) = self.tables.get_mut(&foreign_key.table) {
                    table
                        .foreign_keys
                        .insert(foreign_key.name.clone(), foreign_key.clone());
                }
            }
            SchemaOperation::DropForeignKey { table, name } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.foreign_keys.remove(name);
                }
            }
            SchemaOperation::AddPrimaryKey {
                table,
                name,
                columns,
            } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.primary_key = Some(PrimaryKeyDef {
                        name: name.clone(),
                        columns: columns.clone(),
                    });
                }
            }
            SchemaOperation::DropPrimaryKey { table, .. } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.primary_key = None;
                }
            }
            SchemaOperation::RenameTable { name, new_name } => {
                if let Some(mut table) = self.tables.remove(name) {
                    for index in table.indexes.values_mut() {
                        index.table = new_name.clone();
                    }
                    for foreign_key in table.foreign_keys.values_mut() {
                        foreign_key.table = new_name.clone();
                    }
                    self.tables.insert(new_name.clone(), table);
                    for foreign_key in self
                        .tables
                        .values_mut()
                        .flat_map(|t| t.foreign_keys.values_mut())
                        .filter(|fk| &fk.principal_table == name)
                    {
                        foreign_key.principal_table = new_name.clone();
                    }
                }
            }
            SchemaOperation::RenameColumn {
                table: table_name,
                name,
                new_name,
            } => {
                if let Some(table) = self.tables.get_mut(table_name) {
                    if let Some(mut column) = table.columns.remove(name) {
                        column.name = new_name.clone();
                        table.columns.insert(new_name.clone(), column);
                        if let Some(primary_key) = &mut table.primary_key {
                            rename_in(&mut primary_key.columns, name, new_name);
                        }
                        for index in table.indexes.values_mut() {
                            rename_in(&mut index.columns, name, new_name);
                        }
                        for foreign_key in table.foreign_keys.values_mut() {
                            rename_in(&mut foreign_key.columns, name, new_name);
                        }
                    }
                }
                for foreign_key in self
                    .tables
                    .values_mut()
                    .flat_map(|t| t.foreign_keys.values_mut())
                    .filter(|fk| &fk.principal_table == table_name)
                {
                    rename_in(&mut foreign_key.principal_columns, name, new_name);
                }
            }
            SchemaOperation::RenameIndex {
                table,
                name,
                new_name,
            } => {
                if let Some(table) = self.tables.get_mut(table) {
                    if let Some(mut index) = table.indexes.remove(name) {
                        index.name = new_name.clone();
                        table.indexes.insert(new_name.clone(), index);
                    }
                }
            }
            SchemaOperation::Sql(raw) => {
                return raw.when.as_ref().map_or(true, |when| when.holds(ctx));
            }
            SchemaOperation::Conditional {
                when,
                then,
                otherwise,
            } => {
                let branch = if when.holds(ctx) { then } else { otherwise };
                return self.apply_all(branch, ctx);
            }
        }
        false
    }

    /// Human readable differences between `self` (actual) and `expected`.
    pub fn diff(&self, expected: &SchemaModel) -> Vec<String> {
        let mut differences = Vec::new();
        for (name, table) in &expected.tables {
            match self.tables.get(name) {
                None => differences.push(format!("table {} is missing", name)),
                Some(actual) => diff_table(name, actual, table, &mut differences),
            }
        }
        for name in self.tables.keys() {
            if !expected.tables.contains_key(name) {
                differences.push(format!("table {} is unexpected", name));
            }
        }
        differences
    }
}

fn diff_table(name: &str, actual: &TableModel, expected: &TableModel, out: &mut Vec<String>) {
    diff_map("column", name, &actual.columns, &expected.columns, out, |c| {
        c.describe()
    });
    if actual.primary_key != expected.primary_key {
        out.push(format!(
            "primary key of {} is {:?}, expected {:?}",
            name, actual.primary_key, expected.primary_key
        ));
    }
    diff_map("index", name, &actual.indexes, &expected.indexes, out, |i| {
        format!(
            "{}({})",
            if i.unique { "unique " } else { "" },
            i.columns.join(", ")
        )
    });
    diff_map(
        "foreign key",
        name,
        &actual.foreign_keys,
        &expected.foreign_keys,
        out,
        |fk| {
            format!(
                "({}) -> {}({})",
                fk.columns.join(", "),
                fk.principal_table,
                fk.principal_columns.join(", ")
            )
        },
    );
}

fn diff_map<T: PartialEq>(
    kind: &str,
    table: &str,
    actual: &BTreeMap<String, T>,
    expected: &BTreeMap<String, T>,
    out: &mut Vec<String>,
    describe: impl Fn(&T) -> String,
) {
    for (name, item) in expected {
        match actual.get(name) {
            None => out.push(format!("{} {}.{} is missing", kind, table, name)),
            Some(found) if found != item => out.push(format!(
                "{} {}.{} is {}, expected {}",
                kind,
                table,
                name,
                describe(found),
                describe(item)
            )),
            Some(_) => {}
        }
    }
    for name in actual.keys() {
        if !expected.contains_key(name) {
            out.push(format!("{} {}.{} is unexpected", kind, table, name));
        }
    }
}

/// Replay the ledger and check every record's `down` against its `up`, each from the schema left
/// by the records before it.
pub fn check_reversibility(
    records: &[MigrationRecord],
    ctx: &ProviderContext,
) -> Vec<ReversibilityIssue> {
    let mut issues = Vec::new();
    let mut schema = SchemaModel::new();
    for record in records {
        let before = schema.clone();
        let up_opaque = schema.apply_all(record.up_operations(), ctx);
        let Some(down) = record.down_operations() else {
            issues.push(ReversibilityIssue::Irreversible(record.id().clone()));
            continue;
        };

        let mut rolled_back = schema.clone();
        let down_opaque = rolled_back.apply_all(down, ctx);
        if up_opaque || down_opaque {
            issues.push(ReversibilityIssue::Opaque(record.id().clone()));
            continue;
        }
        let differences = rolled_back.diff(&before);
        if !differences.is_empty() {
            issues.push(ReversibilityIssue::Asymmetric {
                id: record.id().clone(),
                differences,
            });
        }
    }
    issues
}
