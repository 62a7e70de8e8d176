//! Translation of [SchemaOperation]s into provider specific SQL.
//!
//! Translation is pure: the same operation and [ProviderContext] always produce the same
//! statements, and nothing touches a database. The runner translates a whole record with
//! [Interpreter::plan] before executing any of it, so an operation the provider cannot express
//! fails the record before its transaction opens.

use crate::core::{Direction, MigrationRecord};
use crate::error::Error;
use crate::operation::{
    AlterColumn, ColumnDef, ColumnType, CreateTable, DefaultValue, ForeignKeyDef,
    IdentityStrategy, IndexDef, ReferentialAction, SchemaOperation,
};
use crate::provider::{Capability, Provider, ProviderContext};

/// One executable SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    /// Whether the statement can run inside the record's transaction. Statements that can't are
    /// executed on their own after committing whatever ran before them.
    pub transactional: bool,
}

/// A [Statement] tagged with the index of the top-level operation it was translated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStatement {
    pub operation_index: usize,
    pub statement: Statement,
}

/// Translates operations for one [ProviderContext].
#[derive(Debug, Clone, Copy)]
pub struct Interpreter {
    ctx: ProviderContext,
}

impl Interpreter {
    pub fn new(ctx: impl Into<ProviderContext>) -> Self {
        Self { ctx: ctx.into() }
    }

    pub fn context(&self) -> &ProviderContext {
        &self.ctx
    }

    fn provider(&self) -> Provider {
        self.ctx.provider()
    }

    /// Translate a single operation. Raw statements and conditional blocks whose condition does
    /// not hold translate to nothing.
    pub fn translate(&self, operation: &SchemaOperation) -> Result<Vec<Statement>, Error> {
        let mut out = Vec::new();
        self.translate_into(operation, &mut out)?;
        Ok(out)
    }

    /// Translate a list of operations, keeping track of which operation each statement belongs to.
    pub fn plan(&self, operations: &[SchemaOperation]) -> Result<Vec<PlannedStatement>, Error> {
        let mut planned = Vec::new();
        for (operation_index, operation) in operations.iter().enumerate() {
            for statement in self.translate(operation)? {
                planned.push(PlannedStatement {
                    operation_index,
                    statement,
                });
            }
        }
        Ok(planned)
    }

    /// Render the SQL for one side of a sequence of records without executing it.
    ///
    /// Records are rendered in the order given; for a rollback script pass them newest first.
    pub fn script<'r>(
        &self,
        records: impl IntoIterator<Item = &'r MigrationRecord>,
        direction: Direction,
    ) -> Result<String, Error> {
        let mut script = String::new();
        for record in records {
            self.script_record(&mut script, record, direction)?;
            script.push('\n');
        }
        Ok(script)
    }

    pub(crate) fn script_record(
        &self,
        script: &mut String,
        record: &MigrationRecord,
        direction: Direction,
    ) -> Result<(), Error> {
        script.push_str(&format!("-- {} ({})\n", record.id(), direction));
        for planned in self.plan(record.operations(direction)?)? {
            if !planned.statement.transactional {
                script.push_str("-- runs outside the migration transaction\n");
            }
            self.push_statement(script, &planned.statement.sql);
        }
        Ok(())
    }

    pub(crate) fn push_statement(&self, script: &mut String, sql: &str) {
        script.push_str(sql.trim_end());
        if !sql.trim_end().ends_with(';') {
            script.push(';');
        }
        script.push('\n');
        if self.provider() == Provider::SqlServer {
            script.push_str("GO\n");
        }
    }

    fn translate_into(
        &self,
        operation: &SchemaOperation,
        out: &mut Vec<Statement>,
    ) -> Result<(), Error> {
        match operation {
            SchemaOperation::CreateTable(table) => self.create_table(table, out),
            SchemaOperation::DropTable { name } => {
                out.push(self.ddl(format!("DROP TABLE {}", self.quote(name))));
                Ok(())
            }
            SchemaOperation::AddColumn { table, column } => {
                let definition = self.column_definition(column, "AddColumn")?;
                let sql = match self.provider() {
                    Provider::Sqlite => {
                        format!("ALTER TABLE {} ADD COLUMN {}", self.quote(table), definition)
                    }
                    _ => format!("ALTER TABLE {} ADD {}", self.quote(table), definition),
                };
                out.push(self.ddl(sql));
                Ok(())
            }
            SchemaOperation::DropColumn { table, name } => {
                self.require(Capability::DropColumn, "DropColumn", "columns cannot be dropped")?;
                if self.provider() == Provider::SqlServer {
                    out.push(self.ddl(self.drop_default_constraint(table, name)));
                }
                out.push(self.ddl(format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    self.quote(table),
                    self.quote(name)
                )));
                Ok(())
            }
            SchemaOperation::AlterColumn(alter) => self.alter_column(alter, out),
            SchemaOperation::CreateIndex(index) => self.create_index(index, out),
            SchemaOperation::DropIndex { table, name } => {
                let sql = match self.provider() {
                    Provider::Postgres | Provider::Sqlite => {
                        format!("DROP INDEX {}", self.quote(name))
                    }
                    Provider::MySql | Provider::SqlServer => {
                        format!("DROP INDEX {} ON {}", self.quote(name), self.quote(table))
                    }
                };
                out.push(self.ddl(sql));
                Ok(())
            }
            SchemaOperation::AddForeignKey(foreign_key) => {
                self.require(
                    Capability::ForeignKeyConstraints,
                    "AddForeignKey",
                    "foreign keys can only be declared when the table is created",
                )?;
                out.push(self.ddl(format!(
                    "ALTER TABLE {} ADD {}",
                    self.quote(&foreign_key.table),
                    self.foreign_key_constraint(foreign_key)
                )));
                Ok(())
            }
            SchemaOperation::DropForeignKey { table, name } => {
                self.require(
                    Capability::ForeignKeyConstraints,
                    "DropForeignKey",
                    "foreign keys cannot be dropped without rebuilding the table",
                )?;
                let sql = match self.provider() {
                    Provider::MySql => format!(
                        "ALTER TABLE {} DROP FOREIGN KEY {}",
                        self.quote(table),
                        self.quote(name)
                    ),
                    _ => format!(
                        "ALTER TABLE {} DROP CONSTRAINT {}",
                        self.quote(table),
                        self.quote(name)
                    ),
                };
                out.push(self.ddl(sql));
                Ok(())
            }
            SchemaOperation::AddPrimaryKey {
                table,
                name,
                columns,
            } => {
                self.require(
                    Capability::PrimaryKeyConstraints,
                    "AddPrimaryKey",
                    "primary keys can only be declared when the table is created",
                )?;
                out.push(self.ddl(format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                    self.quote(table),
                    self.quote(name),
                    self.quote_list(columns)
                )));
                Ok(())
            }
            SchemaOperation::DropPrimaryKey { table, name } => {
                self.require(
                    Capability::PrimaryKeyConstraints,
                    "DropPrimaryKey",
                    "primary keys cannot be dropped without rebuilding the table",
                )?;
                let sql = match self.provider() {
                    Provider::MySql => format!("ALTER TABLE {} DROP PRIMARY KEY", self.quote(table)),
                    _ => format!(
                        "ALTER TABLE {} DROP CONSTRAINT {}",
                        self.quote(table),
                        self.quote(name)
                    ),
                };
                out.push(self.ddl(sql));
                Ok(())
            }
            SchemaOperation::RenameTable { name, new_name } => {
                let sql = match self.provider() {
                    Provider::SqlServer => format!(
                        "EXEC sp_rename {}, {}",
                        self.string_literal(&self.quote(name)),
                        self.string_literal(new_name)
                    ),
                    Provider::MySql => format!(
                        "ALTER TABLE {} RENAME {}",
                        self.quote(name),
                        self.quote(new_name)
                    ),
                    _ => format!(
                        "ALTER TABLE {} RENAME TO {}",
                        self.quote(name),
                        self.quote(new_name)
                    ),
                };
                out.push(self.ddl(sql));
                Ok(())
            }
            SchemaOperation::RenameColumn {
                table,
                name,
                new_name,
            } => {
                self.require(Capability::RenameColumn, "RenameColumn", "columns cannot be renamed")?;
                let sql = match self.provider() {
                    Provider::SqlServer => format!(
                        "EXEC sp_rename {}, {}, N'COLUMN'",
                        self.string_literal(&format!("{}.{}", self.quote(table), self.quote(name))),
                        self.string_literal(new_name)
                    ),
                    _ => format!(
                        "ALTER TABLE {} RENAME COLUMN {} TO {}",
                        self.quote(table),
                        self.quote(name),
                        self.quote(new_name)
                    ),
                };
                out.push(self.ddl(sql));
                Ok(())
            }
            SchemaOperation::RenameIndex {
                table,
                name,
                new_name,
            } => {
                self.require(
                    Capability::RenameIndex,
                    "RenameIndex",
                    "indexes cannot be renamed; drop and recreate the index instead",
                )?;
                let sql = match self.provider() {
                    Provider::SqlServer => format!(
                        "EXEC sp_rename {}, {}, N'INDEX'",
                        self.string_literal(&format!("{}.{}", self.quote(table), self.quote(name))),
                        self.string_literal(new_name)
                    ),
                    Provider::MySql => format!(
                        "ALTER TABLE {} RENAME INDEX {} TO {}",
                        self.quote(table),
                        self.quote(name),
                        self.quote(new_name)
                    ),
                    _ => format!(
                        "ALTER INDEX {} RENAME TO {}",
                        self.quote(name),
                        self.quote(new_name)
                    ),
                };
                out.push(self.ddl(sql));
                Ok(())
            }
            SchemaOperation::Sql(raw) => {
                if raw.when.as_ref().map_or(true, |when| when.holds(&self.ctx)) {
                    out.push(Statement {
                        sql: raw.sql.clone(),
                        transactional: !raw.suppress_transaction,
                    });
                }
                Ok(())
            }
            SchemaOperation::Conditional {
                when,
                then,
                otherwise,
            } => {
                let branch = if when.holds(&self.ctx) { then } else { otherwise };
                for operation in branch {
                    self.translate_into(operation, out)?;
                }
                Ok(())
            }
        }
    }

    fn create_table(&self, table: &CreateTable, out: &mut Vec<Statement>) -> Result<(), Error> {
        // SQLite only generates keys for an `INTEGER PRIMARY KEY` column, declared inline.
        let inline_key = match (&table.primary_key, self.provider()) {
            (Some(key), Provider::Sqlite) if key.columns.len() == 1 => table
                .columns
                .iter()
                .find(|c| c.name == key.columns[0] && c.identity.is_generated())
                .map(|c| (key, c)),
            _ => None,
        };

        let mut elements = Vec::new();
        for column in &table.columns {
            match inline_key {
                Some((key, key_column)) if key_column.name == column.name => {
                    elements.push(format!(
                        "{} INTEGER NOT NULL CONSTRAINT {} PRIMARY KEY AUTOINCREMENT",
                        self.quote(&column.name),
                        self.quote(&key.name)
                    ));
                }
                _ => elements.push(self.column_definition(column, "CreateTable")?),
            }
        }
        if let Some(key) = &table.primary_key {
            if inline_key.is_none() {
                elements.push(format!(
                    "CONSTRAINT {} PRIMARY KEY ({})",
                    self.quote(&key.name),
                    self.quote_list(&key.columns)
                ));
            }
        }
        for foreign_key in &table.foreign_keys {
            elements.push(self.foreign_key_constraint(foreign_key));
        }

        out.push(self.ddl(format!(
            "CREATE TABLE {} ({})",
            self.quote(&table.name),
            elements.join(", ")
        )));
        Ok(())
    }

    fn create_index(&self, index: &IndexDef, out: &mut Vec<Statement>) -> Result<(), Error> {
        let mut sql = format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote(&index.name),
            self.quote(&index.table),
            self.quote_list(&index.columns)
        );
        if let Some(filter) = &index.filter {
            self.require(
                Capability::FilteredIndexes,
                "CreateIndex",
                "filtered indexes are not available",
            )?;
            sql.push_str(&format!(" WHERE {}", filter));
        }
        out.push(self.ddl(sql));
        Ok(())
    }

    fn alter_column(&self, alter: &AlterColumn, out: &mut Vec<Statement>) -> Result<(), Error> {
        let changes = alter.changes();
        if changes.is_empty() {
            return Ok(());
        }
        self.require(
            Capability::AlterColumn,
            "AlterColumn",
            "columns cannot be altered in place; rebuild the table with raw SQL",
        )?;
        if alter.is_narrowing() && alter.cast.is_none() {
            return Err(Error::LossyConversion {
                table: alter.table.clone(),
                column: alter.name.clone(),
                from: alter.old.describe(),
                to: alter.column.describe(),
            });
        }
        if changes.identity {
            self.require(
                Capability::IdentityConversion,
                "AlterColumn",
                "an existing column cannot switch between manual and generated keys",
            )?;
        }

        let table = self.quote(&alter.table);
        let column = self.quote(&alter.name);
        match self.provider() {
            Provider::Postgres => {
                let alter_prefix = format!("ALTER TABLE {} ALTER COLUMN {}", table, column);
                match alter.old.identity {
                    IdentityStrategy::Identity if changes.identity => {
                        out.push(self.ddl(format!("{} DROP IDENTITY IF EXISTS", alter_prefix)));
                    }
                    IdentityStrategy::Serial if changes.identity => {
                        out.push(self.ddl(format!("{} DROP DEFAULT", alter_prefix)));
                        out.push(self.ddl(format!(
                            "DROP SEQUENCE IF EXISTS {}",
                            self.quote(&sequence_name(&alter.table, &alter.name))
                        )));
                    }
                    _ => {}
                }
                if changes.storage() {
                    let mut sql = format!(
                        "{} TYPE {}",
                        alter_prefix,
                        self.column_type(&alter.column)
                    );
                    if let Some(cast) = &alter.cast {
                        self.require(
                            Capability::UsingCast,
                            "AlterColumn",
                            "conversions with USING are not available",
                        )?;
                        sql.push_str(&format!(" USING {}", cast));
                    }
                    out.push(self.ddl(sql));
                }
                if changes.nullability {
                    let action = if alter.column.nullable {
                        "DROP NOT NULL"
                    } else {
                        "SET NOT NULL"
                    };
                    out.push(self.ddl(format!("{} {}", alter_prefix, action)));
                }
                if changes.default && alter.column.identity != IdentityStrategy::Serial {
                    let sql = match &alter.column.default {
                        Some(default) => {
                            format!("{} SET DEFAULT {}", alter_prefix, self.default_literal(default))
                        }
                        None => format!("{} DROP DEFAULT", alter_prefix),
                    };
                    out.push(self.ddl(sql));
                }
                if changes.identity {
                    match alter.column.identity {
                        IdentityStrategy::Identity => {
                            out.push(self.ddl(format!(
                                "{} ADD GENERATED BY DEFAULT AS IDENTITY",
                                alter_prefix
                            )));
                            out.push(self.resume_sequence(
                                &format!(
                                    "pg_get_serial_sequence({}, {})",
                                    self.string_literal(&table),
                                    self.string_literal(&alter.name)
                                ),
                                &alter.table,
                                &alter.name,
                            ));
                        }
                        IdentityStrategy::Serial => {
                            self.require(
                                Capability::SequenceColumns,
                                "AlterColumn",
                                "sequence-backed columns are not available",
                            )?;
                            let sequence = self.quote(&sequence_name(&alter.table, &alter.name));
                            out.push(self.ddl(format!("CREATE SEQUENCE {}", sequence)));
                            out.push(self.ddl(format!(
                                "ALTER SEQUENCE {} OWNED BY {}.{}",
                                sequence, table, column
                            )));
                            out.push(self.ddl(format!(
                                "{} SET DEFAULT nextval({})",
                                alter_prefix,
                                self.string_literal(&sequence)
                            )));
                            out.push(self.resume_sequence(
                                &self.string_literal(&sequence),
                                &alter.table,
                                &alter.name,
                            ));
                        }
                        IdentityStrategy::None => {}
                    }
                }
            }
            Provider::MySql => {
                if let Some(cast) = &alter.cast {
                    out.push(self.dml(format!("UPDATE {} SET {} = {}", table, column, cast)));
                }
                // MODIFY restates the whole column; AUTO_INCREMENT continues after the current maximum.
                out.push(self.ddl(format!(
                    "ALTER TABLE {} MODIFY COLUMN {}",
                    table,
                    self.column_definition(&alter.column, "AlterColumn")?
                )));
            }
            Provider::SqlServer => {
                if let Some(cast) = &alter.cast {
                    out.push(self.dml(format!("UPDATE {} SET {} = {}", table, column, cast)));
                }
                if changes.default {
                    out.push(self.ddl(self.drop_default_constraint(&alter.table, &alter.name)));
                }
                if changes.storage() || changes.nullability {
                    out.push(self.ddl(format!(
                        "ALTER TABLE {} ALTER COLUMN {} {}{}",
                        table,
                        column,
                        self.column_type(&alter.column),
                        if alter.column.nullable { " NULL" } else { " NOT NULL" }
                    )));
                }
                if let (true, Some(default)) = (changes.default, &alter.column.default) {
                    out.push(self.ddl(format!(
                        "ALTER TABLE {} ADD DEFAULT {} FOR {}",
                        table,
                        self.default_literal(default),
                        column
                    )));
                }
            }
            Provider::Sqlite => {
                return Err(self.unsupported(
                    "AlterColumn",
                    "columns cannot be altered in place; rebuild the table with raw SQL",
                ))
            }
        }
        Ok(())
    }

    /// Point a sequence past the largest existing key so existing rows keep their values.
    fn resume_sequence(&self, sequence_expr: &str, table: &str, column: &str) -> Statement {
        self.dml(format!(
            "SELECT setval({}, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
            sequence_expr,
            self.quote(column),
            self.quote(table)
        ))
    }

    /// SQL Server names default constraints itself, so look the name up before dropping it.
    fn drop_default_constraint(&self, table: &str, column: &str) -> String {
        let quoted_table = self.quote(table);
        format!(
            "DECLARE @default sysname;\n\
             SELECT @default = [d].[name] FROM [sys].[default_constraints] [d] \
             INNER JOIN [sys].[columns] [c] ON [d].[parent_column_id] = [c].[column_id] AND [d].[parent_object_id] = [c].[object_id] \
             WHERE ([d].[parent_object_id] = OBJECT_ID({}) AND [c].[name] = {});\n\
             IF @default IS NOT NULL EXEC(N'ALTER TABLE {} DROP CONSTRAINT [' + @default + '];');",
            self.string_literal(&quoted_table),
            self.string_literal(column),
            quoted_table.replace('\'', "''")
        )
    }

    fn foreign_key_constraint(&self, foreign_key: &ForeignKeyDef) -> String {
        let on_delete = match (self.provider(), foreign_key.on_delete) {
            (Provider::SqlServer, ReferentialAction::Restrict) => ReferentialAction::NoAction,
            (_, action) => action,
        };
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            self.quote(&foreign_key.name),
            self.quote_list(&foreign_key.columns),
            self.quote(&foreign_key.principal_table),
            self.quote_list(&foreign_key.principal_columns),
            on_delete.as_sql()
        )
    }

    fn column_definition(&self, column: &ColumnDef, operation: &'static str) -> Result<String, Error> {
        let mut sql = format!("{} ", self.quote(&column.name));
        match (self.provider(), column.identity) {
            (_, IdentityStrategy::None) => sql.push_str(&self.column_type(column)),
            (Provider::Sqlite, _) => {
                return Err(self.unsupported(
                    operation,
                    "generated keys are only available on a single-column INTEGER primary key declared with the table",
                ))
            }
            (Provider::Postgres, IdentityStrategy::Serial) => {
                let serial = match column.column_type {
                    ColumnType::SmallInt => "smallserial",
                    ColumnType::Int => "serial",
                    ColumnType::BigInt => "bigserial",
                    _ => {
                        return Err(self.unsupported(
                            operation,
                            "serial columns must be small_int, int or big_int",
                        ))
                    }
                };
                sql.push_str(serial);
            }
            (Provider::Postgres, IdentityStrategy::Identity) => {
                sql.push_str(&self.column_type(column));
                sql.push_str(" GENERATED BY DEFAULT AS IDENTITY");
            }
            (Provider::SqlServer, _) => {
                sql.push_str(&self.column_type(column));
                sql.push_str(" IDENTITY(1,1)");
            }
            (Provider::MySql, _) => sql.push_str(&self.column_type(column)),
        }
        sql.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
        if let Some(default) = &column.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&self.default_literal(default));
        }
        if self.provider() == Provider::MySql && column.identity.is_generated() {
            sql.push_str(" AUTO_INCREMENT");
        }
        Ok(sql)
    }

    /// The provider's type for a column, without identity decoration.
    pub fn column_type(&self, column: &ColumnDef) -> String {
        let length = column.max_length;
        match self.provider() {
            Provider::Postgres => match &column.column_type {
                ColumnType::Boolean => "boolean".to_string(),
                ColumnType::SmallInt => "smallint".to_string(),
                ColumnType::Int => "integer".to_string(),
                ColumnType::BigInt => "bigint".to_string(),
                ColumnType::Decimal { precision, scale } => {
                    format!("numeric({},{})", precision, scale)
                }
                ColumnType::Real => "real".to_string(),
                ColumnType::Double => "double precision".to_string(),
                ColumnType::String => match length {
                    Some(n) => format!("character varying({})", n),
                    None => "text".to_string(),
                },
                ColumnType::Date => "date".to_string(),
                ColumnType::DateTime => "timestamp without time zone".to_string(),
                ColumnType::DateTimeOffset => "timestamp with time zone".to_string(),
                ColumnType::Guid => "uuid".to_string(),
                ColumnType::Binary => "bytea".to_string(),
                ColumnType::Custom(name) => name.clone(),
            },
            Provider::Sqlite => match &column.column_type {
                ColumnType::Boolean
                | ColumnType::SmallInt
                | ColumnType::Int
                | ColumnType::BigInt => "INTEGER".to_string(),
                ColumnType::Real | ColumnType::Double => "REAL".to_string(),
                ColumnType::Binary => "BLOB".to_string(),
                ColumnType::Custom(name) => name.clone(),
                _ => "TEXT".to_string(),
            },
            Provider::MySql => match &column.column_type {
                ColumnType::Boolean => "tinyint(1)".to_string(),
                ColumnType::SmallInt => "smallint".to_string(),
                ColumnType::Int => "int".to_string(),
                ColumnType::BigInt => "bigint".to_string(),
                ColumnType::Decimal { precision, scale } => {
                    format!("decimal({},{})", precision, scale)
                }
                ColumnType::Real => "float".to_string(),
                ColumnType::Double => "double".to_string(),
                ColumnType::String => match length {
                    Some(n) => format!("varchar({})", n),
                    None => "longtext".to_string(),
                },
                ColumnType::Date => "date".to_string(),
                ColumnType::DateTime | ColumnType::DateTimeOffset => "datetime(6)".to_string(),
                ColumnType::Guid => "char(36)".to_string(),
                ColumnType::Binary => match length {
                    Some(n) => format!("varbinary({})", n),
                    None => "longblob".to_string(),
                },
                ColumnType::Custom(name) => name.clone(),
            },
            Provider::SqlServer => match &column.column_type {
                ColumnType::Boolean => "bit".to_string(),
                ColumnType::SmallInt => "smallint".to_string(),
                ColumnType::Int => "int".to_string(),
                ColumnType::BigInt => "bigint".to_string(),
                ColumnType::Decimal { precision, scale } => {
                    format!("decimal({},{})", precision, scale)
                }
                ColumnType::Real => "real".to_string(),
                ColumnType::Double => "float".to_string(),
                ColumnType::String => match length {
                    Some(n) => format!("nvarchar({})", n),
                    None => "nvarchar(max)".to_string(),
                },
                ColumnType::Date => "date".to_string(),
                ColumnType::DateTime => "datetime2".to_string(),
                ColumnType::DateTimeOffset => "datetimeoffset".to_string(),
                ColumnType::Guid => "uniqueidentifier".to_string(),
                ColumnType::Binary => match length {
                    Some(n) => format!("varbinary({})", n),
                    None => "varbinary(max)".to_string(),
                },
                ColumnType::Custom(name) => name.clone(),
            },
        }
    }

    fn default_literal(&self, default: &DefaultValue) -> String {
        match default {
            DefaultValue::Bool(value) => match self.provider() {
                Provider::Postgres => (if *value { "TRUE" } else { "FALSE" }).to_string(),
                _ => (if *value { "1" } else { "0" }).to_string(),
            },
            DefaultValue::Integer(value) => value.to_string(),
            DefaultValue::String(value) => self.string_literal(value),
            DefaultValue::Expression(expression) => expression.clone(),
        }
    }

    /// Quote an identifier, doubling any embedded delimiter.
    pub fn quote(&self, identifier: &str) -> String {
        match self.provider() {
            Provider::Postgres | Provider::Sqlite => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
            Provider::MySql => format!("`{}`", identifier.replace('`', "``")),
            Provider::SqlServer => format!("[{}]", identifier.replace(']', "]]")),
        }
    }

    fn quote_list(&self, identifiers: &[String]) -> String {
        identifiers
            .iter()
            .map(|identifier| self.quote(identifier))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn string_literal(&self, value: &str) -> String {
        let escaped = value.replace('\'', "''");
        match self.provider() {
            Provider::SqlServer => format!("N'{}'", escaped),
            Provider::MySql => format!("'{}'", escaped.replace('\\', "\\\\")),
            _ => format!("'{}'", escaped),
        }
    }

    /// DDL creating the ledger table if it is missing.
    pub(crate) fn ledger_create_sql(&self, ledger: &str) -> String {
        let text = match self.provider() {
            Provider::Sqlite => "TEXT",
            Provider::SqlServer => "nvarchar(150)",
            Provider::Postgres => "character varying(150)",
            Provider::MySql => "varchar(150)",
        };
        let columns = ["migration_id", "applied_at", "checksum", "product_version"]
            .iter()
            .map(|column| format!("{} {} NOT NULL", self.quote(column), text))
            .collect::<Vec<_>>()
            .join(", ");
        let body = format!(
            "{} ({}, CONSTRAINT {} PRIMARY KEY ({}))",
            self.quote(ledger),
            columns,
            self.quote(&format!("PK_{}", ledger)),
            self.quote("migration_id")
        );
        match self.provider() {
            Provider::SqlServer => format!(
                "IF OBJECT_ID({}) IS NULL BEGIN CREATE TABLE {} END",
                self.string_literal(&self.quote(ledger)),
                body
            ),
            _ => format!("CREATE TABLE IF NOT EXISTS {}", body),
        }
    }

    /// Ledger insert with inline values, used by deployment scripts.
    pub(crate) fn ledger_insert_sql(
        &self,
        ledger: &str,
        record: &MigrationRecord,
        applied_at: &str,
        product_version: &str,
    ) -> String {
        format!(
            "INSERT INTO {} ({}, {}, {}, {}) VALUES ({}, {}, {}, {})",
            self.quote(ledger),
            self.quote("migration_id"),
            self.quote("applied_at"),
            self.quote("checksum"),
            self.quote("product_version"),
            self.string_literal(record.id().as_str()),
            self.string_literal(applied_at),
            self.string_literal(&record.checksum()),
            self.string_literal(product_version)
        )
    }

    pub(crate) fn ledger_delete_sql(&self, ledger: &str, record: &MigrationRecord) -> String {
        format!(
            "DELETE FROM {} WHERE {} = {}",
            self.quote(ledger),
            self.quote("migration_id"),
            self.string_literal(record.id().as_str())
        )
    }

    fn ddl(&self, sql: String) -> Statement {
        Statement {
            sql,
            transactional: self.ctx.supports(Capability::TransactionalDdl),
        }
    }

    fn dml(&self, sql: String) -> Statement {
        Statement {
            sql,
            transactional: true,
        }
    }

    fn require(
        &self,
        capability: Capability,
        operation: &'static str,
        detail: &str,
    ) -> Result<(), Error> {
        if self.ctx.supports(capability) {
            Ok(())
        } else {
            Err(self.unsupported(operation, detail))
        }
    }

    fn unsupported(&self, operation: &'static str, detail: &str) -> Error {
        Error::UnsupportedOperation {
            operation,
            provider: self.provider(),
            detail: detail.to_string(),
        }
    }
}

/// Name PostgreSQL gives the sequence behind a `serial` column.
fn sequence_name(table: &str, column: &str) -> String {
    format!("{}_{}_seq", table, column)
}
