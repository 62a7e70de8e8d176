//! Convenience macros for defining records.

/// Build a [`MigrationRecord`](crate::MigrationRecord) made of raw SQL statements.
///
/// Structured [`SchemaOperation`](crate::SchemaOperation)s are translated for every provider and
/// should be preferred; this macro is for data fix-ups and engine features the operations don't
/// cover.
///
/// # Basic Usage
///
/// ```
/// use schemalog::sql_migration;
///
/// let record = sql_migration!("20240101000000_CreateUsers",
///     up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
///     down: "DROP TABLE users"
/// );
/// assert!(record.is_reversible());
/// ```
///
/// # Multiple Statements
///
/// ```
/// use schemalog::sql_migration;
///
/// let record = sql_migration!("20240101000000_InitialSchema",
///     up: [
///         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
///         "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT)",
///     ],
///     down: [
///         "DROP TABLE posts",
///         "DROP TABLE users",
///     ]
/// );
/// assert_eq!(record.up_operations().len(), 2);
/// ```
///
/// # Irreversible Records
///
/// Omitting `down` declares the record irreversible; rolling back across it is refused.
///
/// ```
/// use schemalog::sql_migration;
///
/// let record = sql_migration!("20240101000000_PurgeHistory",
///     up: "DELETE FROM history"
/// );
/// assert!(!record.is_reversible());
/// ```
///
/// # Provider-Specific SQL
///
/// Each statement only runs against its provider:
///
/// ```
/// use schemalog::sql_migration;
///
/// let record = sql_migration!("20240101000000_CreateUsers",
///     sqlite_up: "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)",
///     sqlite_down: "DROP TABLE users",
///     postgres_up: "CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT)",
///     postgres_down: "DROP TABLE users",
///     mysql_up: "CREATE TABLE users (id INT PRIMARY KEY AUTO_INCREMENT, name VARCHAR(255))",
///     mysql_down: "DROP TABLE users"
/// );
/// assert_eq!(record.up_operations().len(), 3);
/// ```
#[macro_export]
macro_rules! sql_migration {
    ($id:expr,
        up: [$($up_sql:expr),* $(,)?],
        down: [$($down_sql:expr),* $(,)?] $(,)?
    ) => {
        $crate::MigrationRecord::new($id)
            .up(vec![$($crate::SchemaOperation::sql($up_sql)),*])
            .down(vec![$($crate::SchemaOperation::sql($down_sql)),*])
    };

    ($id:expr,
        up: $up_sql:expr,
        down: $down_sql:expr $(,)?
    ) => {
        $crate::sql_migration!($id, up: [$up_sql], down: [$down_sql])
    };

    ($id:expr,
        up: [$($up_sql:expr),* $(,)?] $(,)?
    ) => {
        $crate::MigrationRecord::new($id)
            .up(vec![$($crate::SchemaOperation::sql($up_sql)),*])
            .irreversible()
    };

    ($id:expr,
        up: $up_sql:expr $(,)?
    ) => {
        $crate::sql_migration!($id, up: [$up_sql])
    };

    ($id:expr,
        sqlite_up: $sqlite_up:expr,
        sqlite_down: $sqlite_down:expr,
        postgres_up: $postgres_up:expr,
        postgres_down: $postgres_down:expr,
        mysql_up: $mysql_up:expr,
        mysql_down: $mysql_down:expr $(,)?
    ) => {
        $crate::MigrationRecord::new($id)
            .up(vec![
                $crate::SchemaOperation::sql_for(&[$crate::Provider::Sqlite], $sqlite_up),
                $crate::SchemaOperation::sql_for(&[$crate::Provider::Postgres], $postgres_up),
                $crate::SchemaOperation::sql_for(&[$crate::Provider::MySql], $mysql_up),
            ])
            .down(vec![
                $crate::SchemaOperation::sql_for(&[$crate::Provider::Sqlite], $sqlite_down),
                $crate::SchemaOperation::sql_for(&[$crate::Provider::Postgres], $postgres_down),
                $crate::SchemaOperation::sql_for(&[$crate::Provider::MySql], $mysql_down),
            ])
    };
}

#[cfg(test)]
mod tests {
    use crate::{Direction, Interpreter, Provider, SchemaOperation};

    #[test]
    fn single_statements() {
        let record = sql_migration!("20240101000000_CreateUsers",
            up: "CREATE TABLE users (id INTEGER)",
            down: "DROP TABLE users"
        );
        assert_eq!(record.id().as_str(), "20240101000000_CreateUsers");
        assert_eq!(
            record.up_operations(),
            &[SchemaOperation::sql("CREATE TABLE users (id INTEGER)")]
        );
        assert_eq!(
            record.down_operations(),
            Some(&[SchemaOperation::sql("DROP TABLE users")][..])
        );
    }

    #[test]
    fn trailing_commas_are_accepted() {
        let record = sql_migration!("20240101000000_Schema",
            up: ["CREATE TABLE a (id INTEGER)", "CREATE TABLE b (id INTEGER)",],
            down: ["DROP TABLE b", "DROP TABLE a",],
        );
        assert_eq!(record.up_operations().len(), 2);
        assert_eq!(record.down_operations().map(<[_]>::len), Some(2));
    }

    #[test]
    fn omitted_down_is_irreversible() {
        let record = sql_migration!("20240101000000_Purge", up: "DELETE FROM history");
        assert!(!record.is_reversible());
    }

    #[test]
    fn provider_specific_statements_only_render_for_their_provider() {
        let record = sql_migration!("20240101000000_CreateUsers",
            sqlite_up: "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT)",
            sqlite_down: "DROP TABLE users",
            postgres_up: "CREATE TABLE users (id SERIAL PRIMARY KEY)",
            postgres_down: "DROP TABLE users",
            mysql_up: "CREATE TABLE users (id INT PRIMARY KEY AUTO_INCREMENT)",
            mysql_down: "DROP TABLE users"
        );
        let script = Interpreter::new(Provider::Postgres)
            .script([&record], Direction::Up)
            .unwrap();
        assert_eq!(
            script,
            "-- 20240101000000_CreateUsers (up)\nCREATE TABLE users (id SERIAL PRIMARY KEY);\n\n"
        );
    }

    #[test]
    #[cfg(feature = "sqlite")]
    fn records_run_through_the_migrator() {
        let migrator = crate::Migrator::new(vec![
            sql_migration!("20240101000000_CreateUsers",
                up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
                down: "DROP TABLE users"
            ),
            sql_migration!("20240102000000_SeedUsers",
                up: "INSERT INTO users (id, name) VALUES (1, 'admin')"
            ),
        ]);
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        migrator.apply(&mut conn).unwrap().into_result().unwrap();

        let name: String = conn
            .query_row("SELECT name FROM users WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "admin");
        assert!(matches!(
            migrator.rollback_to(&mut conn, None),
            Err(crate::Error::Irreversible(_))
        ));
    }
}
