//! Command line runner for schemalog ledgers.
//!
//! Records are loaded from a directory of record files (see [schemalog::loader]) and run
//! against the database named by `--database-url` or the environment.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use schemalog::{
    check_reversibility, loader, CancellationFlag, Direction, MigrationFailure, MigrationId, MigrationReport,
    Migrator, Provider, ProviderContext, Target,
};
use serde::Deserialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "schemalog.toml";
const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

#[derive(Parser, Debug)]
#[command(name = "schemalog", version, about = "Apply and roll back schema migration ledgers")]
pub struct CliArgs {
    /// Configuration file. A missing `schemalog.toml` is ignored; a missing explicit path is an error
    #[arg(long, global = true, env = "SCHEMALOG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database URL (defaults to the variable named by `database_url_env`, else DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Database provider: sqlite, postgres, mysql or sqlserver (script only)
    #[arg(long, global = true)]
    pub provider: Option<Provider>,

    /// Directory holding the record files
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Name of the ledger table
    #[arg(long, global = true)]
    pub ledger_table: Option<String>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Apply pending records
    Apply {
        /// Stop after this record
        #[arg(long)]
        to: Option<String>,
    },
    /// Roll back applied records
    Rollback {
        /// Roll back every record after this one
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        to: Option<String>,
        /// Roll back every applied record
        #[arg(long)]
        all: bool,
    },
    /// List records not yet applied
    Pending,
    /// Show the current record and counts
    Status,
    /// Show the ledger rows
    History,
    /// List the records (no database required)
    List,
    /// Print the SQL a run would execute (no database required)
    Script {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        /// Script the rollback from `--from` down to `--to`
        #[arg(long)]
        down: bool,
    },
    /// Validate the records and check that every down undoes its up (no database required)
    Check,
    /// Clear a run lock left behind by a crashed run
    Unlock,
}

/// Contents of `schemalog.toml`.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub provider: Option<Provider>,
    /// Environment variable holding the database URL
    pub database_url_env: Option<String>,
    /// Relative paths are resolved against the directory of the config file
    pub migrations_dir: Option<PathBuf>,
    pub ledger_table: Option<String>,
    pub lock_wait_timeout_secs: Option<u64>,
}

impl Config {
    /// Load the config at `path`, or `schemalog.toml` in the working directory when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !required && !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        if let (Some(dir), Some(base)) = (&config.migrations_dir, path.parent()) {
            if dir.is_relative() && !base.as_os_str().is_empty() {
                config.migrations_dir = Some(base.join(dir));
            }
        }
        Ok(config)
    }
}

/// Command line flags layered over the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub provider: Option<Provider>,
    pub database_url: Option<String>,
    pub migrations_dir: PathBuf,
    pub ledger_table: Option<String>,
    pub lock_wait_timeout: Option<Duration>,
}

impl Settings {
    pub fn resolve(args: &CliArgs, config: Config) -> Self {
        let database_url = args.database_url.clone().or_else(|| {
            let var = config
                .database_url_env
                .as_deref()
                .unwrap_or("DATABASE_URL");
            std::env::var(var).ok()
        });
        let provider = args
            .provider
            .or(config.provider)
            .or_else(|| database_url.as_deref().and_then(infer_provider));
        Settings {
            provider,
            database_url,
            migrations_dir: args
                .migrations_dir
                .clone()
                .or(config.migrations_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR)),
            ledger_table: args.ledger_table.clone().or(config.ledger_table),
            lock_wait_timeout: config.lock_wait_timeout_secs.map(Duration::from_secs),
        }
    }

    fn provider(&self) -> Result<Provider> {
        self.provider.ok_or_else(|| {
            anyhow!("no provider given; pass --provider, set it in the config file, or use a database URL with a scheme")
        })
    }

    fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("no database URL given; pass --database-url or set DATABASE_URL"))
    }
}

/// Guess the provider from a URL scheme.
pub fn infer_provider(url: &str) -> Option<Provider> {
    let scheme = url.split_once(':')?.0;
    match scheme {
        "sqlite" | "file" => Some(Provider::Sqlite),
        "postgres" | "postgresql" => Some(Provider::Postgres),
        "mysql" | "mariadb" => Some(Provider::MySql),
        _ => None,
    }
}

/// Load the records and build the migrator the settings describe.
pub fn build_migrator(settings: &Settings) -> Result<Migrator> {
    let records = loader::load_dir(&settings.migrations_dir).with_context(|| {
        format!(
            "loading records from {}",
            settings.migrations_dir.display()
        )
    })?;
    tracing::debug!(
        dir = %settings.migrations_dir.display(),
        count = records.len(),
        "Loaded records"
    );
    let mut migrator = Migrator::try_new(records).context("validating records")?;
    if let Some(ledger) = &settings.ledger_table {
        migrator = migrator.with_ledger_table_name(ledger.clone());
    }
    if let Some(timeout) = settings.lock_wait_timeout {
        migrator = migrator.with_lock_wait_timeout(timeout);
    }
    if let Some(provider) = settings.provider {
        migrator = migrator.with_provider_context(ProviderContext::new(provider));
    }
    Ok(migrator)
}

/// Connect to the database named by the settings.
pub fn connect(settings: &Settings) -> Result<Box<dyn Target>> {
    let provider = settings.provider()?;
    let url = settings.database_url()?;
    tracing::debug!(%provider, "Connecting to database");
    match provider {
        #[cfg(feature = "sqlite")]
        Provider::Sqlite => {
            let path = url
                .strip_prefix("sqlite://")
                .or_else(|| url.strip_prefix("sqlite:"))
                .or_else(|| url.strip_prefix("file:"))
                .unwrap_or(url);
            let conn = if path == ":memory:" {
                rusqlite::Connection::open_in_memory()
            } else {
                rusqlite::Connection::open(path)
            }
            .with_context(|| format!("opening SQLite database {}", path))?;
            Ok(Box::new(conn))
        }
        #[cfg(feature = "postgres")]
        Provider::Postgres => {
            let client = postgres::Client::connect(url, postgres::NoTls)
                .context("connecting to PostgreSQL")?;
            Ok(Box::new(client))
        }
        #[cfg(feature = "mysql")]
        Provider::MySql => {
            let opts = mysql::Opts::from_url(url).context("parsing MySQL URL")?;
            let conn = mysql::Conn::new(opts).context("connecting to MySQL")?;
            Ok(Box::new(conn))
        }
        Provider::SqlServer => {
            bail!("sqlserver is only supported for script generation")
        }
        #[allow(unreachable_patterns)]
        other => bail!("this build of schemalog was compiled without {} support", other),
    }
}

/// Install the `tracing` subscriber. `RUST_LOG` wins over `--verbose`.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Cancel `flag` on the first Ctrl-C so the run stops before its next record.
/// A second Ctrl-C exits at once.
pub fn cancel_on_ctrl_c(flag: CancellationFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting the signal listener")?;
    std::thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("Interrupted, stopping after the current record");
            flag.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        })
    });
    Ok(())
}

/// Run a parsed command, writing its output to `out`. Runs stop between records once
/// `cancellation` is cancelled.
pub fn run(args: CliArgs, cancellation: CancellationFlag, out: &mut impl Write) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let settings = Settings::resolve(&args, config);
    let migrator = build_migrator(&settings)?.with_cancellation(cancellation);

    match &args.command {
        Commands::List => list(&migrator, out),
        Commands::Check => check(&migrator, &settings, out),
        Commands::Script { from, to, down } => {
            let direction = if *down { Direction::Down } else { Direction::Up };
            let from = from.as_deref().map(MigrationId::new);
            let to = to.as_deref().map(MigrationId::new);
            let script = migrator
                .script(settings.provider()?, direction, from.as_ref(), to.as_ref())
                .context("generating script")?;
            write!(out, "{}", script)?;
            Ok(())
        }
        command => {
            let mut target = connect(&settings)?;
            run_against(&migrator, target.as_mut(), command, out)
        }
    }
}

/// Run a command that needs a live database.
pub fn run_against(
    migrator: &Migrator,
    target: &mut dyn Target,
    command: &Commands,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Commands::Apply { to } => {
            let report = match to {
                Some(to) => migrator.apply_to(target, &MigrationId::new(to.as_str())),
                None => migrator.apply(target),
            }
            .context("applying records")?;
            if report.ledger_created {
                writeln!(out, "Created ledger table {}", migrator.ledger_table_name())?;
            }
            finish(report, "Applied", out)
        }
        Commands::Rollback { to, .. } => {
            let to = to.as_deref().map(MigrationId::new);
            let report = migrator
                .rollback_to(target, to.as_ref())
                .context("rolling back records")?;
            finish(report, "Rolled back", out)
        }
        Commands::Pending => {
            let pending = migrator.pending(target)?;
            if pending.is_empty() {
                writeln!(out, "No pending records.")?;
            }
            for record in pending {
                writeln!(out, "{}", record.id())?;
            }
            Ok(())
        }
        Commands::Status => {
            let applied = migrator.history(target)?;
            let pending = migrator.pending(target)?;
            match applied.last() {
                Some(current) => writeln!(out, "Current: {}", current.id)?,
                None => writeln!(out, "Current: none")?,
            }
            writeln!(out, "Applied: {}", applied.len())?;
            writeln!(out, "Pending: {}", pending.len())?;
            Ok(())
        }
        Commands::History => {
            let applied = migrator.history(target)?;
            if applied.is_empty() {
                writeln!(out, "No records applied.")?;
            }
            for row in applied {
                writeln!(
                    out,
                    "{}  {}  {}  {}",
                    row.id,
                    row.applied_at.to_rfc3339(),
                    row.checksum.chars().take(12).collect::<String>(),
                    row.product_version
                )?;
            }
            Ok(())
        }
        Commands::Unlock => {
            if migrator.force_unlock(target)? {
                writeln!(out, "Cleared the run lock.")?;
            } else {
                writeln!(out, "No run lock to clear.")?;
            }
            Ok(())
        }
        Commands::List | Commands::Check | Commands::Script { .. } => {
            bail!("command does not use a database connection")
        }
    }
}

fn finish(report: MigrationReport<'_>, verb: &str, out: &mut impl Write) -> Result<()> {
    if report.migrations_run.is_empty() && report.failing_migration.is_none() {
        writeln!(out, "Nothing to do.")?;
    }
    for id in &report.migrations_run {
        writeln!(out, "{} {}", verb, id)?;
    }
    if report.cancelled {
        writeln!(out, "Cancelled before the next record.")?;
    }
    match report.failing_migration {
        Some(failure) => Err(failed(failure)),
        None if report.cancelled => bail!(
            "run cancelled after {} record(s)",
            report.migrations_run.len()
        ),
        None => Ok(()),
    }
}

fn failed(failure: MigrationFailure<'_>) -> anyhow::Error {
    let context = format!("record {} failed ({})", failure.id(), failure.direction());
    anyhow::Error::new(failure.into_error()).context(context)
}

fn list(migrator: &Migrator, out: &mut impl Write) -> Result<()> {
    let records = migrator.records();
    if records.is_empty() {
        writeln!(out, "No records defined.")?;
        return Ok(());
    }
    writeln!(out, "Defined records ({}):", records.len())?;
    for record in records {
        let marker = if record.is_reversible() { "" } else { " (irreversible)" };
        writeln!(out, "  {}{}", record.id(), marker)?;
        if let Some(description) = record.description() {
            writeln!(out, "      {}", description)?;
        }
    }
    Ok(())
}

fn check(migrator: &Migrator, settings: &Settings, out: &mut impl Write) -> Result<()> {
    let ctx = ProviderContext::new(settings.provider.unwrap_or(Provider::Postgres));
    let issues = check_reversibility(migrator.records(), &ctx);
    writeln!(
        out,
        "Checked {} records for {}.",
        migrator.records().len(),
        ctx.provider()
    )?;
    for issue in &issues {
        writeln!(out, "  {}", issue)?;
    }
    let asymmetric = issues
        .iter()
        .filter(|issue| matches!(issue, schemalog::ReversibilityIssue::Asymmetric { .. }))
        .count();
    if asymmetric > 0 {
        bail!("{} record(s) have a down that does not undo their up", asymmetric);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CREATE_FOO: &str = r#"
description = "Foo table"

[[up]]
op = "create_table"
name = "Foo"
columns = [{ name = "Id", type = "int", nullable = false }]
primary_key = { name = "PK_Foo", columns = ["Id"] }

[[down]]
op = "drop_table"
name = "Foo"
"#;

    const ADD_BAR: &str = r#"
[[up]]
op = "add_column"
table = "Foo"
column = { name = "Bar", type = "string" }

[[down]]
op = "drop_column"
table = "Foo"
name = "Bar"
"#;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let migrations = dir.path().join("migrations");
            fs::create_dir(&migrations).unwrap();
            fs::write(migrations.join("20240101000000_CreateFoo.toml"), CREATE_FOO).unwrap();
            fs::write(migrations.join("20240102000000_AddBar.toml"), ADD_BAR).unwrap();
            Fixture { dir }
        }

        fn run(&self, args: &[&str]) -> Result<String> {
            let (output, result) = self.run_with(args, CancellationFlag::new());
            result.map(|()| output)
        }

        fn run_with(&self, args: &[&str], cancellation: CancellationFlag) -> (String, Result<()>) {
            let db = format!("sqlite://{}", self.dir.path().join("app.db").display());
            let migrations = self.dir.path().join("migrations");
            let config = self.dir.path().join("none.toml");
            fs::write(&config, "").unwrap();
            let mut argv = vec![
                "schemalog".to_string(),
                "--config".to_string(),
                config.display().to_string(),
                "--database-url".to_string(),
                db,
                "--migrations-dir".to_string(),
                migrations.display().to_string(),
            ];
            argv.extend(args.iter().map(|a| a.to_string()));
            let mut out = Vec::new();
            let result = CliArgs::try_parse_from(argv)
                .map_err(anyhow::Error::from)
                .and_then(|args| run(args, cancellation, &mut out));
            (String::from_utf8(out).unwrap(), result)
        }

        fn db_path(&self) -> PathBuf {
            self.dir.path().join("app.db")
        }
    }

    #[test]
    fn apply_status_and_rollback() {
        let fixture = Fixture::new();
        let output = fixture.run(&["apply"]).unwrap();
        assert_eq!(
            output,
            "Created ledger table _schemalog_history_\nApplied 20240101000000_CreateFoo\nApplied 20240102000000_AddBar\n"
        );

        let status = fixture.run(&["status"]).unwrap();
        assert_eq!(
            status,
            "Current: 20240102000000_AddBar\nApplied: 2\nPending: 0\n"
        );

        let output = fixture
            .run(&["rollback", "--to", "20240101000000_CreateFoo"])
            .unwrap();
        assert_eq!(output, "Rolled back 20240102000000_AddBar\n");
        assert_eq!(
            fixture.run(&["pending"]).unwrap(),
            "20240102000000_AddBar\n"
        );

        let output = fixture.run(&["rollback", "--all"]).unwrap();
        assert_eq!(output, "Rolled back 20240101000000_CreateFoo\n");
        assert_eq!(fixture.run(&["history"]).unwrap(), "No records applied.\n");
    }

    #[test]
    fn apply_to_stops_at_the_target() {
        let fixture = Fixture::new();
        fixture
            .run(&["apply", "--to", "20240101000000_CreateFoo"])
            .unwrap();
        let history = fixture.run(&["history"]).unwrap();
        assert!(history.starts_with("20240101000000_CreateFoo  "));
        assert_eq!(history.lines().count(), 1);
        assert_eq!(fixture.run(&["apply"]).unwrap(), "Applied 20240102000000_AddBar\n");
        assert_eq!(fixture.run(&["apply"]).unwrap(), "Nothing to do.\n");
    }

    #[test]
    fn failing_record_is_named_in_the_error() {
        let fixture = Fixture::new();
        fs::write(
            fixture
                .dir
                .path()
                .join("migrations")
                .join("20240103000000_Broken.toml"),
            "irreversible = true\n[[up]]\nop = \"sql\"\nsql = \"INSERT INTO \\\"Missing\\\" VALUES (1)\"\n",
        )
        .unwrap();
        let error = fixture.run(&["apply"]).unwrap_err();
        assert!(format!("{:#}", error).contains("record 20240103000000_Broken failed"));
        assert_eq!(
            fixture.run(&["status"]).unwrap(),
            "Current: 20240102000000_AddBar\nApplied: 2\nPending: 1\n"
        );
    }

    #[test]
    fn cancelled_run_stops_before_the_next_record() {
        let fixture = Fixture::new();
        let cancellation = CancellationFlag::new();
        cancellation.cancel();
        let (output, result) = fixture.run_with(&["apply"], cancellation);
        assert!(output.contains("Cancelled before the next record."));
        assert!(result.unwrap_err().to_string().contains("cancelled"));
        assert_eq!(
            fixture.run(&["status"]).unwrap(),
            "Current: none\nApplied: 0\nPending: 2\n"
        );
    }

    #[test]
    fn history_tolerates_non_ascii_checksums() {
        let fixture = Fixture::new();
        fixture.run(&["apply", "--to", "20240101000000_CreateFoo"]).unwrap();
        let conn = rusqlite::Connection::open(fixture.db_path()).unwrap();
        conn.execute(
            "UPDATE \"_schemalog_history_\" SET checksum = ?1",
            [format!("x{}", "\u{e9}".repeat(20))],
        )
        .unwrap();

        let history = fixture.run(&["history"]).unwrap();
        assert!(history.contains(&format!("  x{}  ", "\u{e9}".repeat(11))));
    }

    #[test]
    fn list_and_script_need_no_database() {
        let fixture = Fixture::new();
        let listing = fixture.run(&["list"]).unwrap();
        assert_eq!(
            listing,
            "Defined records (2):\n  20240101000000_CreateFoo\n      Foo table\n  20240102000000_AddBar\n"
        );

        let script = fixture
            .run(&["--provider", "postgres", "script", "--from", "20240101000000_CreateFoo"])
            .unwrap();
        assert!(script.contains("-- 20240102000000_AddBar (up)"));
        assert!(script.contains(r#"ALTER TABLE "Foo" ADD "Bar" text NULL;"#));
        assert!(!script.contains("-- 20240101000000_CreateFoo (up)"));
    }

    #[test]
    fn check_reports_asymmetric_records() {
        let fixture = Fixture::new();
        assert!(fixture.run(&["check"]).is_ok());

        fs::write(
            fixture
                .dir
                .path()
                .join("migrations")
                .join("20240103000000_IndexBar.toml"),
            "down = []\n\n[[up]]\nop = \"create_index\"\ntable = \"Foo\"\nname = \"IX_Foo_Bar\"\ncolumns = [\"Bar\"]\n",
        )
        .unwrap();
        let error = fixture.run(&["check"]).unwrap_err();
        assert!(error.to_string().contains("1 record(s)"));
    }

    #[test]
    fn rollback_requires_a_target() {
        assert!(CliArgs::try_parse_from(["schemalog", "rollback"]).is_err());
        assert!(
            CliArgs::try_parse_from(["schemalog", "rollback", "--all", "--to", "x"]).is_err()
        );
        let args = CliArgs::try_parse_from(["schemalog", "rollback", "--all"]).unwrap();
        assert_eq!(args.command, Commands::Rollback { to: None, all: true });
    }

    #[test]
    fn config_file_fills_in_missing_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schemalog.toml");
        fs::write(
            &path,
            "provider = \"mysql\"\nmigrations_dir = \"db\"\nledger_table = \"history\"\nlock_wait_timeout_secs = 5\ndatabase_url_env = \"SCHEMALOG_TEST_UNSET_URL\"\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.migrations_dir, Some(dir.path().join("db")));

        let args = CliArgs::try_parse_from(["schemalog", "--ledger-table", "custom", "status"]).unwrap();
        let settings = Settings::resolve(&args, config);
        assert_eq!(
            settings,
            Settings {
                provider: Some(Provider::MySql),
                database_url: None,
                migrations_dir: dir.path().join("db"),
                ledger_table: Some("custom".to_string()),
                lock_wait_timeout: Some(Duration::from_secs(5)),
            }
        );
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn provider_is_inferred_from_the_url() {
        assert_eq!(infer_provider("postgres://localhost/app"), Some(Provider::Postgres));
        assert_eq!(infer_provider("mysql://root@localhost/app"), Some(Provider::MySql));
        assert_eq!(infer_provider("sqlite://app.db"), Some(Provider::Sqlite));
        assert_eq!(infer_provider("app.db"), None);
    }
}
