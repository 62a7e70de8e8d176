//! Provider identity and capability flags.
//!
//! Records never compare provider names. They test a [Capability] (or, for raw SQL written
//! against one engine, a provider list) through a [Condition](crate::Condition), and the
//! [Interpreter](crate::Interpreter) consults the same [Capabilities] to decide what it can emit.
//! Adding a provider means adding a capability set, not editing records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A relational engine a ledger can be replayed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Sqlite,
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    /// Script generation only; there is no live SQL Server target.
    #[serde(rename = "sqlserver")]
    SqlServer,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Sqlite,
        Provider::Postgres,
        Provider::MySql,
        Provider::SqlServer,
    ];

    /// The default capability set of this provider.
    pub fn capabilities(&self) -> Capabilities {
        use Capability::*;
        match self {
            Provider::Sqlite => Capabilities::from_iter([
                TransactionalDdl,
                DropColumn,
                RenameColumn,
                IdentityColumns,
                FilteredIndexes,
            ]),
            Provider::Postgres => Capabilities::from_iter([
                TransactionalDdl,
                AlterColumn,
                DropColumn,
                RenameColumn,
                RenameIndex,
                ForeignKeyConstraints,
                PrimaryKeyConstraints,
                IdentityColumns,
                IdentityConversion,
                SequenceColumns,
                UsingCast,
                FilteredIndexes,
            ]),
            Provider::MySql => Capabilities::from_iter([
                AlterColumn,
                DropColumn,
                RenameColumn,
                RenameIndex,
                ForeignKeyConstraints,
                PrimaryKeyConstraints,
                IdentityColumns,
                IdentityConversion,
            ]),
            Provider::SqlServer => Capabilities::from_iter([
                TransactionalDdl,
                AlterColumn,
                DropColumn,
                RenameColumn,
                RenameIndex,
                ForeignKeyConstraints,
                PrimaryKeyConstraints,
                IdentityColumns,
                FilteredIndexes,
            ]),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::Sqlite => "sqlite",
            Provider::Postgres => "postgres",
            Provider::MySql => "mysql",
            Provider::SqlServer => "sqlserver",
        })
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Provider::Sqlite),
            "postgres" | "postgresql" => Ok(Provider::Postgres),
            "mysql" | "mariadb" => Ok(Provider::MySql),
            "sqlserver" | "mssql" => Ok(Provider::SqlServer),
            other => Err(format!(
                "unknown provider '{}', expected one of sqlite, postgres, mysql, sqlserver",
                other
            )),
        }
    }
}

/// A feature an engine may or may not offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum Capability {
    /// DDL participates in transactions. Without it every DDL statement commits implicitly.
    TransactionalDdl,
    AlterColumn,
    DropColumn,
    RenameColumn,
    RenameIndex,
    /// Foreign keys can be added to and dropped from existing tables.
    ForeignKeyConstraints,
    /// Primary keys can be added to and dropped from existing tables.
    PrimaryKeyConstraints,
    IdentityColumns,
    /// An existing column can switch between manual and generated keys.
    IdentityConversion,
    SequenceColumns,
    /// `ALTER COLUMN ... TYPE ... USING <expr>`.
    UsingCast,
    FilteredIndexes,
}

impl Capability {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// A set of [Capability] flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u16);

impl Capabilities {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0 |= capability.bit();
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.0 &= !capability.bit();
        self
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Capabilities::empty(), |set, capability| set.with(capability))
    }
}

/// The provider a run targets together with the capabilities assumed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderContext {
    provider: Provider,
    capabilities: Capabilities,
}

impl ProviderContext {
    /// Context with the provider's default capabilities.
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            capabilities: provider.capabilities(),
        }
    }

    /// Override the capability set, e.g. for an engine version lacking a feature.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

impl From<Provider> for ProviderContext {
    fn from(provider: Provider) -> Self {
        Self::new(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities() {
        assert!(Provider::Postgres.capabilities().contains(Capability::UsingCast));
        assert!(!Provider::Sqlite.capabilities().contains(Capability::AlterColumn));
        assert!(!Provider::MySql
            .capabilities()
            .contains(Capability::TransactionalDdl));
        assert!(!Provider::SqlServer
            .capabilities()
            .contains(Capability::IdentityConversion));
    }

    #[test]
    fn capabilities_can_be_overridden() {
        let ctx = ProviderContext::new(Provider::Postgres).with_capabilities(
            Provider::Postgres
                .capabilities()
                .without(Capability::FilteredIndexes),
        );
        assert!(!ctx.supports(Capability::FilteredIndexes));
        assert!(ctx.supports(Capability::AlterColumn));
    }

    #[test]
    fn parses_provider_names() {
        assert_eq!("PostgreSQL".parse::<Provider>(), Ok(Provider::Postgres));
        assert_eq!("mssql".parse::<Provider>(), Ok(Provider::SqlServer));
        assert!("oracle".parse::<Provider>().is_err());
        for provider in Provider::ALL {
            assert_eq!(provider.to_string().parse::<Provider>(), Ok(provider));
        }
    }
}
