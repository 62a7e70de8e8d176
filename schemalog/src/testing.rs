//! Testing utilities for record development

#[cfg(feature = "sqlite")]
pub mod sqlite;
