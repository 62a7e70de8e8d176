//! Loading a ledger from a directory of record files.
//!
//! Each `*.toml` or `*.json` file holds one record:
//!
//! ```toml
//! id = "20240101000000_CreateFoo"   # optional, defaults to the file stem
//! description = "Foo table"
//!
//! [[up]]
//! op = "create_table"
//! name = "Foo"
//! columns = [{ name = "Id", type = "int", nullable = false }]
//! primary_key = { name = "PK_Foo", columns = ["Id"] }
//!
//! [[down]]
//! op = "drop_table"
//! name = "Foo"
//! ```
//!
//! A record without `down` must say `irreversible = true`, so that a forgotten inverse is not
//! mistaken for an intentional one. Other files in the directory are ignored.

use crate::core::{MigrationId, MigrationRecord};
use crate::error::Error;
use crate::operation::SchemaOperation;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordFile {
    id: Option<String>,
    description: Option<String>,
    #[serde(default)]
    irreversible: bool,
    #[serde(default)]
    up: Vec<SchemaOperation>,
    down: Option<Vec<SchemaOperation>>,
}

/// Load every record file in `dir`, sorted by id.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<MigrationRecord>, Error> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).map_err(|e| Error::Load {
        path: dir.display().to_string(),
        message: e.to_string(),
    })?;

    let mut records = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| Error::Load {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?
            .path();
        if path.is_file() && matches!(extension(&path), Some("toml" | "json")) {
            records.push(load_file(&path)?);
        }
    }
    records.sort_by(|a, b| a.id().cmp(b.id()));

    let mut seen = HashSet::new();
    for record in &records {
        if !seen.insert(record.id()) {
            return Err(Error::DuplicateId(record.id().clone()));
        }
    }
    Ok(records)
}

/// Load a single record file.
pub fn load_file(path: impl AsRef<Path>) -> Result<MigrationRecord, Error> {
    let path = path.as_ref();
    let load_error = |message: String| Error::Load {
        path: path.display().to_string(),
        message,
    };

    let contents = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    let file: RecordFile = match extension(path) {
        Some("json") => serde_json::from_str(&contents).map_err(|e| load_error(e.to_string()))?,
        _ => toml::from_str(&contents).map_err(|e| load_error(e.to_string()))?,
    };

    let id = match file.id {
        Some(id) => id,
        None => path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| load_error("file name is not valid UTF-8".to_string()))?,
    };
    let id = MigrationId::parse(&id)?;

    let mut record = MigrationRecord::new(id).up(file.up);
    record = match (file.down, file.irreversible) {
        (Some(down), false) => record.down(down),
        (None, true) => record.irreversible(),
        (Some(_), true) => {
            return Err(load_error(
                "an irreversible record cannot declare down operations".to_string(),
            ))
        }
        (None, false) => {
            return Err(load_error(
                "no down operations; add them or set irreversible = true".to_string(),
            ))
        }
    };
    if let Some(description) = file.description {
        record = record.with_description(description);
    }
    Ok(record)
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ColumnDef, ColumnType, PrimaryKeyDef};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

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

    #[test]
    fn loads_toml_and_json_sorted_by_id() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "second.json",
            r#"{
                "id": "20240102000000_AddBar",
                "up": [{ "op": "add_column", "table": "Foo", "column": { "name": "Bar", "type": "string" } }],
                "down": [{ "op": "drop_column", "table": "Foo", "name": "Bar" }]
            }"#,
        );
        write(&dir, "20240101000000_CreateFoo.toml", CREATE_FOO);
        write(&dir, "README.md", "not a record");

        let records = load_dir(dir.path()).unwrap();
        assert_eq!(
            records.iter().map(|r| r.id().as_str()).collect::<Vec<_>>(),
            vec!["20240101000000_CreateFoo", "20240102000000_AddBar"]
        );

        let create_foo = &records[0];
        assert_eq!(create_foo.description(), Some("Foo table"));
        assert_eq!(
            create_foo.up_operations(),
            &[SchemaOperation::create_table(
                "Foo",
                vec![ColumnDef::new("Id", ColumnType::Int).not_null()],
                Some(PrimaryKeyDef {
                    name: "PK_Foo".to_string(),
                    columns: vec!["Id".to_string()],
                }),
            )]
        );
        assert_eq!(
            records[1].down_operations(),
            Some(&[SchemaOperation::drop_column("Foo", "Bar")][..])
        );
    }

    #[test]
    fn irreversible_must_be_explicit() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "20240101000000_Purge.toml",
            "[[up]]\nop = \"sql\"\nsql = \"DELETE FROM \\\"Foo\\\"\"\n",
        );
        assert!(matches!(load_dir(dir.path()), Err(Error::Load { .. })));

        write(
            &dir,
            "20240101000000_Purge.toml",
            "irreversible = true\n[[up]]\nop = \"sql\"\nsql = \"DELETE FROM \\\"Foo\\\"\"\n",
        );
        let records = load_dir(dir.path()).unwrap();
        assert!(!records[0].is_reversible());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "20240101000000_CreateFoo.toml", CREATE_FOO);
        write(
            &dir,
            "copy.toml",
            &format!("id = \"20240101000000_CreateFoo\"\n{}", CREATE_FOO),
        );
        assert_eq!(
            load_dir(dir.path()),
            Err(Error::DuplicateId(MigrationId::new("20240101000000_CreateFoo")))
        );
    }

    #[test]
    fn malformed_files_name_their_path() {
        let dir = TempDir::new().unwrap();
        write(&dir, "20240101000000_Broken.toml", "[[up]]\nop = \"explode\"\n");
        match load_dir(dir.path()) {
            Err(Error::Load { path, .. }) => assert!(path.ends_with("20240101000000_Broken.toml")),
            other => panic!("expected load error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "CreateFoo.toml", CREATE_FOO);
        assert_eq!(
            load_dir(dir.path()),
            Err(Error::InvalidId("CreateFoo".to_string()))
        );
    }

    #[test]
    fn missing_directory_is_a_load_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_dir(dir.path().join("missing")),
            Err(Error::Load { .. })
        ));
    }
}
