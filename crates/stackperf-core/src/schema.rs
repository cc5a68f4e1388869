//! Schema loading and application.
//!
//! The record shape is fixed; the schema only decides how the `sessions`
//! table is declared and which version the store file is stamped with.
//! A schema file is plain SQL DDL, optionally starting with a
//! `-- schema-version: N` line.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::StoreOpenError;

/// Table holding the records.
pub const TABLE: &str = "sessions";

/// Version stamped by the builtin schema.
pub const SCHEMA_VERSION: i32 = 1;

/// Columns every schema must declare on the record table.
pub const REQUIRED_COLUMNS: [&str; 4] = ["number", "start_ms", "end_ms", "valid"];

const VERSION_PREFIX: &str = "-- schema-version:";

const BUILTIN_DDL: &str = "\
CREATE TABLE IF NOT EXISTS sessions (
    number   INTEGER NOT NULL UNIQUE,
    start_ms INTEGER NOT NULL,
    end_ms   INTEGER NOT NULL,
    valid    INTEGER NOT NULL
);";

/// Where the schema comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SchemaSource {
    /// The schema compiled into this crate
    #[default]
    Builtin,
    /// SQL DDL read from disk
    File(PathBuf),
}

/// A loaded schema, ready to be applied to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// "builtin" or the schema file stem
    pub name: String,
    /// Value written to `PRAGMA user_version`
    pub version: i32,
    /// DDL executed on attach
    pub ddl: String,
}

/// Load a schema from its source.
pub fn load_schema(source: &SchemaSource) -> Result<Schema, StoreOpenError> {
    match source {
        SchemaSource::Builtin => Ok(Schema {
            name: "builtin".into(),
            version: SCHEMA_VERSION,
            ddl: BUILTIN_DDL.into(),
        }),
        SchemaSource::File(path) => load_file(path),
    }
}

fn load_file(path: &Path) -> Result<Schema, StoreOpenError> {
    if !path.exists() {
        return Err(StoreOpenError::SchemaMissing { path: path.to_path_buf() });
    }
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("schema")
        .to_string();
    let ddl = std::fs::read_to_string(path).map_err(|e| StoreOpenError::SchemaInvalid {
        source_name: name.clone(),
        reason: format!("unreadable: {}", e),
    })?;
    if ddl.trim().is_empty() {
        return Err(StoreOpenError::SchemaInvalid {
            source_name: name,
            reason: "empty schema".into(),
        });
    }

    let version = match ddl.lines().next().and_then(|l| l.trim().strip_prefix(VERSION_PREFIX)) {
        Some(v) => v.trim().parse::<i32>().map_err(|_| StoreOpenError::SchemaInvalid {
            source_name: name.clone(),
            reason: format!("bad version header '{}'", v.trim()),
        })?,
        None => SCHEMA_VERSION,
    };

    Ok(Schema { name, version, ddl })
}

impl Schema {
    /// Apply the schema to an open store and stamp its version.
    ///
    /// A store already stamped with a different non-zero version is rejected
    /// before any DDL runs.
    pub(crate) fn apply(&self, conn: &Connection) -> Result<(), StoreOpenError> {
        let invalid = |reason: String| StoreOpenError::SchemaInvalid {
            source_name: self.name.clone(),
            reason,
        };

        let stamped: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| invalid(format!("cannot read store version: {}", e)))?;
        if stamped != 0 && stamped != self.version {
            return Err(invalid(format!(
                "store is at version {}, schema is version {}",
                stamped, self.version
            )));
        }

        conn.execute_batch(&self.ddl)
            .map_err(|e| invalid(format!("DDL failed: {}", e)))?;

        let columns = table_columns(conn).map_err(|e| invalid(format!("cannot inspect {}: {}", TABLE, e)))?;
        if columns.is_empty() {
            return Err(invalid(format!("no '{}' table declared", TABLE)));
        }
        if let Some(missing) = REQUIRED_COLUMNS.iter().find(|c| !columns.iter().any(|have| have == *c)) {
            return Err(invalid(format!("'{}' is missing column '{}'", TABLE, missing)));
        }

        conn.pragma_update(None, "user_version", self.version)
            .map_err(|e| invalid(format!("cannot stamp version: {}", e)))?;
        Ok(())
    }
}

fn table_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", TABLE))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}
