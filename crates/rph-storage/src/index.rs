//! DuckDB views over the Parquet files of a dataset.

use std::fs;
use std::path::{Path, PathBuf};

use duckdb::types::ValueRef;
use duckdb::{AccessMode, Config, Connection};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use crate::{ParquetStore, StorageError, PARQUET_EXTENSION};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("opening duckdb database {}: {source}", .path.display())]
    Connection {
        path: PathBuf,
        #[source]
        source: duckdb::Error,
    },
    #[error("query failed: {0}")]
    Query(#[from] duckdb::Error),
    #[error("invalid view or dataset name {0:?}")]
    InvalidName(String),
    #[error("dataset {dataset} has no files under {}", .dir.display())]
    NoFiles { dataset: String, dir: PathBuf },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    /// One JSON object per row, keyed by column name.
    pub rows: Vec<JsonValue>,
}

/// File-backed DuckDB database whose views always read the current files on disk.
///
/// Each call opens its own short-lived connection.
#[derive(Debug, Clone)]
pub struct DuckDbIndex {
    db_path: PathBuf,
    store: ParquetStore,
}

impl DuckDbIndex {
    pub fn new(db_path: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            store: ParquetStore::new(base_dir),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn default_view_name(dataset: &str) -> String {
        format!("vw_{dataset}")
    }

    /// Glob matching every file of `dataset`.
    pub fn dataset_glob(&self, dataset: &str) -> String {
        let dir = self.store.dataset_dir(dataset);
        let dir = fs::canonicalize(&dir).unwrap_or(dir);
        dir.join(format!("{dataset}_*.{PARQUET_EXTENSION}"))
            .to_string_lossy()
            .into_owned()
    }

    /// Creates or replaces `vw_<dataset>` (or `view_name`) over all files of the dataset.
    ///
    /// Safe to repeat; files written later are picked up without recreating the view.
    pub fn create_view(&self, dataset: &str, view_name: Option<&str>) -> Result<String, IndexError> {
        if !is_identifier(dataset) {
            return Err(IndexError::InvalidName(dataset.to_string()));
        }
        let view = view_name
            .map(str::to_string)
            .unwrap_or_else(|| Self::default_view_name(dataset));
        if !is_identifier(&view) {
            return Err(IndexError::InvalidName(view));
        }

        if self.store.list_files(dataset)?.is_empty() {
            return Err(IndexError::NoFiles {
                dataset: dataset.to_string(),
                dir: self.store.dataset_dir(dataset),
            });
        }

        let pattern = self.dataset_glob(dataset);
        let sql = format!(
            "CREATE OR REPLACE VIEW {view} AS SELECT * FROM read_parquet('{}', union_by_name = true)",
            pattern.replace('\'', "''")
        );
        debug!(%sql, "creating view");

        let conn = self.open_read_write()?;
        conn.execute_batch(&sql)?;
        info!(view = %view, pattern = %pattern, "view ready");
        Ok(view)
    }

    /// Runs `sql` on a read-only connection.
    pub fn query(&self, sql: &str) -> Result<QueryResult, IndexError> {
        let conn = self.open_read_only()?;
        let mut stmt = conn.prepare(sql)?;
        let mut result_rows = stmt.query([])?;

        let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let columns: Vec<String> = (0..column_count)
            .map(|i| {
                result_rows
                    .as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{i}"))
            })
            .collect();

        let mut rows = Vec::new();
        while let Some(row) = result_rows.next()? {
            let mut object = serde_json::Map::with_capacity(columns.len());
            for (i, name) in columns.iter().enumerate() {
                let value = row.get_ref(i).map(value_ref_to_json).unwrap_or(JsonValue::Null);
                object.insert(name.clone(), value);
            }
            rows.push(JsonValue::Object(object));
        }
        Ok(QueryResult { columns, rows })
    }

    fn open_read_write(&self) -> Result<Connection, IndexError> {
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                IndexError::Storage(StorageError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })
            })?;
        }
        Connection::open(&self.db_path).map_err(|source| IndexError::Connection {
            path: self.db_path.clone(),
            source,
        })
    }

    fn open_read_only(&self) -> Result<Connection, IndexError> {
        let connection_error = |source| IndexError::Connection {
            path: self.db_path.clone(),
            source,
        };
        let config = Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(connection_error)?;
        Connection::open_with_flags(&self.db_path, config).map_err(connection_error)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn value_ref_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Boolean(b) => JsonValue::Bool(b),
        ValueRef::TinyInt(i) => JsonValue::Number(i.into()),
        ValueRef::SmallInt(i) => JsonValue::Number(i.into()),
        ValueRef::Int(i) => JsonValue::Number(i.into()),
        ValueRef::BigInt(i) => JsonValue::Number(i.into()),
        ValueRef::HugeInt(i) => JsonValue::String(i.to_string()),
        ValueRef::UTinyInt(i) => JsonValue::Number(i.into()),
        ValueRef::USmallInt(i) => JsonValue::Number(i.into()),
        ValueRef::UInt(i) => JsonValue::Number(i.into()),
        ValueRef::UBigInt(i) => JsonValue::Number(i.into()),
        ValueRef::Float(f) => serde_json::Number::from_f64(f64::from(f))
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => JsonValue::String(hex::encode(bytes)),
        ValueRef::Decimal(d) => JsonValue::String(d.to_string()),
        other => JsonValue::String(format!("{other:?}")),
    }
}
