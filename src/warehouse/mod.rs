//! The remote warehouse: the only persistence layer of the project.
//!
//! Tasks talk to it through the [`Warehouse`] trait. [`BigQueryClient`] is the
//! production implementation; tests use an in-memory stand-in.

mod bigquery;
#[cfg(test)]
pub mod memory;
pub mod rows;

pub use bigquery::{BigQueryClient, LazyBigQuery};

use crate::error::WarehouseError;
use async_trait::async_trait;
use log::{debug, info};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Project ids allow dashes; dataset and table ids do not, but a single
    // permissive pattern is enough to keep quotes and backticks out of SQL.
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_\-]{0,1023}$").unwrap())
}

/// Rejects anything that could break out of a quoted SQL identifier or literal.
pub fn validate_identifier(raw: &str) -> Result<&str, WarehouseError> {
    if identifier_pattern().is_match(raw) {
        Ok(raw)
    } else {
        Err(WarehouseError::InvalidIdentifier(raw.to_string()))
    }
}

/// Fully-qualified `project.dataset.table` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TablePath {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TablePath {
    pub fn new(project: &str, dataset: &str, table: &str) -> Result<Self, WarehouseError> {
        Ok(Self {
            project: validate_identifier(project)?.to_string(),
            dataset: validate_identifier(dataset)?.to_string(),
            table: validate_identifier(table)?.to_string(),
        })
    }

    /// Parses `project.dataset.table`.
    pub fn parse(raw: &str) -> Result<Self, WarehouseError> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            [project, dataset, table] => Self::new(project, dataset, table),
            _ => Err(WarehouseError::InvalidIdentifier(raw.to_string())),
        }
    }

    /// Same dataset, different table.
    pub fn sibling(&self, table: &str) -> Result<Self, WarehouseError> {
        Self::new(&self.project, &self.dataset, table)
    }

    /// Backtick-quoted reference for use in standard SQL.
    pub fn sql(&self) -> String {
        format!("`{}`", self)
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Timestamp,
    Boolean,
}

impl FieldKind {
    /// Maps the type names the API reports, including legacy aliases.
    pub fn from_api(name: &str) -> Self {
        match name {
            "INTEGER" | "INT64" => FieldKind::Integer,
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => FieldKind::Float,
            "TIMESTAMP" | "DATETIME" => FieldKind::Timestamp,
            "BOOLEAN" | "BOOL" => FieldKind::Boolean,
            _ => FieldKind::String,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Float)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
}

impl FieldSchema {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Rows exactly as the warehouse returns them: one raw string per cell,
/// `None` for SQL NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub schema: Vec<FieldSchema>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.iter().map(|f| f.name.as_str()).collect()
    }

    /// First cell read as a count; empty results count as zero.
    pub fn first_count(&self) -> Result<i64, WarehouseError> {
        match self.rows.first().and_then(|row| row.first()) {
            None | Some(None) => Ok(0),
            Some(Some(raw)) => raw
                .parse::<f64>()
                .map(|v| v as i64)
                .map_err(|e| WarehouseError::Decode(format!("count `{}`: {}", raw, e))),
        }
    }

    /// Each row as a JSON object keyed by column name.
    pub fn objects(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.schema
                    .iter()
                    .zip(row.iter())
                    .map(|(field, cell)| {
                        let value = cell.clone().map(Value::String).unwrap_or(Value::Null);
                        (field.name.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }

    /// Decodes every row into `T`. Row types read numbers with the lenient
    /// helpers in [`rows`], since cells arrive as strings.
    pub fn records<T: DeserializeOwned>(&self) -> Result<Vec<T>, WarehouseError> {
        self.objects()
            .into_iter()
            .enumerate()
            .map(|(i, obj)| {
                serde_json::from_value(Value::Object(obj))
                    .map_err(|e| WarehouseError::Decode(format!("row {}: {}", i, e)))
            })
            .collect()
    }

    /// Builds a result from serializable rows, rendering each value the way
    /// the API would.
    pub fn from_records<T: TableRecord>(records: &[T]) -> Result<Self, WarehouseError> {
        let schema = T::schema();
        let rows = records
            .iter()
            .map(|record| {
                let value = serde_json::to_value(record)?;
                Ok(schema
                    .iter()
                    .map(|field| cell_text(value.get(&field.name)))
                    .collect())
            })
            .collect::<Result<Vec<_>, WarehouseError>>()?;
        Ok(Self { schema, rows })
    }
}

pub(crate) fn cell_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Truncate the destination before loading.
    Replace,
    Append,
}

/// A row type with a fixed warehouse schema.
pub trait TableRecord: Serialize {
    fn schema() -> Vec<FieldSchema>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Runs one standard-SQL statement and returns every result row.
    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError>;

    /// Loads JSON objects into `table`, creating it when missing. Returns the
    /// number of rows the warehouse reports as written.
    async fn write_rows(
        &self,
        table: &TablePath,
        schema: &[FieldSchema],
        rows: Vec<Value>,
        mode: WriteMode,
    ) -> Result<u64, WarehouseError>;

    async fn list_tables(&self, project: &str, dataset: &str) -> Result<Vec<String>, WarehouseError>;

    async fn delete_table(&self, table: &TablePath, not_found_ok: bool) -> Result<(), WarehouseError>;

    async fn copy_table(&self, source: &TablePath, destination: &TablePath) -> Result<(), WarehouseError>;
}

/// Runs `sql` and decodes the rows into `T`.
pub async fn fetch<T: DeserializeOwned>(
    warehouse: &dyn Warehouse,
    sql: &str,
) -> Result<Vec<T>, WarehouseError> {
    debug!("query: {}", sql.trim());
    let result = warehouse.query(sql).await?;
    info!("fetched {} rows", result.len());
    result.records()
}

/// Serializes `records` and loads them into `table`.
pub async fn upload<T: TableRecord>(
    warehouse: &dyn Warehouse,
    table: &TablePath,
    records: &[T],
    mode: WriteMode,
) -> Result<u64, WarehouseError> {
    let rows = records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    info!("uploading {} rows to {} ({:?})", rows.len(), table, mode);
    warehouse.write_rows(table, &T::schema(), rows, mode).await
}
