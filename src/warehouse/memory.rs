//! In-memory warehouse for tests. Tables are stored whole; a query returns
//! the first stored table whose quoted reference appears in the SQL,
//! ignoring filters.

use super::{FieldSchema, QueryResult, TablePath, Warehouse, WriteMode, cell_text};
use crate::error::WarehouseError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Mutex<BTreeMap<TablePath, QueryResult>>,
    /// Canned answers matched by substring, checked before stored tables.
    canned: Mutex<Vec<(String, QueryResult)>>,
    pub queries: Mutex<Vec<String>>,
    pub writes: Mutex<Vec<(TablePath, WriteMode, usize)>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_table(&self, table: &TablePath, result: QueryResult) {
        self.tables.lock().unwrap().insert(table.clone(), result);
    }

    pub fn table(&self, table: &TablePath) -> Option<QueryResult> {
        self.tables.lock().unwrap().get(table).cloned()
    }

    pub fn respond(&self, needle: &str, result: QueryResult) {
        self.canned.lock().unwrap().push((needle.to_string(), result));
    }

    pub fn executed(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError> {
        self.queries.lock().unwrap().push(sql.to_string());

        if let Some((_, result)) = self
            .canned
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
        {
            return Ok(result.clone());
        }

        let tables = self.tables.lock().unwrap();
        if let Some((_, result)) = tables.iter().find(|(path, _)| sql.contains(&path.sql())) {
            return Ok(result.clone());
        }
        if sql.trim_start().to_uppercase().starts_with("SELECT") {
            return Err(WarehouseError::NotFound(format!("no table referenced by: {}", sql)));
        }
        Ok(QueryResult::default())
    }

    async fn write_rows(
        &self,
        table: &TablePath,
        schema: &[FieldSchema],
        rows: Vec<Value>,
        mode: WriteMode,
    ) -> Result<u64, WarehouseError> {
        let written = rows.len();
        let new_rows: Vec<Vec<Option<String>>> = rows
            .iter()
            .map(|row| schema.iter().map(|f| cell_text(row.get(&f.name))).collect())
            .collect();

        let mut tables = self.tables.lock().unwrap();
        let entry = tables.entry(table.clone()).or_insert_with(|| QueryResult {
            schema: schema.to_vec(),
            rows: Vec::new(),
        });
        if mode == WriteMode::Replace {
            entry.schema = schema.to_vec();
            entry.rows.clear();
        }
        entry.rows.extend(new_rows);

        self.writes.lock().unwrap().push((table.clone(), mode, written));
        Ok(written as u64)
    }

    async fn list_tables(&self, project: &str, dataset: &str) -> Result<Vec<String>, WarehouseError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.project == project && p.dataset == dataset)
            .map(|p| p.table.clone())
            .collect())
    }

    async fn delete_table(&self, table: &TablePath, not_found_ok: bool) -> Result<(), WarehouseError> {
        match self.tables.lock().unwrap().remove(table) {
            Some(_) => Ok(()),
            None if not_found_ok => Ok(()),
            None => Err(WarehouseError::NotFound(table.to_string())),
        }
    }

    async fn copy_table(&self, source: &TablePath, destination: &TablePath) -> Result<(), WarehouseError> {
        let mut tables = self.tables.lock().unwrap();
        let copied = tables
            .get(source)
            .cloned()
            .ok_or_else(|| WarehouseError::NotFound(source.to_string()))?;
        tables.insert(destination.clone(), copied);
        Ok(())
    }
}
