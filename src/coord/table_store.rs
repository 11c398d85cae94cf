//! In-memory table data, filled incrementally by the input readers.
//!
//! A table is complete once it has a header and its end-of-table sentinel
//! (an empty batch). At that point its rows are folded into one distinct-value
//! set per column and the raw rows are released. Column sets are immutable
//! from then on and are shared with workers by reference count.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::coord::types::{CandidatePair, ColumnRef, ColumnSnapshot, InclusionDependency, TableId};
use crate::core::errors::{MinerError, Result};

#[derive(Debug)]
struct TableData {
    name: String,
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
    row_count: usize,
    end_of_table: bool,
    columns: Vec<Arc<HashSet<String>>>,
}

impl TableData {
    fn new(name: String) -> Self {
        Self {
            name,
            header: None,
            rows: Vec::new(),
            row_count: 0,
            end_of_table: false,
            columns: Vec::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.header.is_some() && self.end_of_table
    }

    fn check_width(&self, header_len: usize, rows: &[Vec<String>], first_row: usize) -> Result<()> {
        for (offset, row) in rows.iter().enumerate() {
            if row.len() != header_len {
                return Err(MinerError::load(
                    &self.name,
                    format!(
                        "row {} has {} fields but the header has {}",
                        first_row + offset,
                        row.len(),
                        header_len
                    ),
                ));
            }
        }
        Ok(())
    }

    fn materialize(&mut self) {
        let width = self.header.as_ref().map_or(0, Vec::len);
        let mut columns: Vec<HashSet<String>> = vec![HashSet::new(); width];
        for row in self.rows.drain(..) {
            for (column, value) in columns.iter_mut().zip(row) {
                column.insert(value);
            }
        }
        self.columns = columns.into_iter().map(Arc::new).collect();
        self.rows = Vec::new();
    }
}

/// Per-table headers and column data
#[derive(Debug)]
pub struct TableStore {
    tables: Vec<TableData>,
    ready_fired: bool,
}

impl TableStore {
    /// One slot per input table; ids are positions in `names`
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: names.into_iter().map(|n| TableData::new(n.into())).collect(),
            ready_fired: false,
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn open_table(&mut self, table: TableId) -> Result<&mut TableData> {
        let data = self
            .tables
            .get_mut(table)
            .ok_or_else(|| MinerError::load(format!("#{}", table), "unknown table id"))?;
        if data.is_complete() {
            return Err(MinerError::load(&data.name, "data arrived after the table was finalized"));
        }
        Ok(data)
    }

    /// Record the header of a table.
    ///
    /// Returns `true` exactly once: on the call that completes the last table.
    pub fn on_header(&mut self, table: TableId, header: Vec<String>) -> Result<bool> {
        let data = self.open_table(table)?;
        if data.header.is_some() {
            return Err(MinerError::load(&data.name, "header delivered twice"));
        }
        if header.is_empty() {
            return Err(MinerError::load(&data.name, "header has no columns"));
        }
        data.check_width(header.len(), &data.rows, 0)?;
        debug!("Header for table {} ({}): {:?}", table, data.name, header);
        data.header = Some(header);
        self.after_update(table);
        Ok(self.check_ready())
    }

    /// Append a batch of rows; an empty batch is the end-of-table sentinel.
    ///
    /// Returns `true` exactly once: on the call that completes the last table.
    pub fn on_batch(&mut self, table: TableId, rows: Vec<Vec<String>>) -> Result<bool> {
        let data = self.open_table(table)?;
        if rows.is_empty() {
            data.end_of_table = true;
            info!("Finished reading table {} ({}, {} rows)", table, data.name, data.row_count);
        } else {
            if let Some(header) = &data.header {
                data.check_width(header.len(), &rows, data.row_count)?;
            }
            data.row_count += rows.len();
            data.rows.extend(rows);
        }
        self.after_update(table);
        Ok(self.check_ready())
    }

    fn after_update(&mut self, table: TableId) {
        let data = &mut self.tables[table];
        if data.is_complete() && data.columns.is_empty() {
            data.materialize();
        }
    }

    /// Every table has a header and an end-of-table sentinel
    pub fn is_fully_loaded(&self) -> bool {
        self.tables.iter().all(TableData::is_complete)
    }

    /// Edge-triggered readiness: `true` only the first time all tables are loaded
    pub fn check_ready(&mut self) -> bool {
        if self.ready_fired || !self.is_fully_loaded() {
            return false;
        }
        self.ready_fired = true;
        true
    }

    pub fn table_name(&self, table: TableId) -> Option<&str> {
        self.tables.get(table).map(|t| t.name.as_str())
    }

    pub fn header(&self, table: TableId) -> Option<&[String]> {
        self.tables.get(table)?.header.as_deref()
    }

    pub fn column_name(&self, column: ColumnRef) -> Option<&str> {
        self.header(column.table)?.get(column.column).map(String::as_str)
    }

    /// All columns of all tables ordered by (table, column)
    pub fn columns(&self) -> Vec<ColumnRef> {
        self.tables
            .iter()
            .enumerate()
            .flat_map(|(table, data)| {
                let width = data.header.as_ref().map_or(0, Vec::len);
                (0..width).map(move |column| ColumnRef::new(table, column))
            })
            .collect()
    }

    /// Distinct values of a column of a completed table
    pub fn snapshot(&self, column: ColumnRef) -> Option<ColumnSnapshot> {
        let data = self.tables.get(column.table)?;
        let values = data.columns.get(column.column)?;
        Some(ColumnSnapshot::new(column, Arc::clone(values)))
    }

    /// Resolve a confirmed candidate into table and attribute names
    pub fn dependency(&self, pair: &CandidatePair) -> Result<InclusionDependency> {
        let resolve = |column: ColumnRef| -> Result<(String, String)> {
            let table = self
                .table_name(column.table)
                .ok_or_else(|| MinerError::internal(format!("no table for column {}", column)))?;
            let attribute = self
                .column_name(column)
                .ok_or_else(|| MinerError::internal(format!("no header entry for column {}", column)))?;
            Ok((table.to_string(), attribute.to_string()))
        };
        let (dependent_table, dependent_attribute) = resolve(pair.dependent())?;
        let (referenced_table, referenced_attribute) = resolve(pair.referenced())?;
        Ok(InclusionDependency::unary(
            dependent_table,
            dependent_attribute,
            referenced_table,
            referenced_attribute,
        ))
    }
}
