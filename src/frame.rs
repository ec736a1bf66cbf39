//! In-memory tabular representation shared by every stage.
//!
//! A [`Frame`] is an ordered list of column names plus row-major cells. Every
//! row has exactly one cell per column; the mutating helpers keep that
//! invariant so the stages never have to re-check widths.

use std::collections::HashSet;

use anyhow::{Result, anyhow, ensure};
use sha2::{Digest, Sha256};

use crate::data::{Value, render_cell};

pub type Row = Vec<Option<Value>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Frame {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Result<Self> {
        let mut frame = Frame::new(columns);
        for row in rows {
            frame.push_row(row)?;
        }
        Ok(frame)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn push_row(&mut self, row: Row) -> Result<()> {
        ensure!(
            row.len() == self.columns.len(),
            "Row has {} cell(s) but frame has {} column(s)",
            row.len(),
            self.columns.len()
        );
        self.rows.push(row);
        Ok(())
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_ref()
    }

    pub fn push_column(&mut self, name: &str, values: Vec<Option<Value>>) -> Result<()> {
        let at = self.columns.len();
        self.insert_column(at, name, values)
    }

    pub fn insert_column(
        &mut self,
        at: usize,
        name: &str,
        values: Vec<Option<Value>>,
    ) -> Result<()> {
        ensure!(!self.has_column(name), "Column '{name}' already exists");
        ensure!(
            values.len() == self.rows.len(),
            "Column '{name}' has {} value(s) but frame has {} row(s)",
            values.len(),
            self.rows.len()
        );
        let at = at.min(self.columns.len());
        self.columns.insert(at, name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.insert(at, value);
        }
        Ok(())
    }

    /// Drops every named column that exists; returns the ones actually removed.
    pub fn drop_columns<S: AsRef<str>>(&mut self, names: &[S]) -> Vec<String> {
        let wanted: HashSet<&str> = names.iter().map(|name| name.as_ref()).collect();
        let keep: Vec<bool> = self
            .columns
            .iter()
            .map(|column| !wanted.contains(column.as_str()))
            .collect();
        if keep.iter().all(|flag| *flag) {
            return Vec::new();
        }
        let mut dropped = Vec::new();
        let mut columns = Vec::with_capacity(self.columns.len());
        for (column, kept) in self.columns.drain(..).zip(&keep) {
            if *kept {
                columns.push(column);
            } else {
                dropped.push(column);
            }
        }
        self.columns = columns;
        for row in &mut self.rows {
            let mut flags = keep.iter();
            row.retain(|_| *flags.next().unwrap_or(&true));
        }
        dropped
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let idx = self
            .column_index(from)
            .ok_or_else(|| anyhow!("Column '{from}' not found"))?;
        ensure!(
            !self.has_column(to),
            "Cannot rename '{from}' to '{to}': target already exists"
        );
        self.columns[idx] = to.to_string();
        Ok(())
    }

    /// New frame with the named columns in the given order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Frame> {
        let indexes = names
            .iter()
            .map(|name| {
                self.column_index(name.as_ref())
                    .ok_or_else(|| anyhow!("Column '{}' not found", name.as_ref()))
            })
            .collect::<Result<Vec<_>>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indexes.iter().map(|idx| row[*idx].clone()).collect())
            .collect();
        Ok(Frame {
            columns: names.iter().map(|name| name.as_ref().to_string()).collect(),
            rows,
        })
    }

    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> Result<()>
    where
        F: FnMut(Option<Value>) -> Option<Value>,
    {
        let idx = self
            .column_index(name)
            .ok_or_else(|| anyhow!("Column '{name}' not found"))?;
        for row in &mut self.rows {
            let current = row[idx].take();
            row[idx] = f(current);
        }
        Ok(())
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Row) -> bool,
    {
        self.rows.retain(|row| keep(row));
    }

    pub fn extend_rows(&mut self, rows: Vec<Row>) -> Result<()> {
        for row in rows {
            self.push_row(row)?;
        }
        Ok(())
    }

    /// SHA-256 over column names and rendered cells in row order. Two runs
    /// over the same input must produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for column in &self.columns {
            hasher.update(column.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
        for row in &self.rows {
            for cell in row {
                let tag: u8 = match cell {
                    None => 0,
                    Some(Value::Text(_)) => 1,
                    Some(Value::Integer(_)) => 2,
                    Some(Value::Real(_)) => 3,
                    Some(Value::Boolean(_)) => 4,
                };
                hasher.update([tag]);
                hasher.update(render_cell(cell.as_ref()).as_bytes());
                hasher.update([0x1f]);
            }
            hasher.update([0x1e]);
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}
