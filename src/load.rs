//! Destination loading.
//!
//! A [`TableSink`] receives one assembled family at a time together with its
//! [`TableSchema`]. The SQLite sink writes each table inside a single
//! transaction: either every row lands or the table is left as it was.
//! Identifiers are lower-cased on the way in.

use std::path::Path;

use anyhow::{Context, Result, bail};
use log::{debug, info};
use rusqlite::{Connection, params_from_iter, types::Value as SqlValue};
use serde::{Deserialize, Serialize};

use crate::{
    data::Value,
    error::HarmonizeError,
    frame::Frame,
    schema::{ColumnType, TableSchema},
};

/// `Replace` drops and recreates the table so a failed run can simply be
/// rerun; `Append` adds to an existing table and relies on the key
/// constraint to reject reloads of the same rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Append,
    #[default]
    Replace,
}

pub trait TableSink {
    /// Writes `frame` under `schema`, returning the number of rows stored.
    fn write_table(&mut self, schema: &TableSchema, frame: &Frame, mode: WriteMode) -> Result<usize>;
}

pub struct SqliteSink {
    connection: Connection,
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.to_lowercase().replace('"', "\"\""))
}

fn to_sql(cell: Option<&Value>) -> SqlValue {
    match cell {
        None => SqlValue::Null,
        Some(Value::Text(text)) => SqlValue::Text(text.clone()),
        Some(Value::Integer(i)) => SqlValue::Integer(*i),
        Some(Value::Real(f)) => SqlValue::Real(*f),
        Some(Value::Boolean(b)) => SqlValue::Integer(i64::from(*b)),
    }
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self> {
        let connection =
            Connection::open(path).with_context(|| format!("Opening database {path:?}"))?;
        Ok(SqliteSink { connection })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteSink {
            connection: Connection::open_in_memory()?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn create_statement(schema: &TableSchema) -> String {
        let mut definitions: Vec<String> = schema
            .columns
            .iter()
            .map(|column| {
                format!(
                    "{} {}",
                    quote_identifier(&column.name),
                    column.datatype.sql_type()
                )
            })
            .collect();
        if !schema.key.is_empty() {
            let key = schema
                .key
                .iter()
                .map(|column| quote_identifier(column))
                .collect::<Vec<_>>()
                .join(", ");
            definitions.push(format!("UNIQUE ({key})"));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&schema.name),
            definitions.join(", ")
        )
    }
}

/// Every present cell must fit its declared column type.
pub fn check_types(schema: &TableSchema, frame: &Frame) -> Result<()> {
    let declared: Vec<ColumnType> = frame
        .columns()
        .iter()
        .map(|column| match schema.column(column) {
            Some(def) => Ok(def.datatype),
            None => bail!("Column '{column}' is not declared for '{}'", schema.name),
        })
        .collect::<Result<_>>()?;
    for row in frame.rows() {
        for (idx, cell) in row.iter().enumerate() {
            if let Some(value) = cell
                && !declared[idx].accepts(value)
            {
                return Err(HarmonizeError::TypeMismatch {
                    column: frame.columns()[idx].clone(),
                    declared: declared[idx].to_string(),
                    found: value.type_name().to_string(),
                }
                .into());
            }
        }
    }
    Ok(())
}

impl TableSink for SqliteSink {
    fn write_table(&mut self, schema: &TableSchema, frame: &Frame, mode: WriteMode) -> Result<usize> {
        check_types(schema, frame)?;
        let table = quote_identifier(&schema.name);
        let tx = self
            .connection
            .transaction()
            .with_context(|| format!("Starting transaction for '{}'", schema.name))?;
        if mode == WriteMode::Replace {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
        }
        tx.execute_batch(&Self::create_statement(schema))
            .with_context(|| format!("Creating table '{}'", schema.name))?;

        let columns = frame
            .columns()
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=frame.columns().len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");
        debug!("{sql}");
        {
            let mut statement = tx.prepare(&sql)?;
            for (row_idx, row) in frame.rows().iter().enumerate() {
                statement
                    .execute(params_from_iter(row.iter().map(|cell| to_sql(cell.as_ref()))))
                    .with_context(|| format!("Inserting row {} into '{}'", row_idx + 1, schema.name))?;
            }
        }
        tx.commit()
            .with_context(|| format!("Committing '{}'", schema.name))?;
        info!(
            "Loaded {} row(s) into '{}' ({})",
            frame.len(),
            schema.name.to_lowercase(),
            match mode {
                WriteMode::Append => "append",
                WriteMode::Replace => "replace",
            }
        );
        Ok(frame.len())
    }
}
