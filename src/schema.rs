//! Column types and destination table declarations.
//!
//! [`ColumnType`] is the in-memory semantic type of a canonical column. It is
//! serialized as a lower-case token in the pipeline YAML (`integer`, `text`,
//! ...) and maps onto exactly one SQL storage type through
//! [`ColumnType::sql_type`]. Categorical columns are stored as `TEXT`, not as
//! a constrained enumeration.

use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{data::Value, frame::Frame};

/// SQL words that CCD publishes as column names at one point or another.
/// A canonical column may not keep one of these names.
const SQL_RESERVED_WORDS: &[&str] = &[
    "ALL", "AND", "AS", "BY", "CASE", "CHECK", "COLUMN", "CREATE", "DEFAULT", "DELETE", "DROP",
    "FROM", "GROUP", "IN", "INDEX", "INSERT", "JOIN", "KEY", "LEVEL", "LIMIT", "NAME", "NOT",
    "NULL", "ON", "OR", "ORDER", "PRIMARY", "SELECT", "SET", "TABLE", "TO", "UNION", "UNIQUE",
    "UPDATE", "VALUES", "WEIGHT", "WHERE",
];

pub fn is_sql_reserved(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SQL_RESERVED_WORDS.contains(&upper.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Categorical,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Boolean => "boolean",
            ColumnType::Categorical => "categorical",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &["text", "integer", "real", "boolean", "categorical"]
    }

    /// Destination storage type. Booleans are stored as 0/1 integers.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Categorical => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }

    /// Whether a present cell of this shape may be stored under this type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ColumnType::Text | ColumnType::Categorical, Value::Text(_))
                | (ColumnType::Integer, Value::Integer(_))
                | (ColumnType::Real, Value::Real(_) | Value::Integer(_))
                | (ColumnType::Boolean, Value::Boolean(_))
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "string" | "object" => Ok(ColumnType::Text),
            "integer" | "int" | "int64" => Ok(ColumnType::Integer),
            "real" | "float" | "float64" | "double" => Ok(ColumnType::Real),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "categorical" | "category" => Ok(ColumnType::Categorical),
            _ => Err(anyhow!(
                "Unknown column type '{value}'. Supported types: {}",
                ColumnType::variants().join(", ")
            )),
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        ColumnType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub datatype: ColumnType,
}

/// Declaration of one destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Columns that identify a row; the loader turns them into a `UNIQUE`
    /// constraint so that appending a rerun fails instead of duplicating.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
}

impl TableSchema {
    /// Builds a declaration for `frame`, using `declared` where present and
    /// inferring the rest from the cells: all integers -> integer, any real ->
    /// real, all booleans -> boolean, otherwise text.
    pub fn infer(
        name: &str,
        frame: &Frame,
        declared: &BTreeMap<String, ColumnType>,
        key: &[String],
    ) -> Self {
        let columns = frame
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, column)| {
                let datatype = declared
                    .get(column)
                    .copied()
                    .unwrap_or_else(|| infer_column_type(frame, idx));
                ColumnDef {
                    name: column.clone(),
                    datatype,
                }
            })
            .collect();
        TableSchema {
            name: name.to_string(),
            columns,
            key: key.to_vec(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }
}

fn infer_column_type(frame: &Frame, idx: usize) -> ColumnType {
    let mut saw_integer = false;
    let mut saw_real = false;
    let mut saw_boolean = false;
    let mut saw_text = false;
    for row in frame.rows() {
        match row.get(idx).and_then(|cell| cell.as_ref()) {
            Some(Value::Integer(_)) => saw_integer = true,
            Some(Value::Real(_)) => saw_real = true,
            Some(Value::Boolean(_)) => saw_boolean = true,
            Some(Value::Text(_)) => saw_text = true,
            None => {}
        }
    }
    match (saw_text, saw_boolean, saw_real, saw_integer) {
        (false, false, true, _) => ColumnType::Real,
        (false, false, false, true) => ColumnType::Integer,
        (false, true, false, false) => ColumnType::Boolean,
        _ => ColumnType::Text,
    }
}
