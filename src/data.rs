use std::fmt;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

/// One cell of a harmonized table. Absence is modelled as `Option::None`
/// around a `Value`, never as a zero or an empty string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
}

impl Eq for Value {}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view used by the value normalizer; text is parsed leniently
    /// (surrounding whitespace, a trailing `.0`).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            Value::Boolean(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Boolean(_) => "boolean",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// Renders an optional cell for keys and fingerprints. Absent cells render
/// as an empty string, which never collides with a present text value
/// because ingestion maps blank tokens to absent.
pub fn render_cell(cell: Option<&Value>) -> String {
    cell.map(Value::as_display).unwrap_or_default()
}

/// Strict typed parse used for declared column types at ingestion time.
pub fn parse_typed_value(value: &str, ty: &ColumnType) -> Result<Option<Value>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = match ty {
        ColumnType::Text | ColumnType::Categorical => Value::Text(trimmed.to_string()),
        ColumnType::Integer => {
            let parsed = parse_integer_token(trimmed)
                .with_context(|| format!("Failed to parse '{value}' as integer"))?;
            Value::Integer(parsed)
        }
        ColumnType::Real => {
            let parsed: f64 = trimmed
                .parse()
                .with_context(|| format!("Failed to parse '{value}' as real"))?;
            if !parsed.is_finite() {
                bail!("Failed to parse '{value}' as real");
            }
            Value::Real(parsed)
        }
        ColumnType::Boolean => {
            let parsed = match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => bail!("Failed to parse '{value}' as boolean"),
            };
            Value::Boolean(parsed)
        }
    };
    Ok(Some(parsed))
}

/// Integers in legacy files sometimes carry a `.0` suffix (`"1234.0"`);
/// anything with a real fractional part is rejected.
pub fn parse_integer_token(token: &str) -> Result<i64> {
    if let Ok(parsed) = token.parse::<i64>() {
        return Ok(parsed);
    }
    let real: f64 = token.parse()?;
    if real.is_finite() && real.fract() == 0.0 && real.abs() < 9.0e15 {
        Ok(real as i64)
    } else {
        bail!("'{token}' is not an integral value")
    }
}
