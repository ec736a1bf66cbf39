//! Fatal error taxonomy.
//!
//! Anything in here aborts the current stage. Value-domain problems (free
//! text in a count column, unexpected sentinels) are never raised as errors;
//! they are coerced to absent and counted in a [`crate::values::ValueReport`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarmonizeError {
    #[error("{path}: cannot decode input as {encoding}")]
    Encoding { path: String, encoding: String },

    #[error("{path}: line {line} has {found} field(s) but the header declares {expected}")]
    ColumnCount {
        path: String,
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("{path}: line {line} does not fit the fixed-width layout ({detail})")]
    FixedWidthRecord {
        path: String,
        line: usize,
        detail: String,
    },

    #[error("header sentinel '{sentinel}' not found")]
    HeaderSentinelNotFound { sentinel: String },

    #[error("layout line {line}: {detail}")]
    LayoutParse { line: usize, detail: String },

    #[error("layout field '{field}' ({start}..{end}) overlaps or precedes '{previous}' (ends at {previous_end})")]
    LayoutOverlap {
        field: String,
        start: usize,
        end: usize,
        previous: String,
        previous_end: usize,
    },

    #[error("unknown {dimension} code '{code}' in packed key '{key}'")]
    UnknownCategoryCode {
        dimension: &'static str,
        code: String,
        key: String,
    },

    #[error("end year {year}: columns with no canonical mapping: {columns:?}")]
    UnmappedColumns { year: i32, columns: Vec<String> },

    #[error("column '{column}' collides with a SQL reserved word and has no disambiguated name")]
    ReservedColumnName { column: String },

    #[error("end year {year}: column set differs from end year {baseline_year} (missing {missing:?}, extra {extra:?})")]
    ColumnSetMismatch {
        year: i32,
        baseline_year: i32,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("duplicate key {key:?} for columns {columns:?}")]
    DuplicateKey {
        columns: Vec<String>,
        key: Vec<String>,
    },

    #[error("reconciliation would drop {dropped} of {total} row(s) ({rate:.4} > {limit:.4})")]
    ExcessiveLoss {
        dropped: usize,
        total: usize,
        rate: f64,
        limit: f64,
    },

    #[error("pivot conflict: {detail}")]
    PivotConflict { detail: String },

    #[error("column '{column}' declared {declared} but holds {found}")]
    TypeMismatch {
        column: String,
        declared: String,
        found: String,
    },
}
