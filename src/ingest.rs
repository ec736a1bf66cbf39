//! Raw ingestion of one year's file into a [`Frame`].
//!
//! Three input shapes are supported: delimited text with a header row,
//! delimited text preceded by an undocumented number of preamble lines (the
//! header is located by scanning for a sentinel column name), and
//! fixed-width text sliced through a resolved [`LayoutSpec`]. Header-less
//! delimited years take their column names from the override table.
//!
//! Every cell is trimmed; blank cells and declared missing tokens become
//! absent. Columns without a declared type are read as text so that
//! identifiers keep their leading zeros. In count columns the NCES reporting
//! codes are kept verbatim so value normalization can tell "missing" from
//! "not applicable".

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::Path,
};

use anyhow::{Context, Result, bail};
use log::{debug, info};

use crate::{
    data::{Value, parse_typed_value},
    error::HarmonizeError,
    frame::Frame,
    io_utils::{open_csv_reader, printable_delimiter, read_decoded, resolve_encoding},
    layout::{LayoutSpec, strip_year_suffix},
    schema::ColumnType,
    values::REPORTING_CODES,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SourceFormat {
    Delimited { delimiter: u8 },
    FixedWidth(LayoutSpec),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOptions {
    pub encoding: Option<String>,
    /// Column name that marks the header row of a delimited file.
    pub header_sentinel: Option<String>,
    /// Column names for delimited files that ship without a header row.
    pub headers: Option<Vec<String>>,
    pub uppercase_headers: bool,
    pub strip_year_suffix: bool,
    pub rstrip_lines: bool,
    pub comment_prefix: Option<String>,
    pub column_types: BTreeMap<String, ColumnType>,
    pub missing_tokens: BTreeMap<String, Vec<String>>,
    /// Raw count columns; reporting codes in them bypass typing and missing
    /// tokens.
    pub count_columns: BTreeSet<String>,
}

pub fn read_table(
    path: &Path,
    year: i32,
    format: &SourceFormat,
    options: &IngestOptions,
) -> Result<Frame> {
    let encoding = resolve_encoding(options.encoding.as_deref())?;
    let text = read_decoded(path, encoding)?;
    let frame = match format {
        SourceFormat::Delimited { delimiter } => {
            debug!(
                "Reading {path:?} ({year}) as delimited text with '{}'",
                printable_delimiter(*delimiter)
            );
            read_delimited(path, year, &text, *delimiter, options)?
        }
        SourceFormat::FixedWidth(layout) => {
            debug!(
                "Reading {path:?} ({year}) as fixed-width text with {} field(s)",
                layout.entries.len()
            );
            read_fixed_width(path, &text, layout, options)?
        }
    };
    info!(
        "Read {} row(s) x {} column(s) from {path:?} ({year})",
        frame.len(),
        frame.columns().len()
    );
    Ok(frame)
}

fn normalize_header(raw: &str, year: i32, options: &IngestOptions) -> String {
    let mut name = raw.trim().trim_matches('"').trim().to_string();
    if options.uppercase_headers {
        name = name.to_ascii_uppercase();
    }
    if options.strip_year_suffix {
        name = strip_year_suffix(&name, year).to_string();
    }
    name
}

fn prepared_lines<'a>(text: &'a str, options: &IngestOptions) -> Vec<&'a str> {
    text.lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .map(|line| {
            if options.rstrip_lines {
                line.trim_end()
            } else {
                line
            }
        })
        .collect()
}

fn read_delimited(
    path: &Path,
    year: i32,
    text: &str,
    delimiter: u8,
    options: &IngestOptions,
) -> Result<Frame> {
    let lines = prepared_lines(text, options);
    let explicit_headers = options.headers.is_some();

    let skip = match (&options.headers, &options.header_sentinel) {
        (None, Some(sentinel)) => lines
            .iter()
            .position(|line| {
                line_fields(line, delimiter)
                    .iter()
                    .any(|field| normalize_header(field, year, options) == *sentinel)
            })
            .ok_or_else(|| HarmonizeError::HeaderSentinelNotFound {
                sentinel: sentinel.clone(),
            })
            .with_context(|| format!("Scanning {path:?} for its header row"))?,
        _ => 0,
    };
    if skip > 0 {
        debug!("Skipping {skip} preamble line(s) in {path:?}");
    }
    let body = lines[skip..].join("\n");

    let mut reader = open_csv_reader(body.as_bytes(), delimiter, !explicit_headers);
    let columns: Vec<String> = match &options.headers {
        Some(headers) => headers
            .iter()
            .map(|h| normalize_header(h, year, options))
            .collect(),
        None => reader
            .headers()
            .with_context(|| format!("Reading header row from {path:?}"))?
            .iter()
            .map(|h| normalize_header(h, year, options))
            .collect(),
    };
    ensure_distinct(&columns, path)?;

    let mut cells = CellParser::new(&columns, options);
    let mut frame = Frame::new(columns.clone());
    for record in reader.records() {
        let record = record.map_err(|err| column_count_error(err, path, skip, columns.len()))?;
        if record.len() != columns.len() {
            let line = record.position().map(|p| p.line() as usize).unwrap_or(0);
            return Err(HarmonizeError::ColumnCount {
                path: path.display().to_string(),
                line: line + skip,
                expected: columns.len(),
                found: record.len(),
            }
            .into());
        }
        let row = record
            .iter()
            .enumerate()
            .map(|(idx, token)| cells.parse(idx, token))
            .collect::<Result<Vec<_>>>()?;
        frame.push_row(row)?;
    }
    cells.log_coercions(path);
    Ok(frame)
}

/// Splits one candidate header line with the same quoting rules as the body.
fn line_fields(line: &str, delimiter: u8) -> Vec<String> {
    let mut reader = open_csv_reader(line.as_bytes(), delimiter, false);
    match reader.records().next() {
        Some(Ok(record)) => record.iter().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn column_count_error(err: csv::Error, path: &Path, skip: usize, expected: usize) -> anyhow::Error {
    if let csv::ErrorKind::UnequalLengths { pos, len, .. } = err.kind() {
        let line = pos.as_ref().map(|p| p.line() as usize).unwrap_or(0);
        return HarmonizeError::ColumnCount {
            path: path.display().to_string(),
            line: line + skip,
            expected,
            found: *len as usize,
        }
        .into();
    }
    anyhow::Error::new(err).context(format!("Reading records from {path:?}"))
}

fn read_fixed_width(
    path: &Path,
    text: &str,
    layout: &LayoutSpec,
    options: &IngestOptions,
) -> Result<Frame> {
    let columns = layout.variables();
    ensure_distinct(&columns, path)?;
    let last_start = layout.entries.last().map(|e| e.start).unwrap_or(0);
    let record_width = layout.record_width();

    let mut cells = CellParser::new(&columns, options);
    let mut frame = Frame::new(columns.clone());
    for (idx, line) in prepared_lines(text, options).into_iter().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(prefix) = &options.comment_prefix
            && line.starts_with(prefix.as_str())
        {
            debug!("Skipping comment line {line_no} in {path:?}");
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= last_start {
            return Err(HarmonizeError::FixedWidthRecord {
                path: path.display().to_string(),
                line: line_no,
                detail: format!(
                    "{} character(s), but the last field starts at column {}",
                    chars.len(),
                    last_start + 1
                ),
            }
            .into());
        }
        if chars.len() > record_width && chars[record_width..].iter().any(|c| !c.is_whitespace())
        {
            return Err(HarmonizeError::FixedWidthRecord {
                path: path.display().to_string(),
                line: line_no,
                detail: format!("content beyond column {record_width}"),
            }
            .into());
        }
        let row = layout
            .entries
            .iter()
            .enumerate()
            .map(|(col, entry)| {
                let end = entry.end.min(chars.len());
                let token: String = chars[entry.start.min(end)..end].iter().collect();
                cells.parse(col, &token)
            })
            .collect::<Result<Vec<_>>>()?;
        frame.push_row(row)?;
    }
    cells.log_coercions(path);
    Ok(frame)
}

fn ensure_distinct(columns: &[String], path: &Path) -> Result<()> {
    let mut seen = HashSet::new();
    for column in columns {
        if !seen.insert(column.as_str()) {
            bail!("{path:?} declares column '{column}' more than once");
        }
    }
    Ok(())
}

/// Per-column typed parsing with missing-token handling. Tokens that do not
/// parse under a declared numeric type become absent and are counted.
struct CellParser<'a> {
    columns: &'a [String],
    types: Vec<ColumnType>,
    missing: Vec<Option<&'a [String]>>,
    counts: Vec<bool>,
    coerced: Vec<usize>,
}

impl<'a> CellParser<'a> {
    fn new(columns: &'a [String], options: &'a IngestOptions) -> Self {
        let types = columns
            .iter()
            .map(|c| options.column_types.get(c).copied().unwrap_or(ColumnType::Text))
            .collect();
        let missing = columns
            .iter()
            .map(|c| options.missing_tokens.get(c).map(|tokens| tokens.as_slice()))
            .collect();
        let counts = columns
            .iter()
            .map(|c| options.count_columns.contains(c))
            .collect();
        CellParser {
            columns,
            types,
            missing,
            counts,
            coerced: vec![0; columns.len()],
        }
    }

    fn parse(&mut self, idx: usize, token: &str) -> Result<Option<Value>> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if self.counts[idx] && REPORTING_CODES.contains(&trimmed) {
            return Ok(Some(Value::Text(trimmed.to_string())));
        }
        if let Some(tokens) = self.missing[idx]
            && tokens.iter().any(|t| t == trimmed)
        {
            return Ok(None);
        }
        match parse_typed_value(trimmed, &self.types[idx]) {
            Ok(value) => Ok(value),
            Err(_) => {
                self.coerced[idx] += 1;
                Ok(None)
            }
        }
    }

    fn log_coercions(&self, path: &Path) {
        for (idx, count) in self.coerced.iter().enumerate() {
            if *count > 0 {
                debug!(
                    "{path:?}: {count} token(s) in '{}' did not parse as {} and were read as absent",
                    self.columns[idx], self.types[idx]
                );
            }
        }
    }
}
