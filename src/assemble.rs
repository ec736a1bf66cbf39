//! Cross-year assembly.
//!
//! Harmonized years of one family are stacked into a single frame keyed by
//! `END_YEAR`, after checking that they agree on their column set.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, bail};
use log::info;

use crate::{
    data::{Value, render_cell},
    error::HarmonizeError,
    frame::Frame,
};

pub const END_YEAR_COLUMN: &str = "END_YEAR";

/// Concatenates harmonized years into one longitudinal frame.
///
/// Every year must carry exactly the column set of the earliest year; a
/// year whose columns come in a different order is realigned to the
/// baseline. `END_YEAR` is prepended and rows appear in ascending year
/// order, each year's rows in their original order.
pub fn assemble(mut years: Vec<(i32, Frame)>) -> Result<Frame> {
    if years.is_empty() {
        bail!("Nothing to assemble: no years were harmonized");
    }
    years.sort_by_key(|(year, _)| *year);
    for pair in years.windows(2) {
        if pair[0].0 == pair[1].0 {
            bail!("End year {} was harmonized twice", pair[0].0);
        }
    }

    let (baseline_year, baseline_columns) = (years[0].0, years[0].1.columns().to_vec());
    let baseline_set: BTreeSet<&str> = baseline_columns.iter().map(String::as_str).collect();
    if baseline_set.contains(END_YEAR_COLUMN) {
        bail!("Harmonized frames may not carry their own '{END_YEAR_COLUMN}' column");
    }

    let mut columns = Vec::with_capacity(baseline_columns.len() + 1);
    columns.push(END_YEAR_COLUMN.to_string());
    columns.extend(baseline_columns.iter().cloned());
    let mut assembled = Frame::new(columns);

    for (year, frame) in years {
        let year_set: BTreeSet<&str> = frame.columns().iter().map(String::as_str).collect();
        if year_set != baseline_set {
            return Err(HarmonizeError::ColumnSetMismatch {
                year,
                baseline_year,
                missing: baseline_set
                    .difference(&year_set)
                    .map(|c| c.to_string())
                    .collect(),
                extra: year_set
                    .difference(&baseline_set)
                    .map(|c| c.to_string())
                    .collect(),
            }
            .into());
        }
        let aligned = if frame.columns() == baseline_columns.as_slice() {
            frame
        } else {
            frame.select(&baseline_columns)?
        };
        let count = aligned.len();
        let rows = aligned
            .into_rows()
            .into_iter()
            .map(|row| {
                let mut tagged = Vec::with_capacity(row.len() + 1);
                tagged.push(Some(Value::Integer(i64::from(year))));
                tagged.extend(row);
                tagged
            })
            .collect();
        assembled.extend_rows(rows)?;
        info!("Assembled end year {year}: {count} row(s)");
    }
    Ok(assembled)
}

/// Fails on the first repeated combination of `key_columns`.
pub fn ensure_unique(frame: &Frame, key_columns: &[String]) -> Result<()> {
    if key_columns.is_empty() {
        return Ok(());
    }
    let indexes = key_columns
        .iter()
        .map(|column| match frame.column_index(column) {
            Some(idx) => Ok(idx),
            None => bail!("Key column '{column}' not found"),
        })
        .collect::<Result<Vec<_>>>()?;
    let mut seen: HashMap<Vec<String>, usize> = HashMap::with_capacity(frame.len());
    for (row_idx, row) in frame.rows().iter().enumerate() {
        let key: Vec<String> = indexes
            .iter()
            .map(|idx| render_cell(row[*idx].as_ref()))
            .collect();
        if seen.insert(key.clone(), row_idx).is_some() {
            return Err(HarmonizeError::DuplicateKey {
                columns: key_columns.to_vec(),
                key,
            }
            .into());
        }
    }
    Ok(())
}
