//! Column harmonization.
//!
//! A [`HarmonizePlan`] names every canonical column of a family and, for
//! each, the raw source columns it may come from in priority order, each
//! optionally limited to a set of years. For a given year the harmonized
//! value is the first non-missing source value in that order. Columns the
//! plan drops are removed first; every remaining raw column must feed some
//! canonical column, otherwise the year is rejected (or, when the plan says
//! so, the stray columns are dropped).
//!
//! The output frame carries exactly the canonical columns in plan order, so
//! every year of a family leaves this stage with the same column set.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    data::Value,
    error::HarmonizeError,
    frame::Frame,
    overrides::YearSet,
    schema::is_sql_reserved,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceColumn {
    Name(String),
    Limited { column: String, years: YearSet },
}

impl SourceColumn {
    pub fn column(&self) -> &str {
        match self {
            SourceColumn::Name(column) => column,
            SourceColumn::Limited { column, .. } => column,
        }
    }

    pub fn applies_to(&self, year: i32) -> bool {
        match self {
            SourceColumn::Name(_) => true,
            SourceColumn::Limited { years, .. } => years.contains(year),
        }
    }
}

/// One canonical column. The canonical name is itself the first candidate
/// source unless it is listed explicitly among `sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalColumn {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<SourceColumn>,
}

impl CanonicalColumn {
    fn candidates(&self, year: i32) -> Vec<&str> {
        let mut candidates = Vec::new();
        if !self.sources.iter().any(|s| s.column() == self.name) {
            candidates.push(self.name.as_str());
        }
        candidates.extend(
            self.sources
                .iter()
                .filter(|source| source.applies_to(year))
                .map(SourceColumn::column),
        );
        candidates
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedSum {
    pub column: String,
    pub addends: Vec<String>,
    #[serde(default)]
    pub years: Option<YearSet>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedPolicy {
    #[default]
    Error,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonizePlan {
    pub columns: Vec<CanonicalColumn>,
    pub drop: Vec<String>,
    /// Regexes over raw column names.
    pub drop_patterns: Vec<String>,
    /// Regexes over layout descriptions of fixed-width years; matching
    /// variables are dropped.
    pub drop_described: Vec<String>,
    pub reserved_renames: BTreeMap<String, String>,
    pub derived_sums: Vec<DerivedSum>,
    pub unmapped: UnmappedPolicy,
}

impl Default for HarmonizePlan {
    fn default() -> Self {
        HarmonizePlan {
            columns: Vec::new(),
            drop: Vec::new(),
            drop_patterns: Vec::new(),
            drop_described: Vec::new(),
            reserved_renames: default_reserved_renames(),
            derived_sums: Vec::new(),
            unmapped: UnmappedPolicy::Error,
        }
    }
}

pub fn default_reserved_renames() -> BTreeMap<String, String> {
    [
        ("UNION", "UNION_CODE"),
        ("LEVEL", "SCHOOL_LEVEL"),
        ("NAME", "DISTRICT_NAME"),
        ("WEIGHT", "DISTRICT_WEIGHT"),
    ]
    .into_iter()
    .map(|(from, to)| (from.to_string(), to.to_string()))
    .collect()
}

impl HarmonizePlan {
    /// Canonical names after reserved-word disambiguation, in plan order.
    pub fn output_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| self.output_name(&column.name))
            .collect()
    }

    fn output_name(&self, name: &str) -> String {
        self.reserved_renames
            .get(&name.to_ascii_uppercase())
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Raw names that can feed the given output columns in `year`.
    pub fn source_columns(&self, outputs: &[String], year: i32) -> BTreeSet<String> {
        self.columns
            .iter()
            .filter(|column| outputs.contains(&self.output_name(&column.name)))
            .flat_map(|column| column.candidates(year))
            .map(str::to_string)
            .collect()
    }

    fn compiled_drop_patterns(&self) -> Result<Vec<Regex>> {
        self.drop_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("Compiling drop pattern '{pattern}'"))
            })
            .collect()
    }
}

/// Removes the plan's dropped columns (by name or pattern) plus `extra`.
/// Returns the removed names.
pub fn apply_drops(frame: &mut Frame, plan: &HarmonizePlan, extra: &[String]) -> Result<Vec<String>> {
    let patterns = plan.compiled_drop_patterns()?;
    let doomed: Vec<String> = frame
        .columns()
        .iter()
        .filter(|column| {
            plan.drop.contains(column)
                || extra.contains(column)
                || patterns.iter().any(|p| p.is_match(column))
        })
        .cloned()
        .collect();
    Ok(frame.drop_columns(&doomed))
}

/// Harmonizes one year's frame into the plan's canonical columns.
pub fn harmonize(mut frame: Frame, year: i32, plan: &HarmonizePlan) -> Result<Frame> {
    let dropped = apply_drops(&mut frame, plan, &[])?;
    if !dropped.is_empty() {
        debug!("{year}: dropped {} column(s): {dropped:?}", dropped.len());
    }

    let mut consumed: HashSet<&str> = HashSet::new();
    let mut sources_per_column = Vec::with_capacity(plan.columns.len());
    for canonical in &plan.columns {
        let indexes: Vec<usize> = canonical
            .candidates(year)
            .into_iter()
            .filter_map(|candidate| {
                let idx = frame.column_index(candidate)?;
                consumed.insert(candidate);
                Some(idx)
            })
            .collect();
        if indexes.is_empty() {
            debug!("{year}: '{}' has no source and will be absent", canonical.name);
        }
        sources_per_column.push(indexes);
    }

    let unmapped: Vec<String> = frame
        .columns()
        .iter()
        .filter(|column| !consumed.contains(column.as_str()))
        .cloned()
        .collect();
    if !unmapped.is_empty() {
        match plan.unmapped {
            UnmappedPolicy::Error => {
                return Err(HarmonizeError::UnmappedColumns {
                    year,
                    columns: unmapped,
                }
                .into());
            }
            UnmappedPolicy::Drop => {
                debug!("{year}: discarding unmapped column(s) {unmapped:?}");
            }
        }
    }

    let columns = plan.output_columns();
    for column in &columns {
        if is_sql_reserved(column) {
            return Err(HarmonizeError::ReservedColumnName {
                column: column.clone(),
            }
            .into());
        }
    }
    let mut seen = BTreeSet::new();
    for column in &columns {
        if !seen.insert(column.as_str()) {
            bail!("Harmonize plan yields column '{column}' twice");
        }
    }

    let rows = frame
        .rows()
        .iter()
        .map(|row| {
            sources_per_column
                .iter()
                .map(|indexes| indexes.iter().find_map(|idx| row[*idx].clone()))
                .collect()
        })
        .collect();
    let harmonized = Frame::from_rows(columns, rows)?;
    info!(
        "{year}: harmonized {} row(s) into {} canonical column(s)",
        harmonized.len(),
        harmonized.columns().len()
    );
    Ok(harmonized)
}

/// Fills each derived column with the sum of its addends for the years the
/// sum applies to. Rows missing any addend keep their current value. Runs
/// after value normalization so that sentinel codes never enter a sum.
pub fn apply_derived_sums(frame: &mut Frame, year: i32, sums: &[DerivedSum]) -> Result<usize> {
    let mut filled = 0;
    for sum in sums {
        if !sum.years.as_ref().is_none_or(|years| years.contains(year)) {
            continue;
        }
        let Some(target) = frame.column_index(&sum.column) else {
            bail!("Derived column '{}' is not a canonical column", sum.column);
        };
        let addends = sum
            .addends
            .iter()
            .map(|addend| match frame.column_index(addend) {
                Some(idx) => Ok(idx),
                None => bail!("Addend '{addend}' of '{}' is not a canonical column", sum.column),
            })
            .collect::<Result<Vec<_>>>()?;
        for row in frame.rows_mut() {
            let cells: Option<Vec<&Value>> = addends.iter().map(|idx| row[*idx].as_ref()).collect();
            let Some(cells) = cells else {
                continue;
            };
            let total = if cells.iter().all(|cell| matches!(cell, Value::Integer(_))) {
                cells.iter().try_fold(0i64, |acc, cell| match cell {
                    Value::Integer(i) => acc.checked_add(*i),
                    _ => None,
                })
                .map(Value::Integer)
            } else {
                cells
                    .iter()
                    .map(|cell| cell.as_f64())
                    .sum::<Option<f64>>()
                    .map(Value::Real)
            };
            if let Some(total) = total {
                row[target] = Some(total);
                filled += 1;
            }
        }
        debug!("{year}: derived '{}' for {filled} row(s)", sum.column);
    }
    Ok(filled)
}
