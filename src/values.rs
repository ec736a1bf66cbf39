//! Value normalization.
//!
//! Legacy files mix real counts with reporting codes: `-1`/`M` for missing,
//! `-2`/`N` for not applicable, other negatives and free text for whatever
//! the submitting agency typed. None of that is ever stored as a number.
//! Every non-count becomes absent and the reason is kept in a [`DmsFlag`].

use std::{collections::BTreeMap, fmt};

use anyhow::{Context, Result, bail};
use log::debug;
use serde::Serialize;

use crate::{data::Value, frame::Frame};

/// Raw tokens that carry a reporting status rather than a count.
pub const REPORTING_CODES: [&str; 4] = ["M", "N", "-1", "-2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DmsFlag {
    Reported,
    Missing,
    NotApplicable,
    Anomalous,
}

impl DmsFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmsFlag::Reported => "Reported",
            DmsFlag::Missing => "Missing",
            DmsFlag::NotApplicable => "Not applicable",
            DmsFlag::Anomalous => "Anomalous",
        }
    }
}

impl fmt::Display for DmsFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCount {
    pub value: Option<Value>,
    pub flag: DmsFlag,
}

impl NormalizedCount {
    fn absent(flag: DmsFlag) -> Self {
        NormalizedCount { value: None, flag }
    }
}

/// Normalizes one raw count cell.
///
/// With `integer` set, a value with a fractional part is anomalous and an
/// integral real is stored as an integer.
pub fn normalize_count(cell: Option<&Value>, integer: bool) -> NormalizedCount {
    let number = match cell {
        None => return NormalizedCount::absent(DmsFlag::Missing),
        Some(Value::Boolean(_)) => return NormalizedCount::absent(DmsFlag::Anomalous),
        Some(Value::Integer(i)) => Number::Integer(*i),
        Some(Value::Real(f)) => Number::Real(*f),
        Some(Value::Text(text)) => match text.trim() {
            "" | "M" => return NormalizedCount::absent(DmsFlag::Missing),
            "N" => return NormalizedCount::absent(DmsFlag::NotApplicable),
            token => match Number::parse(token) {
                Some(number) => number,
                None => return NormalizedCount::absent(DmsFlag::Anomalous),
            },
        },
    };

    let magnitude = number.as_f64();
    if magnitude == -1.0 {
        return NormalizedCount::absent(DmsFlag::Missing);
    }
    if magnitude == -2.0 {
        return NormalizedCount::absent(DmsFlag::NotApplicable);
    }
    if magnitude < 0.0 || !magnitude.is_finite() {
        return NormalizedCount::absent(DmsFlag::Anomalous);
    }
    let value = match (number, integer) {
        (Number::Integer(i), _) => Value::Integer(i),
        (Number::Real(f), true) if f.fract() == 0.0 && f < 9.0e15 => Value::Integer(f as i64),
        (Number::Real(_), true) => return NormalizedCount::absent(DmsFlag::Anomalous),
        (Number::Real(f), false) => Value::Real(f),
    };
    NormalizedCount {
        value: Some(value),
        flag: DmsFlag::Reported,
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Integer(i64),
    Real(f64),
}

impl Number {
    fn parse(token: &str) -> Option<Number> {
        if let Ok(i) = token.parse::<i64>() {
            return Some(Number::Integer(i));
        }
        token
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Number::Real)
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Real(f) => f,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlagCounts {
    pub reported: usize,
    pub missing: usize,
    pub not_applicable: usize,
    pub anomalous: usize,
}

impl FlagCounts {
    fn record(&mut self, flag: DmsFlag) {
        match flag {
            DmsFlag::Reported => self.reported += 1,
            DmsFlag::Missing => self.missing += 1,
            DmsFlag::NotApplicable => self.not_applicable += 1,
            DmsFlag::Anomalous => self.anomalous += 1,
        }
    }

    pub fn absent(&self) -> usize {
        self.missing + self.not_applicable + self.anomalous
    }
}

/// Per-column tallies of what normalization did to the cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValueReport {
    pub counts: BTreeMap<String, FlagCounts>,
    pub booleans_unmapped: BTreeMap<String, usize>,
    pub text_sentinels: BTreeMap<String, usize>,
}

impl ValueReport {
    pub fn merge(&mut self, other: ValueReport) {
        for (column, counts) in other.counts {
            let entry = self.counts.entry(column).or_default();
            entry.reported += counts.reported;
            entry.missing += counts.missing;
            entry.not_applicable += counts.not_applicable;
            entry.anomalous += counts.anomalous;
        }
        for (column, count) in other.booleans_unmapped {
            *self.booleans_unmapped.entry(column).or_default() += count;
        }
        for (column, count) in other.text_sentinels {
            *self.text_sentinels.entry(column).or_default() += count;
        }
    }
}

/// Normalizes each named count column in place. When `flag_column` is given,
/// exactly one count column may be named and its flags are written to a text
/// column of that name.
///
/// Years that publish their own flag column keep it: a present source flag
/// survives unless it claims `Reported` for a value normalization rejected.
/// Absent source flags are filled with the computed flag.
pub fn normalize_numeric_columns(
    frame: &mut Frame,
    columns: &[String],
    integer_columns: &[String],
    flag_column: Option<&str>,
) -> Result<ValueReport> {
    if flag_column.is_some() && columns.len() != 1 {
        bail!(
            "A flag column records exactly one count column, {} were named",
            columns.len()
        );
    }
    let mut report = ValueReport::default();
    let mut flags = Vec::new();
    for column in columns {
        let integer = integer_columns.contains(column);
        let mut counts = FlagCounts::default();
        let mut column_flags = Vec::with_capacity(frame.len());
        frame
            .map_column(column, |cell| {
                let normalized = normalize_count(cell.as_ref(), integer);
                counts.record(normalized.flag);
                column_flags.push(normalized.flag);
                normalized.value
            })
            .with_context(|| format!("Normalizing counts in '{column}'"))?;
        debug!(
            "'{column}': {} reported, {} missing, {} not applicable, {} anomalous",
            counts.reported, counts.missing, counts.not_applicable, counts.anomalous
        );
        report.counts.insert(column.clone(), counts);
        flags = column_flags;
    }
    let Some(flag_column) = flag_column else {
        return Ok(report);
    };
    if !frame.has_column(flag_column) {
        let values = flags.into_iter().map(flag_cell).collect();
        frame.push_column(flag_column, values)?;
        return Ok(report);
    }
    let mut computed = flags.into_iter();
    let mut kept = 0;
    frame.map_column(flag_column, |source| {
        let flag = computed.next().unwrap_or(DmsFlag::Missing);
        match source {
            Some(value) if keeps_source_flag(&value, flag) => {
                kept += 1;
                Some(value)
            }
            _ => flag_cell(flag),
        }
    })?;
    debug!("'{flag_column}': kept {kept} published flag(s)");
    Ok(report)
}

fn flag_cell(flag: DmsFlag) -> Option<Value> {
    Some(Value::Text(flag.as_str().to_string()))
}

fn keeps_source_flag(source: &Value, computed: DmsFlag) -> bool {
    let Some(text) = source.as_text().map(str::trim) else {
        return false;
    };
    if text.is_empty() {
        return false;
    }
    computed == DmsFlag::Reported || !text.eq_ignore_ascii_case(DmsFlag::Reported.as_str())
}

/// Tri-state lookup shared by every yes/no column. Unmapped tokens are
/// absent, never an error.
pub fn map_boolean(cell: Option<&Value>) -> Option<bool> {
    match cell? {
        Value::Boolean(b) => Some(*b),
        Value::Integer(1) => Some(true),
        Value::Integer(2) => Some(false),
        Value::Real(f) if *f == 1.0 => Some(true),
        Value::Real(f) if *f == 2.0 => Some(false),
        Value::Text(text) => match text.trim() {
            "Yes" | "Y" | "1" => Some(true),
            "No" | "N" | "2" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn normalize_boolean_columns(frame: &mut Frame, columns: &[String]) -> Result<ValueReport> {
    let mut report = ValueReport::default();
    for column in columns {
        let mut unmapped = 0;
        frame.map_column(column, |cell| {
            let mapped = map_boolean(cell.as_ref());
            if mapped.is_none() && cell.is_some() {
                unmapped += 1;
            }
            mapped.map(Value::Boolean)
        })?;
        if unmapped > 0 {
            debug!("'{column}': {unmapped} token(s) had no boolean reading");
        }
        report.booleans_unmapped.insert(column.clone(), unmapped);
    }
    Ok(report)
}

/// Clears text cells equal to one of the column's sentinel tokens.
pub fn apply_text_sentinels(
    frame: &mut Frame,
    sentinels: &BTreeMap<String, Vec<String>>,
) -> Result<ValueReport> {
    let mut report = ValueReport::default();
    for (column, tokens) in sentinels {
        let mut cleared = 0;
        frame.map_column(column, |cell| {
            let sentinel = cell
                .as_ref()
                .and_then(Value::as_text)
                .is_some_and(|text| tokens.iter().any(|t| t == text.trim()));
            if sentinel {
                cleared += 1;
                None
            } else {
                cell
            }
        })?;
        report.text_sentinels.insert(column.clone(), cleared);
    }
    Ok(report)
}

pub fn uppercase_columns(frame: &mut Frame, columns: &[String]) -> Result<()> {
    for column in columns {
        frame.map_column(column, |cell| match cell {
            Some(Value::Text(text)) => Some(Value::Text(text.to_uppercase())),
            other => other,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    #[test]
    fn negative_sentinels_map_to_flags() {
        assert_eq!(
            normalize_count(Some(&Value::Integer(-1)), true),
            NormalizedCount::absent(DmsFlag::Missing)
        );
        assert_eq!(
            normalize_count(Some(&text("-2")), true),
            NormalizedCount::absent(DmsFlag::NotApplicable)
        );
        assert_eq!(
            normalize_count(Some(&Value::Integer(-34000)), true).flag,
            DmsFlag::Anomalous
        );
        assert_eq!(normalize_count(Some(&text("-9")), false).value, None);
    }

    #[test]
    fn letter_codes_and_free_text() {
        assert_eq!(normalize_count(Some(&text("M")), true).flag, DmsFlag::Missing);
        assert_eq!(
            normalize_count(Some(&text("N")), true).flag,
            DmsFlag::NotApplicable
        );
        assert_eq!(
            normalize_count(Some(&text("see note")), true).flag,
            DmsFlag::Anomalous
        );
        assert_eq!(normalize_count(None, true).flag, DmsFlag::Missing);
    }

    #[test]
    fn zero_is_a_real_count() {
        let normalized = normalize_count(Some(&text("0")), true);
        assert_eq!(normalized.value, Some(Value::Integer(0)));
        assert_eq!(normalized.flag, DmsFlag::Reported);
    }

    #[test]
    fn integer_columns_reject_fractions() {
        assert_eq!(
            normalize_count(Some(&text("12.0")), true).value,
            Some(Value::Integer(12))
        );
        assert_eq!(
            normalize_count(Some(&text("12.5")), true).flag,
            DmsFlag::Anomalous
        );
        assert_eq!(
            normalize_count(Some(&text("12.5")), false).value,
            Some(Value::Real(12.5))
        );
    }

    #[test]
    fn published_flags_survive_unless_contradicted() {
        let mut frame = Frame::from_rows(
            vec!["STUDENT_COUNT".into(), "DMS_FLAG".into()],
            vec![
                vec![Some(Value::Integer(12)), Some(text("Derived"))],
                vec![Some(Value::Integer(-1)), Some(text("Reported"))],
                vec![Some(text("N")), None],
                vec![Some(Value::Integer(4)), None],
            ],
        )
        .unwrap();
        let counts = vec!["STUDENT_COUNT".to_string()];
        normalize_numeric_columns(&mut frame, &counts, &counts, Some("DMS_FLAG")).unwrap();
        let flags: Vec<_> = frame.rows().iter().map(|row| row[1].clone()).collect();
        assert_eq!(
            flags,
            vec![
                Some(text("Derived")),
                Some(text("Missing")),
                Some(text("Not applicable")),
                Some(text("Reported")),
            ]
        );
    }

    #[test]
    fn boolean_lookup_is_total() {
        assert_eq!(map_boolean(Some(&text("Yes"))), Some(true));
        assert_eq!(map_boolean(Some(&text("N"))), Some(false));
        assert_eq!(map_boolean(Some(&Value::Integer(1))), Some(true));
        assert_eq!(map_boolean(Some(&Value::Integer(2))), Some(false));
        assert_eq!(map_boolean(Some(&text("Not reported"))), None);
        assert_eq!(map_boolean(Some(&text("maybe"))), None);
        assert_eq!(map_boolean(Some(&Value::Integer(0))), None);
        assert_eq!(map_boolean(None), None);
    }
}
