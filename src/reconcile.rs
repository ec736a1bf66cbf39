//! Identifier reconciliation.
//!
//! Some years publish rows without the primary district identifier. Those
//! rows are repaired in three passes before anything is dropped:
//!
//! 1. name propagation: rows sharing an (upper-cased) entity name, and any
//!    configured scope columns, form a group; a missing identifier takes the
//!    nearest earlier identifier of its group, failing that the nearest
//!    later one;
//! 2. secondary-key backfill: a secondary identifier that maps to exactly
//!    one primary identifier elsewhere in the data fills the gap, ambiguous
//!    secondaries are left alone;
//! 3. name propagation again, to spread what pass 2 recovered.
//!
//! Rows still without a primary identifier are dropped, provided the share
//! dropped stays within the configured loss rate.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    assemble::END_YEAR_COLUMN,
    config::ReconcileConfig,
    data::{Value, render_cell},
    error::HarmonizeError,
    frame::Frame,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub total: usize,
    pub missing_before: usize,
    pub filled_by_name: usize,
    pub filled_by_secondary: usize,
    pub ambiguous_secondaries: usize,
    pub dropped: usize,
    pub loss_rate: f64,
}

struct Columns {
    primary: usize,
    secondary: usize,
    name: usize,
    scope: Vec<usize>,
}

fn locate(frame: &Frame, column: &str) -> Result<usize> {
    match frame.column_index(column) {
        Some(idx) => Ok(idx),
        None => bail!("Reconciliation column '{column}' not found"),
    }
}

fn is_missing(cell: &Option<Value>) -> bool {
    match cell {
        None => true,
        Some(Value::Text(text)) => text.trim().is_empty(),
        Some(_) => false,
    }
}

/// Row indexes in ascending end-year order, ties in row order.
fn year_order(frame: &Frame) -> Vec<usize> {
    let mut order: Vec<usize> = (0..frame.len()).collect();
    if let Some(year_idx) = frame.column_index(END_YEAR_COLUMN) {
        let rows = frame.rows();
        order.sort_by_key(|idx| {
            rows[*idx][year_idx]
                .as_ref()
                .and_then(Value::as_f64)
                .map(|year| year as i64)
        });
    }
    order
}

/// Fills missing primaries from the nearest non-missing member of the same
/// name group. Returns the number of cells filled.
fn propagate_by_name(frame: &mut Frame, columns: &Columns, order: &[usize]) -> usize {
    let mut groups: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for &row_idx in order {
        let row = &frame.rows()[row_idx];
        let Some(name) = row[columns.name].as_ref().map(|v| v.as_display().trim().to_uppercase())
        else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let mut key = vec![name];
        key.extend(columns.scope.iter().map(|idx| render_cell(row[*idx].as_ref())));
        groups.entry(key).or_default().push(row_idx);
    }

    let mut filled = 0;
    let rows = frame.rows_mut();
    for members in groups.values() {
        let known: Vec<Option<Value>> = members
            .iter()
            .map(|idx| {
                let cell = &rows[*idx][columns.primary];
                if is_missing(cell) { None } else { cell.clone() }
            })
            .collect();
        if known.iter().all(Option::is_some) || known.iter().all(Option::is_none) {
            continue;
        }
        let mut forward = Vec::with_capacity(known.len());
        let mut last = None;
        for cell in &known {
            if cell.is_some() {
                last = cell.clone();
            }
            forward.push(last.clone());
        }
        let mut next = None;
        for pos in (0..known.len()).rev() {
            if known[pos].is_some() {
                next = known[pos].clone();
            }
            if known[pos].is_none() {
                let value = forward[pos].clone().or_else(|| next.clone());
                if value.is_some() {
                    rows[members[pos]][columns.primary] = value;
                    filled += 1;
                }
            }
        }
    }
    filled
}

/// Fills missing primaries through secondaries that map to exactly one
/// primary. Returns `(filled, ambiguous secondaries)`.
fn backfill_by_secondary(frame: &mut Frame, columns: &Columns) -> (usize, usize) {
    let mut candidates: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in frame.rows() {
        let (Some(secondary), Some(primary)) = (&row[columns.secondary], &row[columns.primary])
        else {
            continue;
        };
        if is_missing(&row[columns.primary]) || is_missing(&row[columns.secondary]) {
            continue;
        }
        let entry = candidates.entry(secondary.as_display()).or_default();
        if !entry.contains(primary) {
            entry.push(primary.clone());
        }
    }
    let ambiguous = candidates.values().filter(|ids| ids.len() > 1).count();
    if ambiguous > 0 {
        debug!("{ambiguous} secondary identifier(s) map to several primaries and are ignored");
    }

    let mut filled = 0;
    for row in frame.rows_mut() {
        if !is_missing(&row[columns.primary]) {
            continue;
        }
        let Some(secondary) = row[columns.secondary].as_ref() else {
            continue;
        };
        if let Some([primary]) = candidates.get(&secondary.as_display()).map(Vec::as_slice) {
            row[columns.primary] = Some(primary.clone());
            filled += 1;
        }
    }
    (filled, ambiguous)
}

pub fn reconcile(mut frame: Frame, config: &ReconcileConfig) -> Result<(Frame, ReconcileReport)> {
    let columns = Columns {
        primary: locate(&frame, &config.primary)?,
        secondary: locate(&frame, &config.secondary)?,
        name: locate(&frame, &config.name)?,
        scope: config
            .scope
            .iter()
            .map(|column| locate(&frame, column))
            .collect::<Result<_>>()?,
    };
    let missing_count = |frame: &Frame| {
        frame
            .rows()
            .iter()
            .filter(|row| is_missing(&row[columns.primary]))
            .count()
    };

    let mut report = ReconcileReport {
        total: frame.len(),
        missing_before: missing_count(&frame),
        ..Default::default()
    };
    if report.missing_before > 0 {
        let order = year_order(&frame);
        report.filled_by_name = propagate_by_name(&mut frame, &columns, &order);
        let (filled, ambiguous) = backfill_by_secondary(&mut frame, &columns);
        report.filled_by_secondary = filled;
        report.ambiguous_secondaries = ambiguous;
        report.filled_by_name += propagate_by_name(&mut frame, &columns, &order);
    }

    report.dropped = missing_count(&frame);
    report.loss_rate = if report.total == 0 {
        0.0
    } else {
        report.dropped as f64 / report.total as f64
    };
    if report.loss_rate > config.max_loss_rate {
        warn!(
            "Reconciliation of '{}' would drop {} of {} row(s) ({:.4}), above {:.4}",
            config.primary, report.dropped, report.total, report.loss_rate, config.max_loss_rate
        );
        return Err(HarmonizeError::ExcessiveLoss {
            dropped: report.dropped,
            total: report.total,
            rate: report.loss_rate,
            limit: config.max_loss_rate,
        }
        .into());
    }

    frame.retain_rows(|row| !is_missing(&row[columns.primary]));
    info!(
        "Reconciled '{}': {} missing, {} filled by name, {} by '{}', {} dropped ({:.4})",
        config.primary,
        report.missing_before,
        report.filled_by_name,
        report.filled_by_secondary,
        config.secondary,
        report.dropped,
        report.loss_rate
    );
    Ok((frame, report))
}
