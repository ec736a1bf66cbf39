//! Plain-text tables for the terminal: resolved layouts and run summaries.

use std::{borrow::Cow, fmt::Write as _};

use crate::{layout::LayoutSpec, pipeline::RunSummary};

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let column_count = headers.len();
    let mut widths = headers.iter().map(|h| display_width(h)).collect::<Vec<_>>();
    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(display_width(cell));
        }
    }
    for width in &mut widths {
        *width = (*width).max(1);
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let separator_widths = widths.iter().map(|w| (*w).max(3)).collect::<Vec<usize>>();
    let separator_cells = separator_widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&separator_cells, &separator_widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

/// One row per layout field, offsets in published (1-based, inclusive)
/// coordinates.
pub fn layout_rows(spec: &LayoutSpec) -> (Vec<String>, Vec<Vec<String>>) {
    let headers = ["variable", "start", "end", "width", "type", "description"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    let rows = spec
        .entries
        .iter()
        .map(|entry| {
            vec![
                entry.variable.clone(),
                (entry.start + 1).to_string(),
                entry.end.to_string(),
                entry.width().to_string(),
                entry.kind.clone().unwrap_or_default(),
                entry.description.clone(),
            ]
        })
        .collect();
    (headers, rows)
}

pub fn summary_rows(summary: &RunSummary) -> (Vec<String>, Vec<Vec<String>>) {
    let headers = ["family", "table", "years", "rows", "anomalous", "dropped ids"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    let rows = summary
        .families
        .iter()
        .map(|family| {
            let anomalous: usize = family.values.counts.values().map(|c| c.anomalous).sum();
            vec![
                family.family.clone(),
                family.table.clone(),
                family.years.len().to_string(),
                family.rows_loaded.to_string(),
                anomalous.to_string(),
                family
                    .reconcile
                    .as_ref()
                    .map(|r| r.dropped.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    (headers, rows)
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let mut cells = Vec::with_capacity(values.len());
    for (idx, value) in values.iter().enumerate().take(widths.len()) {
        let sanitized = sanitize_cell(value);
        let padding = widths[idx].saturating_sub(display_width(&sanitized));
        let mut cell = sanitized.into_owned();
        cell.push_str(&" ".repeat(padding));
        cells.push(cell);
    }
    cells.join("  ").trim_end().to_string()
}

fn display_width(value: &str) -> usize {
    value.chars().count()
}

// Layout descriptions are free text copied from the record layouts.
fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}
