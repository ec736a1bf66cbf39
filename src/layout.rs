//! Record layout resolution for fixed-width years.
//!
//! The publisher's layout documents changed format several times: some years
//! print `start-end` ranges, some print start, end and width as separate
//! columns in varying orders, and most pad with irregular runs of spaces and
//! tabs. Parsing therefore happens in two phases. First a chain of textual
//! passes ([`normalize_layout_text`]) rewrites the document into one
//! comma-separated row per variable. Then the rows from the header sentinel
//! onwards are read positionally using the year's declared column order.
//!
//! Offsets in the documents are 1-based and inclusive. A resolved
//! [`LayoutSpec`] stores 0-based starts and exclusive ends, ready for slicing.

use std::{fmt, str::FromStr};

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HarmonizeError;

/// One column of a normalized layout row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutField {
    Variable,
    Type,
    Start,
    End,
    Width,
    Description,
}

impl LayoutField {
    pub fn default_order() -> Vec<LayoutField> {
        vec![
            LayoutField::Variable,
            LayoutField::Start,
            LayoutField::End,
            LayoutField::Width,
            LayoutField::Type,
            LayoutField::Description,
        ]
    }
}

impl fmt::Display for LayoutField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LayoutField::Variable => "variable",
            LayoutField::Type => "type",
            LayoutField::Start => "start",
            LayoutField::End => "end",
            LayoutField::Width => "width",
            LayoutField::Description => "description",
        };
        f.write_str(label)
    }
}

impl FromStr for LayoutField {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "variable" | "name" => Ok(LayoutField::Variable),
            "type" => Ok(LayoutField::Type),
            "start" => Ok(LayoutField::Start),
            "end" => Ok(LayoutField::End),
            "width" | "size" => Ok(LayoutField::Width),
            "description" => Ok(LayoutField::Description),
            other => Err(anyhow!("Unknown layout column '{other}'")),
        }
    }
}

/// Regex replacement applied to the raw document before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPatch {
    pub pattern: String,
    pub replacement: String,
}

/// Hand correction for one variable, in published (1-based, inclusive)
/// coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutCorrection {
    pub variable: String,
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub end: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutOptions {
    pub column_order: Vec<LayoutField>,
    pub sentinel: String,
    pub text_patches: Vec<TextPatch>,
    pub corrections: Vec<LayoutCorrection>,
    pub recompute_offsets: bool,
    pub strip_year_suffix: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        LayoutOptions {
            column_order: LayoutField::default_order(),
            sentinel: "LEAID".to_string(),
            text_patches: Vec::new(),
            corrections: Vec::new(),
            recompute_offsets: false,
            strip_year_suffix: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutEntry {
    pub variable: String,
    /// 0-based, inclusive.
    pub start: usize,
    /// 0-based, exclusive.
    pub end: usize,
    pub kind: Option<String>,
    pub description: String,
}

impl LayoutEntry {
    pub fn width(&self) -> usize {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutSpec {
    pub year: i32,
    pub entries: Vec<LayoutEntry>,
}

impl LayoutSpec {
    pub fn variables(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.variable.clone()).collect()
    }

    /// End offset of the last field; the minimum meaningful record length.
    pub fn record_width(&self) -> usize {
        self.entries.last().map(|e| e.end).unwrap_or(0)
    }

    pub fn entry(&self, variable: &str) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.variable == variable)
    }

    /// Every field must be non-empty and start at or after the end of the
    /// field before it.
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<&LayoutEntry> = None;
        for entry in &self.entries {
            if entry.end <= entry.start {
                return Err(HarmonizeError::LayoutParse {
                    line: 0,
                    detail: format!(
                        "field '{}' has empty range {}..{}",
                        entry.variable, entry.start, entry.end
                    ),
                }
                .into());
            }
            if let Some(prev) = previous
                && entry.start < prev.end
            {
                return Err(HarmonizeError::LayoutOverlap {
                    field: entry.variable.clone(),
                    start: entry.start,
                    end: entry.end,
                    previous: prev.variable.clone(),
                    previous_end: prev.end,
                }
                .into());
            }
            previous = Some(entry);
        }
        Ok(())
    }

    /// Applies hand corrections, then optionally rebuilds every offset from
    /// the field widths laid end to end. Corrections naming a variable that
    /// is not in the layout are rejected.
    pub fn apply_corrections(
        &mut self,
        corrections: &[LayoutCorrection],
        recompute_offsets: bool,
    ) -> Result<()> {
        for correction in corrections {
            let year = self.year;
            let entry = self
                .entries
                .iter_mut()
                .find(|e| e.variable == correction.variable)
                .ok_or_else(|| HarmonizeError::LayoutParse {
                    line: 0,
                    detail: format!(
                        "correction for {year} names unknown variable '{}'",
                        correction.variable
                    ),
                })?;
            if let Some(start) = correction.start {
                entry.start = published_start(start, &correction.variable)?;
            }
            if let Some(end) = correction.end {
                entry.end = end;
            }
            if let Some(width) = correction.width {
                entry.end = entry.start + width;
            }
            debug!(
                "Layout {year}: corrected '{}' to {}..{}",
                entry.variable, entry.start, entry.end
            );
        }
        if recompute_offsets {
            let mut offset = 0;
            for entry in &mut self.entries {
                let width = entry.width();
                entry.start = offset;
                entry.end = offset + width;
                offset = entry.end;
            }
        }
        Ok(())
    }
}

fn published_start(start: usize, variable: &str) -> Result<usize> {
    start.checked_sub(1).ok_or_else(|| {
        HarmonizeError::LayoutParse {
            line: 0,
            detail: format!("field '{variable}' starts at column 0; published offsets are 1-based"),
        }
        .into()
    })
}

/// Rewrites a raw layout document into comma-separated rows.
///
/// Passes, in order: drop `*` markers, turn range dashes into a separator,
/// drop `+` continuation markers, collapse blank runs into one separator,
/// then discard description continuation lines (those that began with
/// whitespace) and empty lines.
pub fn normalize_layout_text(raw: &str) -> Result<String> {
    let dashes = Regex::new(r"[ \t]*[-–][ \t]*")?;
    let pluses = Regex::new(r"(?m) {2,}\+|^\+")?;
    let blanks = Regex::new(r"[ \t]+")?;

    let text = raw.replace('\r', "").replace('*', "");
    let text = dashes.replace_all(&text, ",");
    let text = pluses.replace_all(&text, "");
    let text = blanks.replace_all(&text, ",");
    Ok(text
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with(','))
        .map(|line| line.trim_end_matches(','))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Index of the first normalized line whose first field is the sentinel
/// variable (optionally carrying a two-digit year suffix).
pub fn find_header_line(normalized: &str, sentinel: &str) -> Result<usize> {
    normalized
        .lines()
        .position(|line| {
            let first = line.split(',').next().unwrap_or("").trim();
            first == sentinel
                || (first.len() == sentinel.len() + 2
                    && first.starts_with(sentinel)
                    && first[sentinel.len()..].bytes().all(|b| b.is_ascii_digit()))
        })
        .ok_or_else(|| {
            HarmonizeError::HeaderSentinelNotFound {
                sentinel: sentinel.to_string(),
            }
            .into()
        })
}

/// Strips the two-digit suffix of the school year's start year
/// (`NAME93` -> `NAME` for end year 1994).
pub fn strip_year_suffix(variable: &str, end_year: i32) -> &str {
    let suffix = format!("{:02}", (end_year - 1).rem_euclid(100));
    match variable.strip_suffix(suffix.as_str()) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => variable,
    }
}

/// Resolves a raw layout document into a validated [`LayoutSpec`].
pub fn resolve_layout(raw: &str, year: i32, options: &LayoutOptions) -> Result<LayoutSpec> {
    let mut text = raw.to_string();
    for patch in &options.text_patches {
        let pattern = Regex::new(&patch.pattern)
            .with_context(|| format!("Compiling layout patch '{}'", patch.pattern))?;
        text = pattern
            .replace_all(&text, patch.replacement.as_str())
            .into_owned();
    }
    let normalized = normalize_layout_text(&text)?;
    let header = find_header_line(&normalized, &options.sentinel)
        .with_context(|| format!("Locating layout header for {year}"))?;

    let mut entries = Vec::new();
    for (offset, line) in normalized.lines().enumerate().skip(header) {
        if offset > header && !is_layout_row(line, &options.column_order) {
            debug!("Layout {year}: skipping line {} ({line})", offset + 1);
            continue;
        }
        let entry = parse_layout_row(line, offset + 1, year, options)?;
        entries.push(entry);
    }
    let mut spec = LayoutSpec { year, entries };
    spec.apply_corrections(&options.corrections, options.recompute_offsets)?;
    spec.validate()
        .with_context(|| format!("Validating layout for {year}"))?;
    debug!("Resolved layout for {year}: {} field(s)", spec.entries.len());
    Ok(spec)
}

/// Variable names listed under `column` in a layout document, for years
/// whose data file ships without a header row. Lines opening with a tab
/// continue a description and are ignored; after `skip_lines` more lines the
/// first non-blank line is the document's own header row.
pub fn layout_names(raw: &str, skip_lines: usize, column: &str) -> Result<Vec<String>> {
    let mut lines = raw
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.starts_with('\t'))
        .skip(skip_lines)
        .filter(|line| !line.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("Layout document ends before its header row"))?;
    let Some(idx) = header.split_whitespace().position(|field| field == column) else {
        bail!("Layout header row has no '{column}' column: {header}");
    };
    let names: Vec<String> = lines
        .filter_map(|line| line.split_whitespace().nth(idx))
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        bail!("Layout document lists no '{column}' values");
    }
    Ok(names)
}

/// Footnotes and trailers share the document with the entries; a row only
/// counts when its start cell is present and every offset cell is numeric.
fn is_layout_row(line: &str, order: &[LayoutField]) -> bool {
    let fields: Vec<&str> = line.split(',').collect();
    let has_start = order
        .iter()
        .position(|field| *field == LayoutField::Start)
        .is_some_and(|idx| idx < fields.len());
    has_start
        && order.iter().enumerate().all(|(idx, field)| match field {
            LayoutField::Start | LayoutField::End | LayoutField::Width => fields
                .get(idx)
                .is_none_or(|token| token.trim().parse::<usize>().is_ok()),
            _ => true,
        })
}

fn parse_layout_row(
    line: &str,
    line_no: usize,
    year: i32,
    options: &LayoutOptions,
) -> Result<LayoutEntry> {
    let fields: Vec<&str> = line.split(',').collect();
    let significant = options.column_order.len();
    let mut variable = None;
    let mut kind = None;
    let mut start = None;
    let mut end = None;
    let mut width = None;
    let mut description = String::new();

    for (idx, field) in options.column_order.iter().enumerate() {
        let Some(token) = fields.get(idx).map(|t| t.trim()) else {
            break;
        };
        match field {
            LayoutField::Variable => variable = Some(token.to_string()),
            LayoutField::Type => kind = Some(token.to_string()).filter(|t| !t.is_empty()),
            LayoutField::Start => start = Some(parse_offset(token, *field, line_no)?),
            LayoutField::End => end = Some(parse_offset(token, *field, line_no)?),
            LayoutField::Width => width = Some(parse_offset(token, *field, line_no)?),
            LayoutField::Description => {
                // Anything past the declared columns is description text that
                // contained separators of its own.
                description = fields[idx..].join(" ");
            }
        }
    }
    if !options.column_order.contains(&LayoutField::Description) && fields.len() > significant {
        description = fields[significant..].join(" ");
    }

    let variable = variable
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HarmonizeError::LayoutParse {
            line: line_no,
            detail: "missing variable name".to_string(),
        })?;
    let variable = if options.strip_year_suffix {
        strip_year_suffix(&variable, year).to_string()
    } else {
        variable
    };
    let start = start.ok_or_else(|| HarmonizeError::LayoutParse {
        line: line_no,
        detail: format!("'{variable}' has no start offset"),
    })?;
    let end = match (end, width) {
        (Some(end), _) => end,
        (None, Some(width)) => start + width.saturating_sub(1),
        (None, None) => {
            return Err(HarmonizeError::LayoutParse {
                line: line_no,
                detail: format!("'{variable}' has neither end offset nor width"),
            }
            .into());
        }
    };
    Ok(LayoutEntry {
        start: published_start(start, &variable)?,
        end,
        variable,
        kind,
        description,
    })
}

fn parse_offset(token: &str, field: LayoutField, line_no: usize) -> Result<usize> {
    token.parse::<usize>().map_err(|_| {
        HarmonizeError::LayoutParse {
            line: line_no,
            detail: format!("{field} '{token}' is not a non-negative integer"),
        }
        .into()
    })
}
