//! Per-year exception table.
//!
//! Every year-specific quirk of the raw drops (encodings, header rows that
//! are missing or lower-cased, bad layout offsets, one-off renames) lives in
//! an [`OverrideTable`] loaded from YAML instead of in code. Rules are keyed
//! by table family, a set of end years and, where the action targets one
//! column or layout variable, a field name:
//!
//! ```yaml
//! rules:
//!   - family: fiscal
//!     years: { from: 2002, to: 2004 }
//!     action: uppercase_headers
//!   - family: directory
//!     years: 1989
//!     field: ZIP
//!     action: layout_width
//!     width: 5
//!     note: published layout gives ZIP six characters
//! ```
//!
//! Routing rules (`source_path`, `fixed_width`, `headers_from_layout`) point
//! a year at a different file, format or header list, which is how the
//! combined releases of the early years feed several families.
//!
//! When several rules set the same scalar option the last one wins; list
//! options (missing tokens, text patches, corrections, renames) accumulate in
//! file order.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{
    config::load_yaml,
    ingest::IngestOptions,
    io_utils::parse_delimiter,
    layout::{LayoutCorrection, LayoutField, LayoutOptions, TextPatch},
    schema::ColumnType,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YearSet {
    Single(i32),
    List(Vec<i32>),
    Range { from: i32, to: i32 },
}

impl YearSet {
    pub fn contains(&self, year: i32) -> bool {
        match self {
            YearSet::Single(value) => *value == year,
            YearSet::List(values) => values.contains(&year),
            YearSet::Range { from, to } => (*from..=*to).contains(&year),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OverrideAction {
    Encoding { value: String },
    Delimiter { value: String },
    ColumnType { value: ColumnType },
    MissingTokens { tokens: Vec<String> },
    HeaderSentinel { value: String },
    Headers { columns: Vec<String> },
    UppercaseHeaders,
    StripYearSuffix,
    RstripLines,
    CommentPrefix { value: String },
    Rename { to: String },
    LayoutSentinel { value: String },
    LayoutColumnOrder { columns: Vec<LayoutField> },
    LayoutTextPatch { pattern: String, replacement: String },
    LayoutOffsets {
        #[serde(default)]
        start: Option<usize>,
        #[serde(default)]
        end: Option<usize>,
    },
    LayoutWidth { width: usize },
    RecomputeOffsets,
    /// Reads the year from another file, e.g. a combined release.
    SourcePath { value: String },
    /// Reads the year as fixed-width records described by this layout.
    FixedWidth { layout_path: String },
    /// Takes the header row from the variable list of a layout document.
    HeadersFromLayout {
        path: String,
        #[serde(default)]
        skip_lines: usize,
        #[serde(default = "default_name_column")]
        column: String,
    },
}

fn default_name_column() -> String {
    "Name".to_string()
}

/// Where a header-less year finds its column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutHeaders {
    pub path: String,
    pub skip_lines: usize,
    pub column: String,
}

impl OverrideAction {
    fn requires_field(&self) -> bool {
        matches!(
            self,
            OverrideAction::ColumnType { .. }
                | OverrideAction::MissingTokens { .. }
                | OverrideAction::Rename { .. }
                | OverrideAction::LayoutOffsets { .. }
                | OverrideAction::LayoutWidth { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRule {
    pub family: String,
    pub years: YearSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(flatten)]
    pub action: OverrideAction,
    /// Free-text provenance of the exception.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideTable {
    #[serde(default)]
    pub rules: Vec<OverrideRule>,
}

impl OverrideTable {
    pub fn load(path: &Path) -> Result<Self> {
        let table: OverrideTable =
            load_yaml(path).with_context(|| format!("Loading override table {path:?}"))?;
        table.check()?;
        Ok(table)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let table: OverrideTable = serde_yaml::from_str(input)?;
        table.check()?;
        Ok(table)
    }

    fn check(&self) -> Result<()> {
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.action.requires_field() && rule.field.is_none() {
                bail!(
                    "Override rule {} ({} {:?}) needs a 'field'",
                    idx + 1,
                    rule.family,
                    rule.years
                );
            }
        }
        Ok(())
    }

    pub fn rules_for<'a>(
        &'a self,
        family: &'a str,
        year: i32,
    ) -> impl Iterator<Item = &'a OverrideRule> + 'a {
        self.rules
            .iter()
            .filter(move |rule| rule.family == family && rule.years.contains(year))
    }

    /// Layers the matching ingestion rules over `base`.
    pub fn ingest_options(&self, family: &str, year: i32, base: &IngestOptions) -> IngestOptions {
        let mut options = base.clone();
        for rule in self.rules_for(family, year) {
            let field = rule.field.clone().unwrap_or_default();
            match &rule.action {
                OverrideAction::Encoding { value } => options.encoding = Some(value.clone()),
                OverrideAction::ColumnType { value } => {
                    options.column_types.insert(field, *value);
                }
                OverrideAction::MissingTokens { tokens } => {
                    options
                        .missing_tokens
                        .entry(field)
                        .or_default()
                        .extend(tokens.iter().cloned());
                }
                OverrideAction::HeaderSentinel { value } => {
                    options.header_sentinel = Some(value.clone())
                }
                OverrideAction::Headers { columns } => options.headers = Some(columns.clone()),
                OverrideAction::UppercaseHeaders => options.uppercase_headers = true,
                OverrideAction::StripYearSuffix => options.strip_year_suffix = true,
                OverrideAction::RstripLines => options.rstrip_lines = true,
                OverrideAction::CommentPrefix { value } => {
                    options.comment_prefix = Some(value.clone())
                }
                _ => {}
            }
        }
        options
    }

    /// Delimiter declared for this year, if any rule names one.
    pub fn delimiter(&self, family: &str, year: i32) -> Result<Option<u8>> {
        let mut delimiter = None;
        for rule in self.rules_for(family, year) {
            if let OverrideAction::Delimiter { value } = &rule.action {
                delimiter = Some(
                    parse_delimiter(value)
                        .with_context(|| format!("Override delimiter for {family} {year}"))?,
                );
            }
        }
        Ok(delimiter)
    }

    /// Layers the matching layout rules over `base`.
    pub fn layout_options(&self, family: &str, year: i32, base: &LayoutOptions) -> LayoutOptions {
        let mut options = base.clone();
        for rule in self.rules_for(family, year) {
            let field = rule.field.clone().unwrap_or_default();
            match &rule.action {
                OverrideAction::LayoutSentinel { value } => options.sentinel = value.clone(),
                OverrideAction::LayoutColumnOrder { columns } => {
                    options.column_order = columns.clone()
                }
                OverrideAction::LayoutTextPatch {
                    pattern,
                    replacement,
                } => options.text_patches.push(TextPatch {
                    pattern: pattern.clone(),
                    replacement: replacement.clone(),
                }),
                OverrideAction::LayoutOffsets { start, end } => {
                    options.corrections.push(LayoutCorrection {
                        variable: field,
                        start: *start,
                        end: *end,
                        width: None,
                    })
                }
                OverrideAction::LayoutWidth { width } => {
                    options.corrections.push(LayoutCorrection {
                        variable: field,
                        width: Some(*width),
                        ..Default::default()
                    })
                }
                OverrideAction::RecomputeOffsets => options.recompute_offsets = true,
                _ => {}
            }
        }
        options
    }

    /// Path template replacing the family's source path for this year.
    pub fn source_path(&self, family: &str, year: i32) -> Option<String> {
        self.rules_for(family, year)
            .filter_map(|rule| match &rule.action {
                OverrideAction::SourcePath { value } => Some(value.clone()),
                _ => None,
            })
            .last()
    }

    /// Layout path template when this year is stored as fixed-width records.
    pub fn fixed_width_layout(&self, family: &str, year: i32) -> Option<String> {
        self.rules_for(family, year)
            .filter_map(|rule| match &rule.action {
                OverrideAction::FixedWidth { layout_path } => Some(layout_path.clone()),
                _ => None,
            })
            .last()
    }

    pub fn layout_headers(&self, family: &str, year: i32) -> Option<LayoutHeaders> {
        self.rules_for(family, year)
            .filter_map(|rule| match &rule.action {
                OverrideAction::HeadersFromLayout {
                    path,
                    skip_lines,
                    column,
                } => Some(LayoutHeaders {
                    path: path.clone(),
                    skip_lines: *skip_lines,
                    column: column.clone(),
                }),
                _ => None,
            })
            .last()
    }

    /// `(from, to)` column renames applied before harmonization.
    pub fn renames(&self, family: &str, year: i32) -> Vec<(String, String)> {
        self.rules_for(family, year)
            .filter_map(|rule| match (&rule.action, &rule.field) {
                (OverrideAction::Rename { to }, Some(from)) => Some((from.clone(), to.clone())),
                _ => None,
            })
            .collect()
    }
}
