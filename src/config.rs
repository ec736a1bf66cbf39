//! Pipeline configuration.
//!
//! One YAML document drives a run: where the destination database lives,
//! which level is being built, and per table family the years to read, the
//! raw file locations and every harmonization policy. Year-specific
//! exceptions do not belong here; they live in the override table named by
//! `overrides`.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    harmonize::HarmonizePlan,
    layout::LayoutField,
    load::WriteMode,
    schema::ColumnType,
    shape::PivotSpec,
};

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("Opening YAML file {path:?}"))?;
    Ok(serde_yaml::from_str(&raw)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    District,
    State,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::District => "district",
            Level::State => "state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Delimited,
    FixedWidth,
}

/// Ingestion defaults for a family; per-year exceptions come from the
/// override table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub format: FileFormat,
    /// Path with a `{year}` placeholder, relative to the config file.
    pub path: String,
    /// Layout document path for fixed-width years, with `{year}`.
    pub layout_path: Option<String>,
    pub encoding: Option<String>,
    pub delimiter: Option<String>,
    pub header_sentinel: Option<String>,
    pub layout_sentinel: Option<String>,
    pub layout_column_order: Option<Vec<LayoutField>>,
    pub column_types: BTreeMap<String, ColumnType>,
    pub missing_tokens: BTreeMap<String, Vec<String>>,
}

/// Which years of a family arrive wide and must be melted to long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltConfig {
    pub id_columns: Vec<String>,
    #[serde(default = "default_count_column")]
    pub value_column: String,
    /// Drop melted rows whose count ends up absent.
    #[serde(default = "default_true")]
    pub drop_absent: bool,
}

fn default_count_column() -> String {
    "STUDENT_COUNT".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValuePolicy {
    /// Count columns subject to sentinel handling.
    pub numeric: Vec<String>,
    /// Numeric columns that must be stored as whole numbers.
    pub integer: Vec<String>,
    /// Column that receives the sentinel flag of the (single) count column.
    pub flag_column: Option<String>,
    pub boolean: Vec<String>,
    /// Column -> tokens that stand for "absent" in text columns.
    pub text_sentinels: BTreeMap<String, Vec<String>>,
    pub uppercase: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub primary: String,
    pub secondary: String,
    pub name: String,
    /// Columns that must also agree for two rows to share a name group.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default = "default_max_loss_rate")]
    pub max_loss_rate: f64,
}

fn default_max_loss_rate() -> f64 {
    0.01
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    /// Destination table; defaults to the family name.
    #[serde(default)]
    pub table: Option<String>,
    pub years: Vec<i32>,
    pub source: SourceConfig,
    #[serde(default)]
    pub melt: Option<MeltConfig>,
    #[serde(default)]
    pub pivot: Option<PivotSpec>,
    #[serde(default)]
    pub plan: HarmonizePlan,
    #[serde(default)]
    pub values: ValuePolicy,
    #[serde(default)]
    pub reconcile: Option<ReconcileConfig>,
    /// Columns identifying a row alongside `END_YEAR`.
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
}

impl FamilyConfig {
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLookupConfig {
    /// Family whose assembled frame feeds the lookup.
    pub family: String,
    #[serde(default = "default_state_table")]
    pub table: String,
    #[serde(default = "default_state_name_column")]
    pub name_column: String,
}

fn default_state_table() -> String {
    "state".to_string()
}

fn default_state_name_column() -> String {
    "STATENAME".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub database: PathBuf,
    pub level: Level,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub overrides: Option<PathBuf>,
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
    #[serde(default)]
    pub state_lookup: Option<StateLookupConfig>,
    pub families: Vec<FamilyConfig>,
    /// Directory that relative paths resolve against; set on load.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: PipelineConfig =
            load_yaml(path).with_context(|| format!("Loading pipeline config {path:?}"))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        for family in &self.families {
            if family.years.is_empty() {
                bail!("Family '{}' lists no years", family.name);
            }
            if family.source.format == FileFormat::FixedWidth
                && family.source.layout_path.is_none()
            {
                bail!(
                    "Family '{}' is fixed-width but has no layout_path",
                    family.name
                );
            }
        }
        if let Some(lookup) = &self.state_lookup
            && self.family(&lookup.family).is_none()
        {
            bail!("State lookup refers to unknown family '{}'", lookup.family);
        }
        Ok(())
    }

    pub fn family(&self, name: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|family| family.name == name)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Expands a `{year}` template relative to the config file.
    pub fn year_path(&self, template: &str, year: i32) -> PathBuf {
        self.resolve(Path::new(&template.replace("{year}", &year.to_string())))
    }
}
