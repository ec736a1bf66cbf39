use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::layout::LayoutField;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Harmonize Common Core of Data file drops into longitudinal SQLite tables",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the ingest -> harmonize -> load pipeline described by a config file
    Run(RunArgs),
    /// Resolve a fixed-width record layout document and print its offsets
    Layout(LayoutArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Pipeline configuration (YAML)
    #[arg(short, long)]
    pub config: PathBuf,
    /// Only build this table family
    #[arg(short, long)]
    pub family: Option<String>,
    /// Print a per-family summary table when the run finishes
    #[arg(long)]
    pub summary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Args)]
pub struct LayoutArgs {
    /// Layout document to resolve
    #[arg(short, long)]
    pub input: PathBuf,
    /// End year the layout describes
    #[arg(short, long)]
    pub year: i32,
    /// First field name of the first layout row (defaults to LEAID)
    #[arg(long)]
    pub sentinel: Option<String>,
    /// Comma-separated column order, e.g. `variable,start,end,width,type,description`
    #[arg(long = "column-order", value_delimiter = ',', value_parser = parse_layout_field)]
    pub column_order: Vec<LayoutField>,
    /// Character encoding of the layout document (defaults to utf-8)
    #[arg(long)]
    pub encoding: Option<String>,
    /// Override table whose layout rules apply to this year
    #[arg(long)]
    pub overrides: Option<PathBuf>,
    /// Family the override rules are keyed by
    #[arg(long, requires = "overrides")]
    pub family: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

fn parse_layout_field(value: &str) -> Result<LayoutField, String> {
    LayoutField::from_str(value).map_err(|err| err.to_string())
}
