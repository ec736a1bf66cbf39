pub mod assemble;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod frame;
pub mod harmonize;
pub mod ingest;
pub mod io_utils;
pub mod layout;
pub mod load;
pub mod overrides;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod schema;
pub mod shape;
pub mod values;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    cli::{Cli, Commands, LayoutArgs, OutputFormat, RunArgs},
    config::PipelineConfig,
    layout::LayoutOptions,
    overrides::OverrideTable,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("ccd_harmonize", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(&args),
        Commands::Layout(args) => handle_layout(&args),
    }
}

fn handle_run(args: &RunArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let summary = pipeline::run_pipeline(&config, args.family.as_deref())
        .with_context(|| format!("Running pipeline {:?}", args.config))?;
    info!(
        "Loaded {} famil{} into {:?}",
        summary.families.len(),
        if summary.families.len() == 1 { "y" } else { "ies" },
        summary.database
    );
    if args.summary {
        let (headers, rows) = report::summary_rows(&summary);
        report::print_table(&headers, &rows);
    }
    Ok(())
}

fn handle_layout(args: &LayoutArgs) -> Result<()> {
    let mut options = LayoutOptions::default();
    if let Some(sentinel) = &args.sentinel {
        options.sentinel = sentinel.clone();
    }
    if !args.column_order.is_empty() {
        options.column_order = args.column_order.clone();
    }
    if let Some(path) = &args.overrides {
        let table = OverrideTable::load(path)?;
        let family = args.family.as_deref().unwrap_or_default();
        options = table.layout_options(family, args.year, &options);
    }

    let encoding = io_utils::resolve_encoding(args.encoding.as_deref())?;
    let raw = io_utils::read_decoded(&args.input, encoding)?;
    let spec = layout::resolve_layout(&raw, args.year, &options)
        .with_context(|| format!("Resolving layout {:?}", args.input))?;
    match args.format {
        OutputFormat::Table => {
            let (headers, rows) = report::layout_rows(&spec);
            report::print_table(&headers, &rows);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&spec)?),
    }
    info!(
        "Resolved {} field(s), record width {}",
        spec.entries.len(),
        spec.record_width()
    );
    Ok(())
}
