//! Stage sequencing.
//!
//! For every configured family the years are processed one at a time:
//! ingest, per-year renames and drops, shape normalization, column
//! harmonization, value normalization and derived sums. The harmonized years
//! are then assembled, reconciled, checked for key uniqueness and loaded as
//! one table. A failing year stops the family before anything is written, so
//! tables loaded by earlier families stay intact and the run can be restarted
//! once the offending file or override is fixed.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs::File,
    io::BufWriter,
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use regex::Regex;
use serde::Serialize;

use crate::{
    assemble::{END_YEAR_COLUMN, assemble, ensure_unique},
    config::{FamilyConfig, FileFormat, PipelineConfig},
    data::{Value, render_cell},
    frame::Frame,
    harmonize::{UnmappedPolicy, apply_derived_sums, apply_drops, harmonize},
    ingest::{IngestOptions, SourceFormat, read_table},
    io_utils::{parse_delimiter, read_decoded, resolve_encoding, resolve_input_delimiter},
    layout::{LayoutOptions, LayoutSpec, layout_names, resolve_layout},
    load::{SqliteSink, TableSink},
    overrides::OverrideTable,
    reconcile::{ReconcileReport, reconcile},
    schema::{ColumnType, TableSchema},
    shape::{
        GRADE_COLUMN, RACE_COLUMN, SEX_COLUMN, Shape, TOTAL_INDICATOR_COLUMN, detect_shape,
        melt_wide, pivot_wider, relabel_aggregates, tag_totals, wide_column_key,
    },
    values::{
        ValueReport, apply_text_sentinels, normalize_boolean_columns, normalize_numeric_columns,
        uppercase_columns,
    },
};

#[derive(Debug, Clone, Serialize)]
pub struct YearOutcome {
    pub year: i32,
    pub path: PathBuf,
    pub rows_read: usize,
    pub rows_kept: usize,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilyOutcome {
    pub family: String,
    pub table: String,
    pub years: Vec<YearOutcome>,
    pub rows_loaded: usize,
    pub values: ValueReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileReport>,
    /// The assembled table as loaded.
    #[serde(skip)]
    pub frame: Frame,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub level: String,
    pub database: PathBuf,
    pub families: Vec<FamilyOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_rows: Option<usize>,
}

/// Runs every family (or only `only`) and loads the results into the
/// configured database.
pub fn run_pipeline(config: &PipelineConfig, only: Option<&str>) -> Result<RunSummary> {
    if let Some(name) = only
        && config.family(name).is_none()
    {
        bail!("No family named '{name}' in the pipeline config");
    }
    let overrides = match &config.overrides {
        Some(path) => OverrideTable::load(&config.resolve(path))?,
        None => OverrideTable::default(),
    };
    let database = config.resolve(&config.database);
    let mut sink = SqliteSink::open(&database)?;
    info!(
        "Building {} tables into {database:?} ({} override rule(s))",
        config.level.as_str(),
        overrides.rules.len()
    );

    let mut summary = RunSummary {
        level: config.level.as_str().to_string(),
        database,
        families: Vec::new(),
        state_rows: None,
    };
    for family in &config.families {
        if only.is_some_and(|name| name != family.name) {
            continue;
        }
        let outcome = run_family(config, family, &overrides, &mut sink)
            .with_context(|| format!("Family '{}'", family.name))?;

        if let Some(lookup) = &config.state_lookup
            && lookup.family == family.name
        {
            let states = state_lookup(&outcome.frame, &lookup.name_column)?;
            let schema = TableSchema::infer(
                &lookup.table,
                &states,
                &BTreeMap::new(),
                &["FIPST".to_string()],
            );
            summary.state_rows = Some(sink.write_table(&schema, &states, config.mode)?);
        }
        summary.families.push(outcome);
    }

    if let Some(path) = &config.summary_path {
        let path = config.resolve(path);
        let file = File::create(&path).with_context(|| format!("Creating summary {path:?}"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)
            .with_context(|| format!("Writing summary {path:?}"))?;
        info!("Run summary written to {path:?}");
    }
    Ok(summary)
}

pub fn run_family(
    config: &PipelineConfig,
    family: &FamilyConfig,
    overrides: &OverrideTable,
    sink: &mut dyn TableSink,
) -> Result<FamilyOutcome> {
    let mut years = Vec::with_capacity(family.years.len());
    let mut frames = Vec::with_capacity(family.years.len());
    let mut values = ValueReport::default();
    for &year in &family.years {
        let (frame, outcome, report) = process_year(config, family, overrides, year)
            .with_context(|| format!("End year {year}"))?;
        values.merge(report);
        years.push(outcome);
        frames.push((year, frame));
    }

    let mut assembled = assemble(frames)?;
    let mut reconcile_report = None;
    if let Some(settings) = &family.reconcile {
        let (reconciled, report) = reconcile(assembled, settings)?;
        assembled = reconciled;
        reconcile_report = Some(report);
    }

    let key: Vec<String> = if family.key.is_empty() {
        Vec::new()
    } else {
        std::iter::once(END_YEAR_COLUMN.to_string())
            .chain(family.key.iter().cloned())
            .collect()
    };
    ensure_unique(&assembled, &key)?;

    let mut declared = family.column_types.clone();
    declared.insert(END_YEAR_COLUMN.to_string(), ColumnType::Integer);
    let schema = TableSchema::infer(family.table_name(), &assembled, &declared, &key);
    let rows_loaded = sink.write_table(&schema, &assembled, config.mode)?;
    info!(
        "Family '{}': {} year(s), {rows_loaded} row(s), fingerprint {}",
        family.name,
        years.len(),
        assembled.fingerprint()
    );

    Ok(FamilyOutcome {
        family: family.name.clone(),
        table: family.table_name().to_string(),
        years,
        rows_loaded,
        values,
        reconcile: reconcile_report,
        frame: assembled,
    })
}

fn base_ingest_options(family: &FamilyConfig) -> IngestOptions {
    IngestOptions {
        encoding: family.source.encoding.clone(),
        header_sentinel: family.source.header_sentinel.clone(),
        column_types: family.source.column_types.clone(),
        missing_tokens: family.source.missing_tokens.clone(),
        ..Default::default()
    }
}

fn base_layout_options(family: &FamilyConfig) -> LayoutOptions {
    let mut options = LayoutOptions::default();
    if let Some(sentinel) = &family.source.layout_sentinel {
        options.sentinel = sentinel.clone();
    }
    if let Some(order) = &family.source.layout_column_order {
        options.column_order = order.clone();
    }
    options
}

fn source_format(
    config: &PipelineConfig,
    family: &FamilyConfig,
    overrides: &OverrideTable,
    year: i32,
    options: &IngestOptions,
    path: &std::path::Path,
) -> Result<SourceFormat> {
    let fixed_layout = overrides.fixed_width_layout(&family.name, year);
    let format = match &fixed_layout {
        Some(_) => FileFormat::FixedWidth,
        None => family.source.format,
    };
    match format {
        FileFormat::Delimited => {
            let declared = match overrides.delimiter(&family.name, year)? {
                Some(delimiter) => Some(delimiter),
                None => family
                    .source
                    .delimiter
                    .as_deref()
                    .map(parse_delimiter)
                    .transpose()?,
            };
            Ok(SourceFormat::Delimited {
                delimiter: resolve_input_delimiter(path, declared),
            })
        }
        FileFormat::FixedWidth => {
            let Some(template) = fixed_layout.or_else(|| family.source.layout_path.clone()) else {
                bail!("Family '{}' is fixed-width but has no layout_path", family.name);
            };
            let layout_path = config.year_path(&template, year);
            let encoding = resolve_encoding(options.encoding.as_deref())?;
            let raw = read_decoded(&layout_path, encoding)?;
            let layout_options =
                overrides.layout_options(&family.name, year, &base_layout_options(family));
            let spec = resolve_layout(&raw, year, &layout_options)
                .with_context(|| format!("Resolving layout {layout_path:?}"))?;
            Ok(SourceFormat::FixedWidth(spec))
        }
    }
}

/// Raw columns that end up in one of the family's count columns, including
/// the original names of columns renamed by an override.
fn raw_count_columns(
    family: &FamilyConfig,
    overrides: &OverrideTable,
    year: i32,
) -> BTreeSet<String> {
    let mut counts = family.plan.source_columns(&family.values.numeric, year);
    counts.extend(family.values.numeric.iter().cloned());
    if let Some(melt) = &family.melt {
        counts.insert(melt.value_column.clone());
    }
    for (from, to) in overrides.renames(&family.name, year) {
        if counts.contains(&to) {
            counts.insert(from);
        }
    }
    counts
}

/// Layout variables whose description matches one of `patterns`.
fn described_drops(spec: &LayoutSpec, patterns: &[String]) -> Result<Vec<String>> {
    let patterns = patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Compiling description pattern '{p}'")))
        .collect::<Result<Vec<_>>>()?;
    Ok(spec
        .entries
        .iter()
        .filter(|entry| patterns.iter().any(|p| p.is_match(&entry.description)))
        .map(|entry| entry.variable.clone())
        .collect())
}

fn process_year(
    config: &PipelineConfig,
    family: &FamilyConfig,
    overrides: &OverrideTable,
    year: i32,
) -> Result<(Frame, YearOutcome, ValueReport)> {
    let template = overrides
        .source_path(&family.name, year)
        .unwrap_or_else(|| family.source.path.clone());
    let path = config.year_path(&template, year);
    let mut options = overrides.ingest_options(&family.name, year, &base_ingest_options(family));
    options.count_columns = raw_count_columns(family, overrides, year);
    if let Some(headers) = overrides.layout_headers(&family.name, year) {
        let layout_path = config.year_path(&headers.path, year);
        let encoding = resolve_encoding(options.encoding.as_deref())?;
        let raw = read_decoded(&layout_path, encoding)?;
        let names = layout_names(&raw, headers.skip_lines, &headers.column)
            .with_context(|| format!("Reading column names from {layout_path:?}"))?;
        debug!("{year}: {} column name(s) from {layout_path:?}", names.len());
        options.headers = Some(names);
    }
    let format = source_format(config, family, overrides, year, &options, &path)?;
    let mut frame = read_table(&path, year, &format, &options)?;
    let rows_read = frame.len();

    for (from, to) in overrides.renames(&family.name, year) {
        if frame.has_column(&from) {
            frame.rename_column(&from, &to)?;
        } else {
            debug!("{year}: rename of absent column '{from}' skipped");
        }
    }

    let extra = match &format {
        SourceFormat::FixedWidth(spec) if !family.plan.drop_described.is_empty() => {
            described_drops(spec, &family.plan.drop_described)?
        }
        _ => Vec::new(),
    };
    let dropped = apply_drops(&mut frame, &family.plan, &extra)?;
    if !dropped.is_empty() {
        debug!("{year}: dropped {dropped:?}");
    }

    if let Some(melt) = &family.melt
        && detect_shape(&frame) == Shape::Wide
    {
        if family.plan.unmapped == UnmappedPolicy::Drop {
            let stray: Vec<String> = frame
                .columns()
                .iter()
                .filter(|column| {
                    !melt.id_columns.contains(column) && wide_column_key(column).is_none()
                })
                .cloned()
                .collect();
            if !stray.is_empty() {
                debug!("{year}: discarding {stray:?} before melting");
                frame.drop_columns(&stray);
            }
        }
        frame = melt_wide(&frame, year, &melt.id_columns, &melt.value_column)?;
        tag_totals(&mut frame)?;
    }
    if let Some(pivot) = &family.pivot
        && frame.has_column(&pivot.label_column)
        && frame.has_column(&pivot.value_column)
    {
        frame = pivot_wider(&frame, pivot)?;
    }

    let mut frame = harmonize(frame, year, &family.plan)?;

    let policy = &family.values;
    let mut report = apply_text_sentinels(&mut frame, &policy.text_sentinels)?;
    uppercase_columns(&mut frame, &policy.uppercase)?;
    report.merge(normalize_numeric_columns(
        &mut frame,
        &policy.numeric,
        &policy.integer,
        policy.flag_column.as_deref(),
    )?);
    report.merge(normalize_boolean_columns(&mut frame, &policy.boolean)?);

    apply_derived_sums(&mut frame, year, &family.plan.derived_sums)?;

    if [RACE_COLUMN, GRADE_COLUMN, SEX_COLUMN, TOTAL_INDICATOR_COLUMN]
        .iter()
        .all(|column| frame.has_column(column))
    {
        let rewritten = relabel_aggregates(&mut frame)?;
        debug!("{year}: relabeled {rewritten} aggregate cell(s)");
    }

    if let Some(melt) = &family.melt
        && melt.drop_absent
    {
        let Some(idx) = frame.column_index(&melt.value_column) else {
            bail!("Count column '{}' is not a canonical column", melt.value_column);
        };
        frame.retain_rows(|row| row[idx].is_some());
    }

    let outcome = YearOutcome {
        year,
        path,
        rows_read,
        rows_kept: frame.len(),
        fingerprint: frame.fingerprint(),
    };
    info!(
        "{year}: {} row(s) read, {} kept, fingerprint {}",
        outcome.rows_read,
        outcome.rows_kept,
        &outcome.fingerprint[..12]
    );
    Ok((frame, outcome, report))
}

/// Builds the `(FIPST, ST, STATENAME)` lookup from an assembled frame;
/// the first complete row of each FIPS code in year order wins, so years
/// that predate a published state name do not blank it out.
pub fn state_lookup(frame: &Frame, name_column: &str) -> Result<Frame> {
    let mut indexes = Vec::with_capacity(3);
    for column in ["FIPST", "ST", name_column] {
        match frame.column_index(column) {
            Some(idx) => indexes.push(idx),
            None => bail!("State lookup needs column '{column}'"),
        }
    }
    let mut lookup = Frame::new(vec![
        "FIPST".to_string(),
        "ST".to_string(),
        "STATENAME".to_string(),
    ]);
    let mut seen = HashSet::new();
    for row in frame.rows() {
        if indexes.iter().any(|idx| row[*idx].is_none()) {
            continue;
        }
        let Some(fips) = row[indexes[0]].as_ref() else {
            continue;
        };
        if !seen.insert(render_cell(Some(fips))) {
            continue;
        }
        lookup.push_row(indexes.iter().map(|idx| row[*idx].clone()).collect())?;
    }
    lookup.map_column("STATENAME", |cell| match cell {
        Some(Value::Text(name)) => Some(Value::Text(name.trim().to_string())),
        other => other,
    })?;
    info!("State lookup: {} state(s)", lookup.len());
    Ok(lookup)
}
