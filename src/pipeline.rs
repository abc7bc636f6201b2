//! Batch orchestration.
//!
//! Discovery → resumable extraction → case resolution → surrogate
//! allocation → per-case selection, staging, conversion and reconciliation
//! → batch artifacts. Surrogates are allocated once, over the full sorted
//! label set, before any case is processed; after that cases are independent
//! and may run on the rayon pool. Results are collected and written by the
//! calling thread only.

use crate::catalog::SeriesCatalog;
use crate::config::{LabelStrategy, PipelineConfig};
use crate::convert::{list_outputs, sidecar_for, stage_series, ConversionResult, Converter};
use crate::deid::{deidentify_case, DeidCaseSummary};
use crate::error::PipelineError;
use crate::extraction::{ensure_extracted, remove_working_copy, working_dir_for, ExtractionReport};
use crate::identity::{
    allocate_surrogates, case_directory_names, detect_input_mode, resolve_cases, Case, CaseLabel,
    DiscoveryRules, InputMode, InputSource, Resolution, SourceKind, SurrogateMap, STAGING_DIR_NAME,
};
use crate::reconcile::{
    parse_sidecar_name_for_case, reconcile, reconcile_directory, Registry, RegistryRecord, Sidecar,
};
use crate::report::{
    timestamp_suffix, write_batch_artifacts, write_deid_summary, write_reconciled, BatchReport,
    CaseOutcome, CaseStatus, ReportPaths, SeriesDescriptor,
};
use crate::selector::{select_series, SelectionPolicy};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Discovery and selection only.
    Scan,
    Convert,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: PathBuf,
    /// Output root; defaults to `<input>/output` (or next to a single archive).
    pub output: Option<PathBuf>,
    /// Treat a directory as one case folder even if it has sub-folders.
    pub force_single: bool,
    pub parallel: bool,
    pub keep_work: bool,
    pub progress: bool,
    /// Preferred staging location; must be ASCII-safe to be used.
    pub staging_root: Option<PathBuf>,
}

/// Everything decided before the first case runs.
#[derive(Debug)]
pub struct PreparedRun {
    pub mode: InputMode,
    pub resolution: Resolution,
    pub surrogates: SurrogateMap,
    pub directories: BTreeMap<CaseLabel, String>,
    pub extractions: Vec<ExtractionReport>,
    /// Archive sources → working copy.
    pub working_copies: BTreeMap<String, PathBuf>,
    /// Sources that yielded no case at all.
    pub source_failures: Vec<CaseOutcome>,
}

impl PreparedRun {
    pub fn cases(&self) -> Vec<&Case> {
        self.resolution.cases.cases().collect()
    }

    pub fn surrogate(&self, label: &CaseLabel) -> String {
        self.surrogates.get(label).unwrap_or_default().to_string()
    }

    pub fn directory(&self, label: &CaseLabel) -> String {
        self.directories
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.sanitized())
    }
}

/// `<dir>/<name>` for folders and batches; next to the archive otherwise.
pub fn default_output_root(mode: &InputMode, input: &Path, dir_name: &str) -> PathBuf {
    match mode {
        InputMode::SingleArchive(_) => input
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(dir_name),
        _ => input.join(dir_name),
    }
}

/// Discovery rules for a run: the configured names plus the explicit output
/// root, if one was given and already exists.
pub fn discovery_rules(options: &RunOptions, config: &PipelineConfig) -> DiscoveryRules {
    let rules = DiscoveryRules::from_config(config);
    match &options.output {
        Some(output) => rules.excluding_path(output),
        None => rules,
    }
}

pub fn discover(options: &RunOptions, config: &PipelineConfig) -> Result<InputMode> {
    if !options.input.exists() {
        bail!("input path does not exist: {:?}", options.input);
    }
    let mode = if options.force_single && options.input.is_dir() {
        InputMode::SingleFolder(InputSource::new(&options.input, SourceKind::Folder))
    } else {
        detect_input_mode(&options.input, &discovery_rules(options, config))
    };
    if mode == InputMode::Unknown {
        bail!("no DICOM archive or folder found at {:?}", options.input);
    }
    info!("input mode: {} ({} source(s))", mode.name(), mode.sources().len());
    Ok(mode)
}

fn empty_outcome(label: CaseLabel, surrogate: String, output_dir: PathBuf) -> CaseOutcome {
    CaseOutcome {
        label,
        surrogate,
        output_dir,
        sources: Vec::new(),
        file_count: 0,
        series_count: 0,
        patient: Default::default(),
        study: Default::default(),
        status: CaseStatus::Failed,
        selected: None,
        outputs: Vec::new(),
        sidecars: Vec::new(),
        diagnostics: String::new(),
        error: None,
        category: None,
        retryable: false,
        elapsed_ms: 0,
        timestamp: Utc::now(),
        records: Vec::new(),
    }
}

fn mark_failed(outcome: &mut CaseOutcome, error: &PipelineError) {
    outcome.status = CaseStatus::Failed;
    outcome.error = Some(error.to_string());
    outcome.category = Some(error.category());
    outcome.retryable = error.is_retryable();
}

fn source_failure(name: &str, output_root: &Path, error: &PipelineError) -> CaseOutcome {
    let mut outcome = empty_outcome(CaseLabel::new(name), String::new(), output_root.join(name));
    outcome.sources = vec![name.to_string()];
    mark_failed(&mut outcome, error);
    outcome
}

/// Discovery, extraction, case resolution and surrogate allocation. The
/// output root is never scanned as input.
pub fn prepare(mode: InputMode, config: &PipelineConfig, output_root: &Path) -> PreparedRun {
    let mut roots = Vec::new();
    let mut extractions = Vec::new();
    let mut working_copies = BTreeMap::new();
    let mut source_failures = Vec::new();

    for source in mode.sources() {
        match source.kind {
            SourceKind::Folder => roots.push((source.name.clone(), source.path.clone())),
            SourceKind::Archive => {
                let target = working_dir_for(&source.path, &config.extraction.work_prefix);
                match ensure_extracted(&source.path, &target) {
                    Ok(report) => {
                        debug!("{}: {:?}", source.name, report.outcome);
                        extractions.push(report);
                        working_copies.insert(source.name.clone(), target.clone());
                        roots.push((source.name.clone(), target));
                    }
                    Err(e) => {
                        warn!("{}: {}", source.name, e);
                        source_failures.push(source_failure(&source.name, output_root, &e));
                    }
                }
            }
        }
    }

    let requested = config
        .identity
        .label_strategy
        .or_else(|| mode.is_batch().then_some(LabelStrategy::SourceSubject));
    let rules = DiscoveryRules::from_config(config).excluding_path(output_root);
    let resolution = resolve_cases(&roots, requested, &rules);
    for name in &resolution.empty_sources {
        let error = PipelineError::NoEligibleSeries {
            reason: "No valid DICOM files found".to_string(),
        };
        source_failures.push(source_failure(name, output_root, &error));
    }

    let identity = &config.identity;
    let surrogates = allocate_surrogates(
        resolution.cases.labels(),
        &identity.surrogate_prefix,
        identity.surrogate_base,
        identity.surrogate_width,
    );
    let directories = case_directory_names(&surrogates);
    info!(
        "{} case(s) resolved, {} source failure(s)",
        resolution.cases.len(),
        source_failures.len()
    );

    PreparedRun {
        mode,
        resolution,
        surrogates,
        directories,
        extractions,
        working_copies,
        source_failures,
    }
}

/// Case name handed to the converter: the directory name when it is plain
/// ASCII, the surrogate otherwise.
pub fn converter_case_name(directory: &str, surrogate: &str) -> String {
    let plain = !directory.is_empty()
        && directory
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if plain || surrogate.is_empty() {
        directory.to_string()
    } else {
        surrogate.to_string()
    }
}

/// Registry record captured from the first object of a case.
pub fn registry_record(case: &Case) -> RegistryRecord {
    let Some(first) = case.objects.first() else {
        return RegistryRecord::default();
    };
    RegistryRecord {
        patient_id: first.patient.patient_id.clone(),
        patient_name: first.patient.patient_name.clone(),
        patient_birth_date: first.patient.patient_birth_date.clone(),
        patient_sex: first.patient.patient_sex.clone(),
        patient_age: first.patient.patient_age.clone(),
        study_date: first.study.study_date.clone(),
        study_time: first.study.study_time.clone(),
        institution_name: first.study.institution_name.clone(),
    }
}

struct CaseContext<'a> {
    policy: &'a SelectionPolicy,
    converter: Option<&'a Converter>,
    output_root: &'a Path,
    staging_root: Option<&'a Path>,
    stage: Stage,
}

fn write_converter_log(case_dir: &Path, result: &ConversionResult) -> std::io::Result<PathBuf> {
    let path = case_dir.join(format!("converter_{}.log", timestamp_suffix()));
    fs::create_dir_all(case_dir)?;
    fs::write(
        &path,
        format!(
            "--- STDOUT ---\n{}\n--- STDERR ---\n{}\n",
            result.stdout, result.stderr
        ),
    )?;
    Ok(path)
}

fn reconcile_sidecars(outcome: &mut CaseOutcome, case: &Case, case_name: &str) {
    let registry = Registry::from_records(vec![registry_record(case)]);
    for path in &outcome.sidecars {
        match Sidecar::load(path) {
            Ok(sidecar) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let name = parse_sidecar_name_for_case(&stem, case_name);
                outcome.records.push(reconcile(&sidecar, &name, Some(&registry)));
            }
            Err(e) => warn!("{}: unreadable sidecar {:?}: {}", case.label, path, e),
        }
    }
}

fn process_case(case: &Case, surrogate: String, directory: String, ctx: &CaseContext) -> CaseOutcome {
    let started = Instant::now();
    let case_dir = ctx.output_root.join(&directory);
    let mut outcome = empty_outcome(case.label.clone(), surrogate, case_dir.clone());
    outcome.sources = case.sources.clone();
    outcome.file_count = case.objects.len();
    if let Some(first) = case.objects.first() {
        outcome.patient = first.patient.clone();
        outcome.study = first.study.clone();
    }

    let result = run_case(case, &case_dir, &directory, ctx, &mut outcome);
    if let Err(error) = result {
        warn!("{}: {}", case.label, error);
        mark_failed(&mut outcome, &error);
    }
    outcome.elapsed_ms = started.elapsed().as_millis() as u64;
    outcome.timestamp = Utc::now();
    outcome
}

fn run_case(
    case: &Case,
    case_dir: &Path,
    directory: &str,
    ctx: &CaseContext,
    outcome: &mut CaseOutcome,
) -> crate::error::Result<()> {
    let catalog = SeriesCatalog::from_objects(case.objects.iter().cloned());
    outcome.series_count = catalog.len();

    let selected = select_series(catalog, ctx.policy).map_err(|e| PipelineError::NoEligibleSeries {
        reason: e.to_string(),
    })?;
    info!("{}: selected {}", case.label, selected.summary());
    outcome.selected = Some(SeriesDescriptor::from(&selected));

    let converter = match (ctx.stage, ctx.converter) {
        (Stage::Convert, Some(converter)) => converter,
        _ => {
            outcome.status = CaseStatus::Scanned;
            return Ok(());
        }
    };

    let case_name = converter_case_name(directory, &outcome.surrogate);
    if case_dir.is_dir() {
        let existing = list_outputs(case_dir, &case_name)?;
        if !existing.is_empty() {
            info!("{}: already converted, skipping", case.label);
            outcome.sidecars = existing
                .iter()
                .map(|p| sidecar_for(p))
                .filter(|p| p.exists())
                .collect();
            outcome.outputs = existing;
            outcome.status = CaseStatus::Skipped;
            reconcile_sidecars(outcome, case, &case_name);
            return Ok(());
        }
    }

    let staged = stage_series(&selected.objects, ctx.staging_root)?;
    let result = converter.convert(&staged, case_dir, &case_name)?;
    drop(staged);

    match write_converter_log(case_dir, &result) {
        Ok(log) => debug!("{}: converter log {:?}", case.label, log),
        Err(e) => warn!("{}: could not write converter log: {}", case.label, e),
    }
    outcome.diagnostics = result.diagnostics().to_string();

    if let Some(error) = result.to_error() {
        return Err(error);
    }
    if result.outputs.is_empty() {
        return Err(PipelineError::ConversionFailed {
            status: "0".to_string(),
            diagnostics: "converter produced no output".to_string(),
        });
    }
    outcome.outputs = result.outputs;
    outcome.sidecars = result.sidecars;
    outcome.status = CaseStatus::Converted;
    reconcile_sidecars(outcome, case, &case_name);
    Ok(())
}

fn progress_bar(enabled: bool, len: usize) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    Some(pb)
}

/// Run `work` over every case, on the rayon pool when `parallel` is set.
/// Output order follows the label order either way.
fn for_each_case<'a, T, F>(cases: &[&'a Case], parallel: bool, progress: bool, work: F) -> Vec<T>
where
    T: Send,
    F: Fn(&'a Case) -> T + Sync,
{
    let pb = progress_bar(progress, cases.len());
    let step = |case: &&'a Case| {
        let result = work(*case);
        if let Some(pb) = &pb {
            pb.inc(1);
        }
        result
    };
    let results: Vec<T> = if parallel && cases.len() > 1 {
        cases.par_iter().map(step).collect()
    } else {
        cases.iter().map(step).collect()
    };
    if let Some(pb) = &pb {
        pb.finish_with_message("done");
    }
    results
}

/// Remove the working copies of archives whose cases all succeeded. Any
/// failure keeps the copy for inspection.
fn cleanup_working_copies(prepared: &PreparedRun, outcomes: &[CaseOutcome], keep: bool) {
    for (source, target) in &prepared.working_copies {
        let failed = outcomes
            .iter()
            .any(|o| !o.success() && o.sources.iter().any(|s| s == source));
        if keep || failed {
            if failed {
                info!("keeping working copy {:?} for inspection", target);
            }
            continue;
        }
        if let Err(e) = remove_working_copy(target) {
            warn!("could not remove working copy {:?}: {}", target, e);
        }
    }
}

/// Outcome of a `scan` or `convert` run.
#[derive(Debug)]
pub struct RunSummary {
    pub report: BatchReport,
    pub paths: ReportPaths,
    pub output_root: PathBuf,
}

pub fn run(options: &RunOptions, config: &PipelineConfig, stage: Stage) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, "starting {:?} run on {:?}", stage, options.input);
    config.validate()?;

    let converter = match stage {
        Stage::Convert => Some(Converter::locate(config.converter.clone())?),
        Stage::Scan => None,
    };

    let mode = discover(options, config)?;
    let output_root = options
        .output
        .clone()
        .unwrap_or_else(|| default_output_root(&mode, &options.input, &config.identity.output_dir_name));
    fs::create_dir_all(&output_root)
        .with_context(|| format!("Failed to create output directory {:?}", output_root))?;

    let prepared = prepare(mode, config, &output_root);
    let policy = SelectionPolicy::from_config(&config.selection);
    let staging_root = options
        .staging_root
        .clone()
        .unwrap_or_else(|| output_root.join(STAGING_DIR_NAME));
    let ctx = CaseContext {
        policy: &policy,
        converter: converter.as_ref(),
        output_root: &output_root,
        staging_root: Some(&staging_root),
        stage,
    };

    let cases = prepared.cases();
    let mut outcomes = for_each_case(&cases, options.parallel, options.progress, |case| {
        process_case(
            case,
            prepared.surrogate(&case.label),
            prepared.directory(&case.label),
            &ctx,
        )
    });
    outcomes.extend(prepared.source_failures.iter().cloned());
    let _ = fs::remove_dir(&staging_root);

    if stage == Stage::Convert {
        cleanup_working_copies(&prepared, &outcomes, options.keep_work || config.extraction.keep_working_copies);
    }

    let mut report = BatchReport::new(run_id, started_at, &options.input, prepared.mode.name(), outcomes);
    report.extractions = prepared.extractions.clone();
    let paths = write_batch_artifacts(&output_root, &report, &timestamp_suffix())
        .context("Failed to write batch reports")?;
    info!(
        %run_id,
        "finished: {} succeeded, {} failed",
        report.summary.succeeded(),
        report.summary.failed
    );
    Ok(RunSummary {
        report,
        paths,
        output_root,
    })
}

/// Outcome of a `deidentify` run.
#[derive(Debug)]
pub struct DeidRun {
    pub output_root: PathBuf,
    pub cases: Vec<DeidCaseSummary>,
    pub failures: Vec<CaseOutcome>,
    pub summary_csv: Option<PathBuf>,
}

pub fn deidentify(options: &RunOptions, config: &PipelineConfig) -> Result<DeidRun> {
    config.validate()?;
    let mode = discover(options, config)?;
    let output_root = options
        .output
        .clone()
        .unwrap_or_else(|| default_output_root(&mode, &options.input, &config.identity.deid_dir_name));
    fs::create_dir_all(&output_root)
        .with_context(|| format!("Failed to create output directory {:?}", output_root))?;

    let prepared = prepare(mode, config, &output_root);
    let cases = prepared.cases();
    let results = for_each_case(&cases, options.parallel, options.progress, |case| {
        let surrogate = prepared.surrogate(&case.label);
        let target = output_root.join(prepared.directory(&case.label));
        info!("{} -> {} ({} files)", case.label, surrogate, case.objects.len());
        deidentify_case(case, &surrogate, &target).map_err(|e| (case, e))
    });

    let mut summaries = Vec::new();
    let mut failures = prepared.source_failures.clone();
    for result in results {
        match result {
            Ok(summary) => summaries.push(summary),
            Err((case, error)) => {
                let mut outcome = empty_outcome(
                    case.label.clone(),
                    prepared.surrogate(&case.label),
                    output_root.join(prepared.directory(&case.label)),
                );
                outcome.sources = case.sources.clone();
                mark_failed(&mut outcome, &error);
                failures.push(outcome);
            }
        }
    }

    let summary_csv = if summaries.is_empty() {
        None
    } else {
        Some(write_deid_summary(&output_root, &summaries)?)
    };
    cleanup_working_copies(&prepared, &failures, options.keep_work || config.extraction.keep_working_copies);

    Ok(DeidRun {
        output_root,
        cases: summaries,
        failures,
        summary_csv,
    })
}

/// Reconcile every sidecar under `dir` against an optional registry CSV and
/// write the two metadata tables there. Returns the paths and record count.
pub fn reconcile_outputs(dir: &Path, registry_csv: Option<&Path>) -> Result<(PathBuf, PathBuf, usize)> {
    let registry = registry_csv
        .map(|p| Registry::load_csv(p).with_context(|| format!("Failed to load registry {:?}", p)))
        .transpose()?;
    let records = reconcile_directory(dir, registry.as_ref());
    if records.is_empty() {
        bail!("no converter sidecars found under {:?}", dir);
    }
    let matched = records.iter().filter(|r| r.is_matched()).count();
    info!("{} record(s) reconciled, {} matched the registry", records.len(), matched);
    let refs: Vec<_> = records.iter().collect();
    let (summary, clinical) = write_reconciled(dir, &refs, &timestamp_suffix())?;
    Ok((summary, clinical, records.len()))
}
