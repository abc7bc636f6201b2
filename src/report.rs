//! Batch outputs: per-case tables, the JSON batch report and the failed-case
//! log. Each artifact is written separately; failures never share a record
//! stream with successful cases.

use crate::catalog::{PatientInfo, StudyInfo};
use crate::deid::DeidCaseSummary;
use crate::error::{FailureCategory, Result};
use crate::extraction::ExtractionReport;
use crate::identity::CaseLabel;
use crate::reconcile::{clean_age, ReconciledRecord};
use crate::selector::SelectedSeries;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// `YYYYmmdd_HHMMSS` in local time, used in artifact file names.
pub fn timestamp_suffix() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Initial followed by `*`, or `**` when the name has several words.
pub fn desensitize_name(name: &str) -> String {
    let name = name.trim();
    let Some(first) = name.chars().next() else {
        return String::new();
    };
    let initial: String = first.to_uppercase().collect();
    if name.contains(' ') || name.contains('^') {
        format!("{initial}**")
    } else {
        format!("{initial}*")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Converted,
    /// Output from an earlier run was found and kept.
    Skipped,
    /// Selection only, no conversion requested.
    Scanned,
    Failed,
}

impl CaseStatus {
    pub fn is_success(self) -> bool {
        self != CaseStatus::Failed
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SeriesDescriptor {
    pub series_uid: String,
    pub series_number: i32,
    pub description: String,
    pub modality: String,
    pub object_count: usize,
    pub pixel_area: u64,
    pub slice_thickness: Option<String>,
    pub score: Option<f64>,
}

impl From<&SelectedSeries> for SeriesDescriptor {
    fn from(selected: &SelectedSeries) -> Self {
        Self {
            series_uid: selected.series_uid.clone(),
            series_number: selected.series_number,
            description: selected.description.clone(),
            modality: selected.modality.clone(),
            object_count: selected.object_count(),
            pixel_area: selected.key.pixel_area,
            slice_thickness: selected.slice_thickness.clone(),
            score: selected.score,
        }
    }
}

/// Everything recorded about one case in one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaseOutcome {
    pub label: CaseLabel,
    pub surrogate: String,
    pub output_dir: PathBuf,
    pub sources: Vec<String>,
    pub file_count: usize,
    pub series_count: usize,
    pub patient: PatientInfo,
    pub study: StudyInfo,
    pub status: CaseStatus,
    pub selected: Option<SeriesDescriptor>,
    pub outputs: Vec<PathBuf>,
    pub sidecars: Vec<PathBuf>,
    pub diagnostics: String,
    pub error: Option<String>,
    pub category: Option<FailureCategory>,
    pub retryable: bool,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub records: Vec<ReconciledRecord>,
}

impl CaseOutcome {
    pub fn success(&self) -> bool {
        self.status.is_success()
    }
}

/// One row of `case_metadata.csv`. Column names match what the registry
/// loader expects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CaseSummaryRow {
    pub case: String,
    #[serde(rename = "NewPatientID")]
    pub new_patient_id: String,
    pub patient_name: String,
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    pub patient_birth_date: String,
    pub patient_sex: String,
    pub patient_age: String,
    pub study_date: String,
    pub study_time: String,
    pub institution_name: String,
    #[serde(rename = "StudyInstanceUID")]
    pub study_instance_uid: String,
    pub modality: String,
    pub manufacturer: String,
    pub file_count: usize,
    pub series_count: usize,
    pub selected_series_number: String,
    pub selected_series_description: String,
    pub selected_object_count: String,
    pub status: String,
}

impl CaseSummaryRow {
    pub fn from_outcome(outcome: &CaseOutcome) -> Self {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        let selected = outcome.selected.as_ref();
        Self {
            case: outcome.label.to_string(),
            new_patient_id: outcome.surrogate.clone(),
            patient_name: text(&outcome.patient.patient_name),
            patient_id: text(&outcome.patient.patient_id),
            patient_birth_date: text(&outcome.patient.patient_birth_date),
            patient_sex: text(&outcome.patient.patient_sex),
            patient_age: outcome
                .patient
                .patient_age
                .as_deref()
                .and_then(clean_age)
                .unwrap_or_default(),
            study_date: text(&outcome.study.study_date),
            study_time: text(&outcome.study.study_time),
            institution_name: text(&outcome.study.institution_name),
            study_instance_uid: text(&outcome.study.study_instance_uid),
            modality: selected.map(|s| s.modality.clone()).unwrap_or_default(),
            manufacturer: text(&outcome.study.manufacturer),
            file_count: outcome.file_count,
            series_count: outcome.series_count,
            selected_series_number: selected
                .map(|s| s.series_number.to_string())
                .unwrap_or_default(),
            selected_series_description: selected
                .map(|s| s.description.clone())
                .unwrap_or_default(),
            selected_object_count: selected
                .map(|s| s.object_count.to_string())
                .unwrap_or_default(),
            status: format!("{:?}", outcome.status).to_lowercase(),
        }
    }

    /// Direct identifiers replaced: the case label (which may embed the
    /// subject ID) and the ID become the surrogate, the name is masked and
    /// the birth date dropped.
    pub fn masked(&self) -> Self {
        Self {
            case: self.new_patient_id.clone(),
            patient_name: desensitize_name(&self.patient_name),
            patient_id: self.new_patient_id.clone(),
            patient_birth_date: String::new(),
            ..self.clone()
        }
    }
}

/// Clinical subset of a reconciled record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ClinicalRow {
    pub file_name: String,
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    pub study_date: String,
    pub patient_name: String,
    pub patient_birth_date: String,
    pub patient_sex: String,
    pub patient_age: String,
    pub output_folder: String,
    pub match_status: String,
    pub conflicts: String,
}

impl From<&ReconciledRecord> for ClinicalRow {
    fn from(r: &ReconciledRecord) -> Self {
        Self {
            file_name: r.file_name.clone(),
            patient_id: r.patient_id.clone(),
            study_date: r.study_date.clone(),
            patient_name: r.patient_name.clone(),
            patient_birth_date: r.patient_birth_date.clone(),
            patient_sex: r.patient_sex.clone(),
            patient_age: r.patient_age.clone(),
            output_folder: r.output_folder.clone(),
            match_status: r.match_status.label().to_string(),
            conflicts: r.conflicts.clone(),
        }
    }
}

/// Serialize `rows` to a CSV file with a UTF-8 BOM (spreadsheet friendly).
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(UTF8_BOM)?;
    let mut writer = csv::Writer::from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub converted: usize,
    pub skipped: usize,
    pub scanned: usize,
    pub failed: usize,
    pub by_category: BTreeMap<FailureCategory, usize>,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[CaseOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.status {
                CaseStatus::Converted => summary.converted += 1,
                CaseStatus::Skipped => summary.skipped += 1,
                CaseStatus::Scanned => summary.scanned += 1,
                CaseStatus::Failed => {
                    summary.failed += 1;
                    let category = outcome.category.unwrap_or(FailureCategory::Other);
                    *summary.by_category.entry(category).or_insert(0) += 1;
                }
            }
        }
        summary
    }

    pub fn succeeded(&self) -> usize {
        self.total - self.failed
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: PathBuf,
    pub input_mode: String,
    pub summary: BatchSummary,
    #[serde(default)]
    pub extractions: Vec<ExtractionReport>,
    pub cases: Vec<CaseOutcome>,
}

impl BatchReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        input: &Path,
        input_mode: &str,
        cases: Vec<CaseOutcome>,
    ) -> Self {
        Self {
            run_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
            finished_at: Utc::now(),
            input: input.to_path_buf(),
            input_mode: input_mode.to_string(),
            summary: BatchSummary::from_outcomes(&cases),
            extractions: Vec::new(),
            cases,
        }
    }
}

/// Failed cases grouped by category (largest group first), then each
/// diagnostic verbatim.
pub fn render_failed_cases(outcomes: &[CaseOutcome], generated: DateTime<Local>) -> String {
    let failed: Vec<&CaseOutcome> = outcomes.iter().filter(|o| !o.success()).collect();
    let mut groups: BTreeMap<FailureCategory, Vec<&CaseOutcome>> = BTreeMap::new();
    for outcome in &failed {
        groups
            .entry(outcome.category.unwrap_or(FailureCategory::Other))
            .or_default()
            .push(outcome);
    }
    let mut ordered: Vec<_> = groups.into_iter().collect();
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

    let mut text = String::new();
    text.push_str("# Failed cases\n");
    text.push_str(&format!("# Generated: {}\n", generated.format("%Y-%m-%d %H:%M:%S")));
    text.push_str(&format!("# Total failed: {}\n", failed.len()));
    for (category, cases) in &ordered {
        text.push_str(&format!("\n## {} ({} cases)\n", category, cases.len()));
        for case in cases {
            text.push_str(&format!("{}\n", case.label));
        }
    }
    text.push_str("\n## Details\n");
    for case in &failed {
        text.push_str(&format!(
            "\n{}: {}\n",
            case.label,
            case.error.as_deref().unwrap_or("unknown error")
        ));
        if !case.diagnostics.trim().is_empty() {
            text.push_str(case.diagnostics.trim_end());
            text.push('\n');
        }
    }
    text
}

/// Paths of the artifacts written for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportPaths {
    pub case_metadata: Option<PathBuf>,
    pub case_metadata_masked: Option<PathBuf>,
    pub batch_report: Option<PathBuf>,
    pub failed_cases: Option<PathBuf>,
    pub metadata_summary: Option<PathBuf>,
    pub clinical_info: Option<PathBuf>,
}

impl ReportPaths {
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        [
            &self.case_metadata,
            &self.case_metadata_masked,
            &self.batch_report,
            &self.failed_cases,
            &self.metadata_summary,
            &self.clinical_info,
        ]
        .into_iter()
        .flatten()
    }
}

/// Write every batch artifact into `dir`. The failed-case log is only
/// written when something failed; the reconciled tables only when there are
/// records.
pub fn write_batch_artifacts(dir: &Path, report: &BatchReport, stamp: &str) -> Result<ReportPaths> {
    fs::create_dir_all(dir)?;
    let mut paths = ReportPaths::default();

    let rows: Vec<CaseSummaryRow> = report.cases.iter().map(CaseSummaryRow::from_outcome).collect();
    if !rows.is_empty() {
        let path = dir.join("case_metadata.csv");
        write_csv(&path, &rows)?;
        paths.case_metadata = Some(path);

        let masked: Vec<CaseSummaryRow> = rows.iter().map(CaseSummaryRow::masked).collect();
        let path = dir.join("case_metadata_masked.csv");
        write_csv(&path, &masked)?;
        paths.case_metadata_masked = Some(path);
    }

    let path = dir.join(format!("conversion_report_{stamp}.json"));
    fs::write(&path, serde_json::to_string_pretty(report)?)?;
    paths.batch_report = Some(path);

    if report.summary.failed > 0 {
        let path = dir.join(format!("failed_cases_{stamp}.txt"));
        fs::write(&path, render_failed_cases(&report.cases, Local::now()))?;
        paths.failed_cases = Some(path);
    }

    let records: Vec<&ReconciledRecord> = report.cases.iter().flat_map(|c| c.records.iter()).collect();
    if !records.is_empty() {
        let (summary, clinical) = write_reconciled(dir, &records, stamp)?;
        paths.metadata_summary = Some(summary);
        paths.clinical_info = Some(clinical);
    }
    Ok(paths)
}

/// `metadata_summary_<stamp>.csv` and `clinical_info_<stamp>.csv`.
pub fn write_reconciled(dir: &Path, records: &[&ReconciledRecord], stamp: &str) -> Result<(PathBuf, PathBuf)> {
    let summary = dir.join(format!("metadata_summary_{stamp}.csv"));
    write_csv(&summary, records)?;
    let clinical_rows: Vec<ClinicalRow> = records.iter().map(|r| ClinicalRow::from(*r)).collect();
    let clinical = dir.join(format!("clinical_info_{stamp}.csv"));
    write_csv(&clinical, &clinical_rows)?;
    Ok((summary, clinical))
}

/// `dicom_deid_summary.csv` in the de-identification output root.
pub fn write_deid_summary(dir: &Path, rows: &[DeidCaseSummary]) -> Result<PathBuf> {
    let path = dir.join("dicom_deid_summary.csv");
    write_csv(&path, rows)?;
    Ok(path)
}

pub fn print_summary(summary: &BatchSummary, paths: &ReportPaths) {
    println!("\nProcessing Summary:");
    println!("   Total cases: {}", summary.total);
    println!("   Converted: {}", summary.converted);
    if summary.skipped > 0 {
        println!("   Skipped (already converted): {}", summary.skipped);
    }
    if summary.scanned > 0 {
        println!("   Scanned: {}", summary.scanned);
    }
    println!("   Failed: {}", summary.failed);
    for (category, count) in &summary.by_category {
        println!("     - {}: {}", category, count);
    }
    for path in paths.iter() {
        println!("📄 {}", path.display());
    }
}
