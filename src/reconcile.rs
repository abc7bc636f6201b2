//! Metadata reconciliation: converter sidecars + scan-time registry.
//!
//! Registry values win for demographic and study fields; everything else
//! comes from the sidecar. A sidecar whose subject identifier matches no
//! registry row is still reconciled, from the sidecar alone, and carries an
//! explicit `unmatched` marker.

use crate::error::Result;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const UNKNOWN: &str = "Unknown";

/// Shortest subject identifier allowed to match a registry row by substring.
pub const MIN_SUBSTRING_MATCH: usize = 3;

fn is_known(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && v != UNKNOWN && !v.eq_ignore_ascii_case("nan")
}

/// A converter sidecar: a flat JSON object with converter-defined keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sidecar {
    pub path: PathBuf,
    fields: Map<String, Value>,
}

impl Sidecar {
    pub fn from_map(path: impl Into<PathBuf>, fields: Map<String, Value>) -> Self {
        Self {
            path: path.into(),
            fields,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let fields = match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => map,
            other => {
                warn!("sidecar {:?} is not an object ({})", path, other);
                Map::new()
            }
        };
        Ok(Self::from_map(path, fields))
    }

    /// Field as text; `Unknown` when the key is absent or null.
    pub fn get(&self, key: &str) -> String {
        match self.fields.get(key) {
            None | Some(Value::Null) => UNKNOWN.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn known(&self, key: &str) -> Option<String> {
        Some(self.get(key)).filter(|v| is_known(v))
    }
}

/// Case, subject and series information encoded in a sidecar file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarName {
    pub case_name: String,
    pub subject_id: String,
    pub series_info: String,
}

/// `<case>_<case>_<subject>_<series...>`: the first two tokens form the case
/// name. Stems with fewer than four tokens keep the whole stem as case name.
pub fn parse_sidecar_name(stem: &str) -> SidecarName {
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() >= 4 {
        SidecarName {
            case_name: format!("{}_{}", parts[0], parts[1]),
            subject_id: parts[2].to_string(),
            series_info: parts[3..].join("_"),
        }
    } else {
        SidecarName {
            case_name: stem.to_string(),
            subject_id: UNKNOWN.to_string(),
            series_info: UNKNOWN.to_string(),
        }
    }
}

/// Parse a stem produced for a known case name (`<case>_<subject>_<series>`).
/// Falls back to [`parse_sidecar_name`] when the stem does not start with it.
pub fn parse_sidecar_name_for_case(stem: &str, case_name: &str) -> SidecarName {
    let Some(rest) = stem
        .strip_prefix(case_name)
        .and_then(|r| r.strip_prefix('_'))
    else {
        return parse_sidecar_name(stem);
    };
    let (subject, series) = rest.split_once('_').unwrap_or((rest, UNKNOWN));
    SidecarName {
        case_name: case_name.to_string(),
        subject_id: if subject.is_empty() { UNKNOWN } else { subject }.to_string(),
        series_info: series.to_string(),
    }
}

/// Demographic and study fields captured from the source objects.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RegistryRecord {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub patient_age: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub institution_name: Option<String>,
}

const ALIASES: &[(&str, &[&str])] = &[
    ("PatientID", &["PatientID", "Patient ID", "PatientId"]),
    ("PatientName", &["PatientName", "Patient Name"]),
    (
        "PatientBirthDate",
        &["PatientBirthDate", "PatientBirtDate", "Patient Birth Date"],
    ),
    ("PatientSex", &["PatientSex", "Patient Sex"]),
    ("PatientAge", &["PatientAge", "Patient Age"]),
    ("StudyDate", &["StudyDate", "Study Date"]),
    ("StudyTime", &["StudyTime", "Study Time"]),
    ("InstitutionName", &["InstitutionName", "Institution Name"]),
];

fn column_index(headers: &csv::StringRecord, canonical: &str) -> Option<usize> {
    let aliases = ALIASES
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, a)| *a)
        .unwrap_or(&[]);
    aliases.iter().find_map(|alias| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == *alias)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Exact,
    Substring,
    Unmatched,
}

impl MatchStatus {
    pub fn label(self) -> &'static str {
        match self {
            MatchStatus::Exact => "exact",
            MatchStatus::Substring => "substring",
            MatchStatus::Unmatched => "unmatched",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    records: Vec<RegistryRecord>,
}

impl Registry {
    pub fn from_records(records: Vec<RegistryRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Load a registry CSV, resolving column aliases. Missing columns and
    /// empty cells become `None`.
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        let index = |name: &str| column_index(&headers, name);
        let columns = [
            index("PatientID"),
            index("PatientName"),
            index("PatientBirthDate"),
            index("PatientSex"),
            index("PatientAge"),
            index("StudyDate"),
            index("StudyTime"),
            index("InstitutionName"),
        ];

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let cell = |i: Option<usize>| {
                i.and_then(|i| row.get(i))
                    .map(str::trim)
                    .filter(|v| is_known(v))
                    .map(str::to_string)
            };
            records.push(RegistryRecord {
                patient_id: cell(columns[0]),
                patient_name: cell(columns[1]),
                patient_birth_date: cell(columns[2]),
                patient_sex: cell(columns[3]),
                patient_age: cell(columns[4]),
                study_date: cell(columns[5]),
                study_time: cell(columns[6]),
                institution_name: cell(columns[7]),
            });
        }
        debug!("loaded {} registry records from {:?}", records.len(), path);
        Ok(Self { records })
    }

    /// Exact identifier match first, then the first record whose identifier
    /// contains `subject_id`. Identifiers shorter than
    /// [`MIN_SUBSTRING_MATCH`] only ever match exactly.
    pub fn find(&self, subject_id: &str) -> (MatchStatus, Option<&RegistryRecord>) {
        let subject_id = subject_id.trim();
        if !is_known(subject_id) {
            return (MatchStatus::Unmatched, None);
        }
        let id_of = |r: &RegistryRecord| r.patient_id.clone().unwrap_or_default();
        if let Some(record) = self.records.iter().find(|r| id_of(r) == subject_id) {
            return (MatchStatus::Exact, Some(record));
        }
        if subject_id.chars().count() < MIN_SUBSTRING_MATCH {
            return (MatchStatus::Unmatched, None);
        }
        if let Some(record) = self.records.iter().find(|r| id_of(r).contains(subject_id)) {
            return (MatchStatus::Substring, Some(record));
        }
        (MatchStatus::Unmatched, None)
    }
}

fn parse_compact_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y%m%d").ok()
}

/// Age in years as study year minus birth year. `None` unless both dates
/// are valid `YYYYMMDD` strings and the result is not negative.
pub fn derive_age(birth_date: &str, study_date: &str) -> Option<u32> {
    let birth = parse_compact_date(birth_date)?;
    let study = parse_compact_date(study_date)?;
    u32::try_from(study.year() - birth.year()).ok()
}

/// `045Y` → `45`; bare numbers lose their leading zeros; other units
/// (`006M`) are kept as written.
pub fn clean_age(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if !is_known(raw) {
        return None;
    }
    let digits = raw
        .strip_suffix('Y')
        .or_else(|| raw.strip_suffix('y'))
        .unwrap_or(raw);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return digits.parse::<u32>().ok().map(|n| n.to_string());
    }
    Some(raw.to_string())
}

/// One reconciled row per converted series.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ReconciledRecord {
    pub file_name: String,
    pub case_name: String,
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    pub series_info: String,
    #[serde(rename = "NIfTIFile")]
    pub nifti_file: String,
    pub output_folder: String,
    pub match_status: MatchStatus,
    /// Fields where registry and sidecar both hold a value and disagree,
    /// `;`-separated. The registry value is the one kept.
    pub conflicts: String,

    pub modality: String,
    pub study_date: String,
    pub study_time: String,
    pub study_description: String,
    pub series_number: String,
    pub series_description: String,
    pub protocol_name: String,

    pub patient_name: String,
    pub patient_birth_date: String,
    pub patient_sex: String,
    pub patient_age: String,

    pub slice_thickness: String,
    pub spacing_between_slices: String,
    pub pixel_spacing: String,
    #[serde(rename = "ImageOrientationPatientDICOM")]
    pub image_orientation: String,
    pub repetition_time: String,
    pub echo_time: String,
    pub flip_angle: String,
    pub acquisition_matrix: String,

    pub manufacturer: String,
    pub manufacturer_model_name: String,
    pub magnetic_field_strength: String,
    pub institution_name: String,
    pub station_name: String,

    pub convolution_kernel: String,
    pub reconstruction_diameter: String,
    #[serde(rename = "KVP")]
    pub kvp: String,
    #[serde(rename = "XRayTubeCurrent")]
    pub xray_tube_current: String,
    pub exposure_time: String,

    pub conversion_software: String,
    pub conversion_software_version: String,
}

impl ReconciledRecord {
    pub fn is_matched(&self) -> bool {
        self.match_status != MatchStatus::Unmatched
    }
}

/// Merge one sidecar with the registry record matched on its subject id.
pub fn reconcile(sidecar: &Sidecar, name: &SidecarName, registry: Option<&Registry>) -> ReconciledRecord {
    let (status, record) = registry
        .map(|r| r.find(&name.subject_id))
        .unwrap_or((MatchStatus::Unmatched, None));
    if status == MatchStatus::Unmatched {
        debug!("no registry record for subject {:?}", name.subject_id);
    }
    merge(sidecar, name, record, status)
}

/// Demographic and study fields checked for disagreement.
const CONFLICT_FIELDS: [&str; 6] = [
    "PatientName",
    "PatientBirthDate",
    "PatientSex",
    "StudyDate",
    "StudyTime",
    "InstitutionName",
];

fn registry_field<'a>(record: &'a RegistryRecord, key: &str) -> Option<&'a str> {
    match key {
        "PatientName" => record.patient_name.as_deref(),
        "PatientBirthDate" => record.patient_birth_date.as_deref(),
        "PatientSex" => record.patient_sex.as_deref(),
        "StudyDate" => record.study_date.as_deref(),
        "StudyTime" => record.study_time.as_deref(),
        "InstitutionName" => record.institution_name.as_deref(),
        _ => None,
    }
}

/// Comparable form: person-name carets as spaces, no fractional seconds,
/// case and spacing ignored.
fn normalized(key: &str, value: &str) -> String {
    let value = if key == "StudyTime" {
        value.split('.').next().unwrap_or(value)
    } else {
        value
    };
    value
        .replace('^', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Sidecar keys whose known value differs from the known registry value.
pub fn find_conflicts(sidecar: &Sidecar, record: &RegistryRecord) -> Vec<&'static str> {
    CONFLICT_FIELDS
        .into_iter()
        .filter(|key| {
            let Some(registry_value) = registry_field(record, key).filter(|v| is_known(v)) else {
                return false;
            };
            sidecar
                .known(key)
                .is_some_and(|side| normalized(key, &side) != normalized(key, registry_value))
        })
        .collect()
}

/// Registry value when known, sidecar value otherwise.
fn prefer(registry: Option<&Option<String>>, sidecar: &Sidecar, key: &str) -> String {
    registry
        .and_then(|v| v.as_deref())
        .filter(|v| is_known(v))
        .map(str::to_string)
        .unwrap_or_else(|| sidecar.get(key))
}

pub fn merge(
    sidecar: &Sidecar,
    name: &SidecarName,
    record: Option<&RegistryRecord>,
    status: MatchStatus,
) -> ReconciledRecord {
    let patient_birth_date = prefer(record.map(|r| &r.patient_birth_date), sidecar, "PatientBirthDate");
    let study_date = prefer(record.map(|r| &r.study_date), sidecar, "StudyDate");

    let registry_age = record.and_then(|r| {
        r.patient_age.as_deref().and_then(clean_age).or_else(|| {
            derive_age(
                r.patient_birth_date.as_deref().unwrap_or_default(),
                r.study_date.as_deref().unwrap_or_default(),
            )
            .map(|a| a.to_string())
        })
    });
    let patient_age = registry_age
        .or_else(|| sidecar.known("PatientAge").and_then(|a| clean_age(&a)))
        .or_else(|| derive_age(&patient_birth_date, &study_date).map(|a| a.to_string()))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let file_name = sidecar
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = file_name.strip_suffix(".json").unwrap_or(&file_name);
    let conversion_software = sidecar
        .known("ConversionSoftware")
        .unwrap_or_else(|| "dcm2niix".to_string());
    let conflicts = record
        .map(|r| find_conflicts(sidecar, r))
        .unwrap_or_default();
    if !conflicts.is_empty() {
        warn!("{}: registry and sidecar disagree on {}", file_name, conflicts.join(", "));
    }

    ReconciledRecord {
        nifti_file: format!("{stem}.nii.gz"),
        file_name: file_name.clone(),
        case_name: name.case_name.clone(),
        patient_id: name.subject_id.clone(),
        series_info: name.series_info.clone(),
        output_folder: sidecar
            .path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        match_status: status,
        conflicts: conflicts.join(";"),

        modality: sidecar.get("Modality"),
        study_date,
        study_time: prefer(record.map(|r| &r.study_time), sidecar, "StudyTime"),
        study_description: sidecar.get("StudyDescription"),
        series_number: sidecar.get("SeriesNumber"),
        series_description: sidecar.get("SeriesDescription"),
        protocol_name: sidecar.get("ProtocolName"),

        patient_name: prefer(record.map(|r| &r.patient_name), sidecar, "PatientName"),
        patient_birth_date,
        patient_sex: prefer(record.map(|r| &r.patient_sex), sidecar, "PatientSex"),
        patient_age,

        slice_thickness: sidecar.get("SliceThickness"),
        spacing_between_slices: sidecar.get("SpacingBetweenSlices"),
        pixel_spacing: sidecar.get("PixelSpacing"),
        image_orientation: sidecar.get("ImageOrientationPatientDICOM"),
        repetition_time: sidecar.get("RepetitionTime"),
        echo_time: sidecar.get("EchoTime"),
        flip_angle: sidecar.get("FlipAngle"),
        acquisition_matrix: sidecar.get("AcquisitionMatrixPE"),

        manufacturer: sidecar.get("Manufacturer"),
        manufacturer_model_name: sidecar.get("ManufacturersModelName"),
        magnetic_field_strength: sidecar.get("MagneticFieldStrength"),
        institution_name: prefer(record.map(|r| &r.institution_name), sidecar, "InstitutionName"),
        station_name: sidecar.get("StationName"),

        convolution_kernel: sidecar.get("ConvolutionKernel"),
        reconstruction_diameter: sidecar.get("ReconstructionDiameter"),
        kvp: sidecar.get("KVP"),
        xray_tube_current: sidecar.get("XRayTubeCurrent"),
        exposure_time: sidecar.get("ExposureTime"),

        conversion_software,
        conversion_software_version: sidecar.get("ConversionSoftwareVersion"),
    }
}

/// Sidecar name of `path`. Sidecars inside a case folder are parsed against
/// that folder's name, which is the case name the converter was given.
pub fn sidecar_name_of(path: &Path) -> SidecarName {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let folder = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if !folder.is_empty() && stem.starts_with(&format!("{folder}_")) {
        parse_sidecar_name_for_case(&stem, &folder)
    } else {
        parse_sidecar_name(&stem)
    }
}

/// Converter sidecars under `dir`, sorted. Batch reports are skipped.
pub fn collect_sidecars(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            name.ends_with(".json") && !name.starts_with("conversion_report_")
        })
        .collect()
}

/// Reconcile every sidecar under `dir`. Unreadable sidecars are logged and
/// skipped.
pub fn reconcile_directory(dir: &Path, registry: Option<&Registry>) -> Vec<ReconciledRecord> {
    collect_sidecars(dir)
        .into_iter()
        .filter_map(|path| match Sidecar::load(&path) {
            Ok(sidecar) => Some(reconcile(&sidecar, &sidecar_name_of(&path), registry)),
            Err(e) => {
                warn!("skipping sidecar {:?}: {}", path, e);
                None
            }
        })
        .collect()
}
