//! De-identified copies of source objects.
//!
//! Every object of a case is rewritten with PatientName and PatientID set to
//! the case surrogate. PatientBirthDate is blanked and InstitutionName /
//! ReferringPhysicianName are overwritten, but only where the source carries
//! them; no attribute is added that was not there before.

use crate::catalog::ImagingObject;
use crate::error::{PipelineError, Result};
use crate::identity::Case;
use crate::reconcile::clean_age;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::file::ReadPreamble;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const REDACTED: &str = "ANONYMIZED";

fn open_full(path: &Path) -> Result<DefaultDicomObject> {
    let strict = OpenFileOptions::new().open_file(path);
    match strict {
        Ok(obj) => Ok(obj),
        Err(first) => [ReadPreamble::Always, ReadPreamble::Never]
            .into_iter()
            .find_map(|preamble| {
                OpenFileOptions::new()
                    .read_preamble(preamble)
                    .open_file(path)
                    .ok()
            })
            .ok_or_else(|| PipelineError::Deid {
                path: path.to_path_buf(),
                message: first.to_string(),
            }),
    }
}

fn has(obj: &DefaultDicomObject, tag: Tag) -> bool {
    obj.element_opt(tag).ok().flatten().is_some()
}

/// Apply the de-identification rules in place.
pub fn deidentify_object(obj: &mut DefaultDicomObject, surrogate: &str) {
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from(surrogate.to_string()),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from(surrogate.to_string()),
    ));
    if has(obj, tags::PATIENT_BIRTH_DATE) {
        obj.put(DataElement::new(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            PrimitiveValue::Empty,
        ));
    }
    if has(obj, tags::INSTITUTION_NAME) {
        obj.put(DataElement::new(
            tags::INSTITUTION_NAME,
            VR::LO,
            PrimitiveValue::from(REDACTED),
        ));
    }
    if has(obj, tags::REFERRING_PHYSICIAN_NAME) {
        obj.put(DataElement::new(
            tags::REFERRING_PHYSICIAN_NAME,
            VR::PN,
            PrimitiveValue::from(REDACTED),
        ));
    }
}

pub fn deidentify_file(source: &Path, destination: &Path, surrogate: &str) -> Result<()> {
    let mut obj = open_full(source)?;
    deidentify_object(&mut obj, surrogate);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    obj.write_to_file(destination)
        .map_err(|e| PipelineError::Deid {
            path: destination.to_path_buf(),
            message: e.to_string(),
        })
}

/// One row of the de-identification mapping table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DeidCaseSummary {
    pub case: String,
    #[serde(rename = "NewPatientID")]
    pub new_patient_id: String,
    pub original_patient_name: String,
    #[serde(rename = "OriginalPatientID")]
    pub original_patient_id: String,
    pub patient_birth_date: String,
    pub patient_age: String,
    pub patient_sex: String,
    pub study_date: String,
    pub file_count: usize,
    #[serde(skip)]
    pub files_written: usize,
    #[serde(skip)]
    pub output_dir: PathBuf,
}

impl DeidCaseSummary {
    fn new(label: &str, surrogate: &str, first: Option<&ImagingObject>, file_count: usize, output_dir: &Path) -> Self {
        let text = |v: Option<&String>| v.cloned().unwrap_or_default();
        Self {
            case: label.to_string(),
            new_patient_id: surrogate.to_string(),
            original_patient_name: text(first.and_then(|o| o.patient.patient_name.as_ref())),
            original_patient_id: text(first.and_then(|o| o.patient.patient_id.as_ref())),
            patient_birth_date: text(first.and_then(|o| o.patient.patient_birth_date.as_ref())),
            patient_age: first
                .and_then(|o| o.patient.patient_age.as_deref())
                .and_then(clean_age)
                .unwrap_or_default(),
            patient_sex: text(first.and_then(|o| o.patient.patient_sex.as_ref())),
            study_date: text(first.and_then(|o| o.study.study_date.as_ref())),
            file_count,
            files_written: 0,
            output_dir: output_dir.to_path_buf(),
        }
    }
}

/// Unique output name within one case folder. Colliding base names get an
/// index prefix.
fn output_name(object: &ImagingObject, index: usize, used: &mut BTreeSet<String>) -> String {
    let base = object.file_name();
    let name = if used.contains(&base) {
        format!("{:05}_{}", index + 1, base)
    } else {
        base
    };
    used.insert(name.clone());
    name
}

/// Write de-identified copies of every object of `case` into `output_dir`.
/// Objects that fail to rewrite are logged and skipped.
pub fn deidentify_case(case: &Case, surrogate: &str, output_dir: &Path) -> Result<DeidCaseSummary> {
    fs::create_dir_all(output_dir)?;
    let mut summary = DeidCaseSummary::new(
        case.label.as_str(),
        surrogate,
        case.objects.first(),
        case.objects.len(),
        output_dir,
    );

    let mut used = BTreeSet::new();
    for (index, object) in case.objects.iter().enumerate() {
        let destination = output_dir.join(output_name(object, index, &mut used));
        match deidentify_file(&object.path, &destination, surrogate) {
            Ok(()) => summary.files_written += 1,
            Err(e) => warn!("could not de-identify {:?}: {}", object.path, e),
        }
    }
    debug!(
        "de-identified {} -> {}: {}/{} files",
        case.label,
        surrogate,
        summary.files_written,
        summary.file_count
    );
    Ok(summary)
}
