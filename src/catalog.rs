//! Series catalog: parse every file under a tree and group the imaging
//! objects by series instance UID.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::file::ReadPreamble;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

pub const UNKNOWN_SERIES: &str = "unknown";
pub const UNKNOWN_SUBJECT: &str = "Unknown";

/// Demographic attributes captured at scan time. These become the registry
/// record of the case.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PatientInfo {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub patient_age: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StudyInfo {
    pub study_instance_uid: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub institution_name: Option<String>,
    pub manufacturer: Option<String>,
}

/// One parsed file. Every recognized attribute is present; absent ones carry
/// their sentinel or `None`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImagingObject {
    pub path: PathBuf,
    pub series_uid: String,
    pub series_number: i32,
    pub series_description: String,
    pub modality: String,
    pub rows: u32,
    pub columns: u32,
    pub subject_id: String,
    /// Raw SliceThickness text, kept unparsed so selection can report it verbatim.
    pub slice_thickness: Option<String>,
    pub byte_size: u64,
    pub patient: PatientInfo,
    pub study: StudyInfo,
}

impl ImagingObject {
    /// A bare object with every attribute at its sentinel value.
    pub fn new(path: impl Into<PathBuf>, series_uid: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            series_uid: series_uid.into(),
            series_number: 0,
            series_description: String::new(),
            modality: String::new(),
            rows: 0,
            columns: 0,
            subject_id: UNKNOWN_SUBJECT.to_string(),
            slice_thickness: None,
            byte_size: 0,
            patient: PatientInfo::default(),
            study: StudyInfo::default(),
        }
    }

    pub fn pixel_area(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// The single parsing boundary. Anything that cannot be read as a DICOM
/// object yields `None`.
pub fn parse_imaging_object(path: &Path) -> Option<ImagingObject> {
    let obj = open_permissive(path)?;
    let byte_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let patient = PatientInfo {
        patient_id: string_attr(&obj, tags::PATIENT_ID),
        patient_name: string_attr(&obj, tags::PATIENT_NAME),
        patient_birth_date: string_attr(&obj, tags::PATIENT_BIRTH_DATE),
        patient_sex: string_attr(&obj, tags::PATIENT_SEX),
        patient_age: string_attr(&obj, tags::PATIENT_AGE),
    };
    let study = StudyInfo {
        study_instance_uid: string_attr(&obj, tags::STUDY_INSTANCE_UID),
        study_date: string_attr(&obj, tags::STUDY_DATE),
        study_time: string_attr(&obj, tags::STUDY_TIME),
        study_description: string_attr(&obj, tags::STUDY_DESCRIPTION),
        institution_name: string_attr(&obj, tags::INSTITUTION_NAME),
        manufacturer: string_attr(&obj, tags::MANUFACTURER),
    };

    Some(ImagingObject {
        path: path.to_path_buf(),
        series_uid: string_attr(&obj, tags::SERIES_INSTANCE_UID)
            .unwrap_or_else(|| UNKNOWN_SERIES.to_string()),
        series_number: int_attr(&obj, tags::SERIES_NUMBER)
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(0),
        series_description: string_attr(&obj, tags::SERIES_DESCRIPTION).unwrap_or_default(),
        modality: string_attr(&obj, tags::MODALITY).unwrap_or_default(),
        rows: int_attr(&obj, tags::ROWS)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        columns: int_attr(&obj, tags::COLUMNS)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        subject_id: patient
            .patient_id
            .clone()
            .unwrap_or_else(|| UNKNOWN_SUBJECT.to_string()),
        slice_thickness: string_attr(&obj, tags::SLICE_THICKNESS),
        byte_size,
        patient,
        study,
    })
}

/// Strict open first, then retry with each explicit preamble mode so that
/// files with a missing or bogus preamble still get through.
fn open_permissive(path: &Path) -> Option<DefaultDicomObject> {
    match OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
    {
        Ok(obj) => return Some(obj),
        Err(e) => trace!("strict open failed for {:?}: {}", path, e),
    }

    for preamble in [ReadPreamble::Always, ReadPreamble::Never] {
        if let Ok(obj) = OpenFileOptions::new()
            .read_preamble(preamble)
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
        {
            debug!("opened {:?} in permissive mode", path);
            return Some(obj);
        }
    }
    None
}

fn string_attr(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_str().ok())
        .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
        .filter(|s| !s.is_empty())
}

fn int_attr(obj: &DefaultDicomObject, tag: Tag) -> Option<i64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_int::<i64>().ok())
}

/// Regular files under `root`, in a stable (name-sorted) order.
pub fn list_files(root: &Path) -> Vec<PathBuf> {
    list_files_excluding(root, |_| false)
}

/// Like [`list_files`], without descending into directories `excluded`
/// accepts. `root` itself is always walked.
pub fn list_files_excluding<F>(root: &Path, excluded: F) -> Vec<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !excluded(e.path())
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

/// Parse every regular file under `root`. Order follows [`list_files`].
pub fn scan_directory(root: &Path) -> Vec<ImagingObject> {
    scan_directory_excluding(root, |_| false)
}

/// Parse every regular file under `root`, skipping excluded directories.
pub fn scan_directory_excluding<F>(root: &Path, excluded: F) -> Vec<ImagingObject>
where
    F: Fn(&Path) -> bool,
{
    let files = list_files_excluding(root, excluded);
    let objects: Vec<ImagingObject> = files
        .par_iter()
        .filter_map(|path| parse_imaging_object(path))
        .collect();
    debug!(
        "scanned {:?}: {} of {} files parsed",
        root,
        objects.len(),
        files.len()
    );
    objects
}

/// Whether any of the first few files in the first levels of `dir` parses.
pub fn has_imaging_files(dir: &Path, max_depth: usize, per_dir: usize) -> bool {
    let mut seen_per_dir: BTreeMap<PathBuf, usize> = BTreeMap::new();
    for entry in WalkDir::new(dir)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let parent = entry.path().parent().map(Path::to_path_buf).unwrap_or_default();
        let seen = seen_per_dir.entry(parent).or_insert(0);
        if *seen >= per_dir {
            continue;
        }
        *seen += 1;
        if parse_imaging_object(entry.path()).is_some() {
            return true;
        }
    }
    false
}

/// Series UID → members, in scan order. Membership is exhaustive over the
/// objects it was built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesCatalog {
    groups: BTreeMap<String, Vec<ImagingObject>>,
}

impl SeriesCatalog {
    pub fn from_objects<I>(objects: I) -> Self
    where
        I: IntoIterator<Item = ImagingObject>,
    {
        let mut groups: BTreeMap<String, Vec<ImagingObject>> = BTreeMap::new();
        for object in objects {
            groups.entry(object.series_uid.clone()).or_default().push(object);
        }
        Self { groups }
    }

    /// Scan `root` and group what parses. An empty catalog means no series found.
    pub fn build(root: &Path) -> Self {
        Self::from_objects(scan_directory(root))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn object_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn get(&self, series_uid: &str) -> Option<&[ImagingObject]> {
        self.groups.get(series_uid).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ImagingObject])> {
        self.groups
            .iter()
            .map(|(uid, members)| (uid.as_str(), members.as_slice()))
    }

    pub fn into_groups(self) -> BTreeMap<String, Vec<ImagingObject>> {
        self.groups
    }
}
