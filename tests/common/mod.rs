#![allow(dead_code)]

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Attributes of one synthetic series.
#[derive(Debug, Clone)]
pub struct SeriesSpec {
    pub series_uid: String,
    pub series_number: i32,
    pub description: String,
    pub modality: String,
    pub rows: u16,
    pub columns: u16,
    pub patient_id: String,
    pub patient_name: String,
    pub slice_thickness: Option<String>,
}

impl SeriesSpec {
    pub fn new(series_uid: &str, patient_id: &str) -> Self {
        Self {
            series_uid: series_uid.to_string(),
            series_number: 1,
            description: String::new(),
            modality: "CT".to_string(),
            rows: 512,
            columns: 512,
            patient_id: patient_id.to_string(),
            patient_name: "Test Patient".to_string(),
            slice_thickness: None,
        }
    }

    pub fn number(mut self, n: i32) -> Self {
        self.series_number = n;
        self
    }

    pub fn description(mut self, d: &str) -> Self {
        self.description = d.to_string();
        self
    }

    pub fn thickness(mut self, t: &str) -> Self {
        self.slice_thickness = Some(t.to_string());
        self
    }

    pub fn size(mut self, rows: u16, columns: u16) -> Self {
        self.rows = rows;
        self.columns = columns;
        self
    }
}

fn put_str(obj: &mut InMemDicomObject, tag: dicom_core::Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

/// Write one slice of `spec` to `path` as a Part 10 file.
pub fn write_slice(path: &Path, spec: &SeriesSpec, instance: u32) {
    let sop_uid = format!("{}.{}", spec.series_uid, instance);
    let mut obj = InMemDicomObject::new_empty();
    put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE);
    put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, &sop_uid);
    put_str(&mut obj, tags::PATIENT_ID, VR::LO, &spec.patient_id);
    put_str(&mut obj, tags::PATIENT_NAME, VR::PN, &spec.patient_name);
    put_str(&mut obj, tags::PATIENT_BIRTH_DATE, VR::DA, "19700315");
    put_str(&mut obj, tags::PATIENT_SEX, VR::CS, "M");
    put_str(&mut obj, tags::STUDY_DATE, VR::DA, "20200101");
    put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.1");
    put_str(&mut obj, tags::INSTITUTION_NAME, VR::LO, "General Hospital");
    put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, &spec.series_uid);
    put_str(&mut obj, tags::SERIES_NUMBER, VR::IS, &spec.series_number.to_string());
    put_str(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, &spec.description);
    put_str(&mut obj, tags::MODALITY, VR::CS, &spec.modality);
    if let Some(thickness) = &spec.slice_thickness {
        put_str(&mut obj, tags::SLICE_THICKNESS, VR::DS, thickness);
    }
    obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(spec.rows)));
    obj.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(spec.columns)));

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_uid.as_str())
        .transfer_syntax(EXPLICIT_VR_LE);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    obj.with_meta(meta).unwrap().write_to_file(path).unwrap();
}

/// Write `count` slices of `spec` into `dir` as `<prefix>_NNN.dcm`.
pub fn write_series(dir: &Path, prefix: &str, spec: &SeriesSpec, count: u32) -> Vec<PathBuf> {
    (1..=count)
        .map(|i| {
            let path = dir.join(format!("{prefix}_{i:03}.dcm"));
            write_slice(&path, spec, i);
            path
        })
        .collect()
}

/// Zip every file under `dir` (relative names) into `archive`.
pub fn zip_directory(dir: &Path, archive: &Path) {
    let file = File::create(archive).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(dir)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        zip.start_file(name, zip::write::FileOptions::default()).unwrap();
        zip.write_all(&fs::read(entry.path()).unwrap()).unwrap();
    }
    zip.finish().unwrap();
}

/// Zip `dir` uncompressed and append one member whose stored bytes no
/// longer match its CRC, so reading it always fails.
pub fn zip_with_damaged_member(dir: &Path, archive: &Path, damaged_name: &str) {
    const PAYLOAD: &[u8] = b"DAMAGED_MEMBER_PAYLOAD";
    let stored = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let file = File::create(archive).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.path().strip_prefix(dir).unwrap().to_string_lossy().replace('\\', "/");
        zip.start_file(name, stored).unwrap();
        zip.write_all(&fs::read(entry.path()).unwrap()).unwrap();
    }
    zip.start_file(damaged_name, stored).unwrap();
    zip.write_all(PAYLOAD).unwrap();
    zip.finish().unwrap();

    let mut bytes = fs::read(archive).unwrap();
    let at = bytes.windows(PAYLOAD.len()).position(|w| w == PAYLOAD).unwrap();
    bytes[at] ^= 0xff;
    fs::write(archive, bytes).unwrap();
}

/// A fake converter: writes two outputs of different sizes (plus sidecars)
/// named after the `-f` template, like a tool that re-split the series.
#[cfg(unix)]
pub fn fake_converter(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake_dcm2niix");
    let script = r#"#!/bin/sh
name=$(echo "$2" | sed 's/_%i_%s_%p//')
out="$4"
input="${11}"
count=$(ls "$input" | wc -l)
head -c 64 /dev/zero > "$out/${name}_P001_1_part.nii.gz"
echo '{"Modality":"CT","SeriesDescription":"part"}' > "$out/${name}_P001_1_part.json"
head -c 4096 /dev/zero > "$out/${name}_P001_2_main.nii.gz"
echo '{"Modality":"CT","SeriesDescription":"main","SliceThickness":5,"PatientName":"FROM^SIDECAR"}' > "$out/${name}_P001_2_main.json"
echo "Conversion required $count files"
"#;
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A converter that always fails.
#[cfg(unix)]
pub fn failing_converter(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("broken_dcm2niix");
    fs::write(&path, "#!/bin/sh\necho 'Error: unable to read archive' >&2\nexit 1\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
