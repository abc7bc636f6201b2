#![cfg(unix)]

mod common;

use common::{SeriesSpec, failing_converter, fake_converter, write_series, zip_directory};
use dcm_prep::config::PipelineConfig;
use dcm_prep::error::FailureCategory;
use dcm_prep::pipeline::{self, RunOptions, Stage};
use dcm_prep::reconcile::MatchStatus;
use dcm_prep::report::CaseStatus;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn config_with(converter: PathBuf) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.converter.candidates = vec![converter];
    config.converter.timeout_secs = 30;
    config.converter.extended_timeout_secs = 60;
    config
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn single_folder_is_converted_reduced_and_reconciled() {
    let dir = TempDir::new().unwrap();
    let study = dir.path().join("study");
    write_series(&study, "chest", &SeriesSpec::new("2.1.1", "P001").number(2), 12);
    write_series(&study, "scout", &SeriesSpec::new("2.1.2", "P001").number(1).description("scout"), 2);
    let config = config_with(fake_converter(dir.path()));
    let options = RunOptions {
        input: study.clone(),
        ..RunOptions::default()
    };

    let summary = pipeline::run(&options, &config, Stage::Convert).unwrap();
    let case = &summary.report.cases[0];
    assert_eq!(case.status, CaseStatus::Converted, "{:?}", case.error);

    let case_dir = study.join("output").join("P001");
    let names = file_names(&case_dir);
    assert!(names.contains(&"P001_P001_2_main.nii.gz".to_string()));
    assert!(names.contains(&"P001_P001_2_main.json".to_string()));
    assert!(!names.iter().any(|n| n.contains("_1_part")));
    assert!(names.iter().any(|n| n.starts_with("converter_") && n.ends_with(".log")));
    assert_eq!(case.outputs, vec![case_dir.join("P001_P001_2_main.nii.gz")]);

    let log = names.iter().find(|n| n.starts_with("converter_")).unwrap();
    let log = fs::read_to_string(case_dir.join(log)).unwrap();
    assert!(log.contains("--- STDOUT ---"));
    assert!(log.contains("Conversion required 12 files"));

    assert_eq!(case.records.len(), 1);
    let record = &case.records[0];
    assert_eq!(record.match_status, MatchStatus::Exact);
    assert_eq!(record.patient_name, "Test Patient");
    assert_eq!(record.patient_age, "50");
    assert_eq!(record.series_description, "main");
    assert!(summary.paths.metadata_summary.as_ref().unwrap().exists());
    assert!(summary.paths.failed_cases.is_none());

    let again = pipeline::run(&options, &config, Stage::Convert).unwrap();
    assert_eq!(again.report.cases[0].status, CaseStatus::Skipped);
    assert_eq!(again.report.cases[0].records.len(), 1);
}

#[test]
fn parallel_batch_of_archives_cleans_up_working_copies() {
    let dir = TempDir::new().unwrap();
    let batch = dir.path().join("batch");
    fs::create_dir_all(&batch).unwrap();
    for (name, uid) in [("a", "2.2.1"), ("b", "2.2.2"), ("c", "2.2.3")] {
        let content = dir.path().join(format!("content_{name}"));
        write_series(&content, "s", &SeriesSpec::new(uid, "P001"), 3);
        zip_directory(&content, &batch.join(format!("{name}.zip")));
    }
    let config = config_with(fake_converter(dir.path()));
    let options = RunOptions {
        input: batch.clone(),
        parallel: true,
        ..RunOptions::default()
    };

    let summary = pipeline::run(&options, &config, Stage::Convert).unwrap();
    let labels: Vec<(String, String)> = summary
        .report
        .cases
        .iter()
        .map(|c| (c.label.to_string(), c.surrogate.clone()))
        .collect();
    assert_eq!(
        labels,
        vec![
            ("a_P001".to_string(), "ANON_00001".to_string()),
            ("b_P001".to_string(), "ANON_00002".to_string()),
            ("c_P001".to_string(), "ANON_00003".to_string()),
        ]
    );
    assert!(summary.report.cases.iter().all(|c| c.status == CaseStatus::Converted));
    for name in ["a", "b", "c"] {
        assert!(!batch.join(format!("temp_extract_{name}")).exists());
        assert!(batch.join("output").join(format!("{name}_P001")).is_dir());
    }
    assert!(!batch.join("output").join("temp_dcm2niix_processing").exists());
}

#[test]
fn converter_failure_is_recorded_and_working_copy_kept() {
    let dir = TempDir::new().unwrap();
    let content = dir.path().join("content");
    write_series(&content, "s", &SeriesSpec::new("2.3.1", "P009"), 2);
    let archive = dir.path().join("broken_case.zip");
    zip_directory(&content, &archive);

    let config = config_with(failing_converter(dir.path()));
    let options = RunOptions {
        input: archive,
        ..RunOptions::default()
    };
    let summary = pipeline::run(&options, &config, Stage::Convert).unwrap();

    let case = &summary.report.cases[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert_eq!(case.category, Some(FailureCategory::Archive));
    assert!(case.diagnostics.contains("unable to read archive"));
    assert!(!case.retryable);
    assert!(dir.path().join("temp_extract_broken_case").is_dir());

    let failed = fs::read_to_string(summary.paths.failed_cases.as_ref().unwrap()).unwrap();
    assert!(failed.contains(case.label.as_str()));
    assert!(failed.contains("unable to read archive"));
}

#[test]
fn missing_converter_is_fatal() {
    let dir = TempDir::new().unwrap();
    let study = dir.path().join("study");
    write_series(&study, "s", &SeriesSpec::new("2.4.1", "P010"), 1);
    let config = config_with(dir.path().join("no-such-converter"));
    let options = RunOptions {
        input: study.clone(),
        ..RunOptions::default()
    };
    let err = pipeline::run(&options, &config, Stage::Convert).unwrap_err();
    assert!(err.to_string().contains("converter binary not found"));
    assert!(!study.join("output").exists());
}
