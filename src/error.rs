use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Case-level and run-level failures of the preparation pipeline.
///
/// Files that fail to parse never show up here: they are dropped from the
/// catalog at the parsing boundary.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no eligible series: {reason}")]
    NoEligibleSeries { reason: String },

    #[error("archive extraction failed for {archive:?}: {message}")]
    Extraction { archive: PathBuf, message: String },

    #[error("converter exited with status {status}: {diagnostics}")]
    ConversionFailed { status: String, diagnostics: String },

    #[error("converter timed out after {seconds}s")]
    ConversionTimeout { seconds: u64, diagnostics: String },

    #[error("converter binary not found (searched: {searched})")]
    ConverterMissing { searched: String },

    #[error("de-identification failed for {path:?}: {message}")]
    Deid { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Bucket used in the batch summary and the failed-case log.
    pub fn category(&self) -> FailureCategory {
        match self {
            PipelineError::NoEligibleSeries { .. } => FailureCategory::InputData,
            PipelineError::Extraction { .. } | PipelineError::Zip(_) => FailureCategory::Archive,
            PipelineError::ConversionFailed { diagnostics, .. } => classify_failure(diagnostics),
            PipelineError::ConversionTimeout { .. } | PipelineError::ConverterMissing { .. } => {
                FailureCategory::Tool
            }
            PipelineError::Deid { .. }
            | PipelineError::Config(_)
            | PipelineError::Csv(_)
            | PipelineError::Json(_)
            | PipelineError::Io(_) => FailureCategory::Other,
        }
    }

    /// Whether rerunning the same case could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ConversionTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    InputData,
    Tool,
    Archive,
    Other,
}

impl FailureCategory {
    pub fn label(self) -> &'static str {
        match self {
            FailureCategory::InputData => "input data problem",
            FailureCategory::Tool => "converter failure",
            FailureCategory::Archive => "archive problem",
            FailureCategory::Other => "other",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

type Rule = (fn(&str) -> bool, FailureCategory);

/// Evaluated top to bottom against the lowercased diagnostic text; first hit wins.
const CLASSIFICATION_RULES: &[Rule] = &[
    (
        |t| t.contains("no valid dicom") || t.contains("no suitable series") || t.contains("no eligible series"),
        FailureCategory::InputData,
    ),
    (|t| t.contains("thickness"), FailureCategory::InputData),
    (
        |t| t.contains("dcm2niix") || t.contains("converter") || t.contains("timed out"),
        FailureCategory::Tool,
    ),
    (
        |t| t.contains("extract") || t.contains("zip") || t.contains("archive"),
        FailureCategory::Archive,
    ),
];

/// Keyword heuristic over free-form diagnostic text.
pub fn classify_failure(diagnostics: &str) -> FailureCategory {
    let lowered = diagnostics.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(matches, _)| matches(&lowered))
        .map(|(_, category)| *category)
        .unwrap_or(FailureCategory::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_are_ordered() {
        // mentions both a missing series and the converter: the input rule comes first
        assert_eq!(
            classify_failure("dcm2niix: No valid DICOM files found"),
            FailureCategory::InputData
        );
        assert_eq!(
            classify_failure("No series found with slice thickness in 4.5-5.5mm range"),
            FailureCategory::InputData
        );
        assert_eq!(classify_failure("dcm2niix crashed"), FailureCategory::Tool);
        assert_eq!(classify_failure("Failed to extract member"), FailureCategory::Archive);
        assert_eq!(classify_failure("disk full"), FailureCategory::Other);
        assert_eq!(classify_failure(""), FailureCategory::Other);
    }

    #[test]
    fn test_error_categories() {
        let err = PipelineError::NoEligibleSeries {
            reason: "empty catalog".into(),
        };
        assert_eq!(err.category(), FailureCategory::InputData);

        let err = PipelineError::ConversionTimeout {
            seconds: 300,
            diagnostics: String::new(),
        };
        assert_eq!(err.category(), FailureCategory::Tool);
        assert!(err.is_retryable());

        let err = PipelineError::ConversionFailed {
            status: "1".into(),
            diagnostics: "Unable to open archive".into(),
        };
        assert_eq!(err.category(), FailureCategory::Archive);
        assert!(!err.is_retryable());
    }
}
