//! Run configuration.
//!
//! Everything has a default; a TOML file may override any subset and CLI
//! flags are applied on top by the binary.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub selection: SelectionConfig,
    pub converter: ConverterConfig,
    pub identity: IdentityConfig,
    pub extraction: ExtractionConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(range) = &self.selection.thickness_range {
            if !(range.min_mm <= range.max_mm) {
                return Err(PipelineError::Config(format!(
                    "thickness range is empty: {} > {}",
                    range.min_mm, range.max_mm
                )));
            }
        }
        if self.identity.surrogate_prefix.trim().is_empty() {
            return Err(PipelineError::Config("surrogate prefix must not be empty".into()));
        }
        if self.converter.timeout_secs == 0 || self.converter.extended_timeout_secs == 0 {
            return Err(PipelineError::Config("converter timeouts must be positive".into()));
        }
        // outputs are found again by their case-name prefix
        if !self.converter.name_template.starts_with("{case}") {
            return Err(PipelineError::Config(format!(
                "converter name template must start with {{case}}: {:?}",
                self.converter.name_template
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Lexicographic,
    Scored,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    pub policy: PolicyKind,
    /// Groups outside this range (or without a readable thickness) are discarded.
    pub thickness_range: Option<ThicknessRange>,
    pub weights: ScoreWeights,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Lexicographic,
            thickness_range: None,
            weights: ScoreWeights::default(),
        }
    }
}

/// Inclusive slice-thickness window in millimetres.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ThicknessRange {
    pub min_mm: f64,
    pub max_mm: f64,
}

impl ThicknessRange {
    pub fn new(min_mm: f64, max_mm: f64) -> Self {
        Self { min_mm, max_mm }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min_mm <= value && value <= self.max_mm
    }
}

impl Default for ThicknessRange {
    fn default() -> Self {
        Self::new(4.5, 5.5)
    }
}

/// Weights of the scored selection policy. The defaults are empirical.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub per_object: f64,
    pub count_cap: f64,
    pub area_divisor: f64,
    pub area_cap: f64,
    pub penalty_keywords: Vec<String>,
    pub keyword_penalty: f64,
    pub bonus_keywords: Vec<String>,
    pub keyword_bonus: f64,
    pub series_number_threshold: i32,
    pub series_number_bonus: f64,
    pub preferred_modality: String,
    pub modality_bonus: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            per_object: 2.0,
            count_cap: 100.0,
            area_divisor: 1000.0,
            area_cap: 50.0,
            penalty_keywords: ["topogram", "scout", "localizer", "overview"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            keyword_penalty: 50.0,
            bonus_keywords: ["chest", "thorax", "lung", "helical"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            keyword_bonus: 30.0,
            series_number_threshold: 100,
            series_number_bonus: 10.0,
            preferred_modality: "CT".to_string(),
            modality_bonus: 20.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConverterConfig {
    /// Tried in order; the first existing one is used.
    pub candidates: Vec<PathBuf>,
    pub timeout_secs: u64,
    pub extended_timeout_secs: u64,
    /// Series with more objects than this get the extended timeout.
    pub large_series_threshold: usize,
    /// `{case}` is replaced by the case name; the rest is passed to the tool verbatim.
    pub name_template: String,
    pub compress: bool,
    pub sidecar: bool,
    pub verbosity: u8,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                PathBuf::from("dcm2niix"),
                PathBuf::from("./dcm2niix"),
                PathBuf::from("./tools/MRIcroGL/Resources/dcm2niix"),
            ],
            timeout_secs: 300,
            extended_timeout_secs: 600,
            large_series_threshold: 500,
            name_template: "{case}_%i_%s_%p".to_string(),
            compress: true,
            sidecar: true,
            verbosity: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LabelStrategy {
    /// Embedded subject identifier.
    Subject,
    /// Archive stem or folder name.
    Source,
    /// `<source>_<subject>`.
    SourceSubject,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    pub surrogate_prefix: String,
    pub surrogate_base: u32,
    pub surrogate_width: usize,
    /// `None` picks by input mode: subject for single inputs, source-subject for batches.
    pub label_strategy: Option<LabelStrategy>,
    /// Directory names never treated as new input.
    pub excluded_dirs: Vec<String>,
    pub output_dir_name: String,
    pub deid_dir_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            surrogate_prefix: "ANON".to_string(),
            surrogate_base: 1,
            surrogate_width: 5,
            label_strategy: None,
            excluded_dirs: vec![".git".to_string(), "__pycache__".to_string()],
            output_dir_name: "output".to_string(),
            deid_dir_name: "output_deid".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Working copies are created as `<prefix><archive stem>` next to the archive.
    pub work_prefix: String,
    pub keep_working_copies: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            work_prefix: "temp_extract_".to_string(),
            keep_working_copies: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [selection]
            policy = "scored"
            thickness_range = { min_mm = 0.5, max_mm = 1.5 }

            [identity]
            surrogate_prefix = "CHD"
            label_strategy = "source"
            "#,
        )
        .unwrap();

        assert_eq!(config.selection.policy, PolicyKind::Scored);
        assert_eq!(config.selection.thickness_range, Some(ThicknessRange::new(0.5, 1.5)));
        assert_eq!(config.selection.weights, ScoreWeights::default());
        assert_eq!(config.identity.surrogate_prefix, "CHD");
        assert_eq!(config.identity.label_strategy, Some(LabelStrategy::Source));
        assert_eq!(config.identity.surrogate_width, 5);
        assert_eq!(config.converter.timeout_secs, 300);
    }

    #[test]
    fn test_rejects_inverted_range() {
        let err = PipelineConfig::from_toml_str(
            "[selection]\nthickness_range = { min_mm = 5.5, max_mm = 4.5 }\n",
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_rejects_name_template_without_case_prefix() {
        for template in ["%i_%s_%p", "out_{case}_%s"] {
            let err = PipelineConfig::from_toml_str(&format!("[converter]\nname_template = \"{template}\"\n"))
                .unwrap_err();
            assert!(err.to_string().contains("name template"), "{err}");
        }
        assert!(PipelineConfig::from_toml_str("[converter]\nname_template = \"{case}_%s\"\n").is_ok());
    }

    #[test]
    fn test_range_is_inclusive() {
        let range = ThicknessRange::default();
        assert!(range.contains(4.5));
        assert!(range.contains(5.5));
        assert!(!range.contains(4.49));
        assert!(!range.contains(f64::NAN));
    }
}
