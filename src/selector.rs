//! Picks the one series per case that gets converted.
//!
//! Two rankings are available: a plain lexicographic key (slice count, pixel
//! area, CT preference, series number) and a weighted score. Either can be
//! preceded by a hard slice-thickness filter. Every tie is broken
//! deterministically; the smallest series UID wins a full tie.

use crate::catalog::{ImagingObject, SeriesCatalog};
use crate::config::{PolicyKind, ScoreWeights, SelectionConfig, ThicknessRange};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

const PRIORITY_MODALITY: &str = "CT";

/// Compared field by field, in declaration order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectionKey {
    pub object_count: usize,
    pub pixel_area: u64,
    pub modality_priority: u8,
    pub series_number: i32,
}

impl SelectionKey {
    pub fn for_group(members: &[ImagingObject]) -> Self {
        let first = members.first();
        Self {
            object_count: members.len(),
            pixel_area: first.map(ImagingObject::pixel_area).unwrap_or(0),
            modality_priority: first
                .map(|m| u8::from(m.modality.eq_ignore_ascii_case(PRIORITY_MODALITY)))
                .unwrap_or(0),
            series_number: first.map(|m| m.series_number).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    Lexicographic,
    Scored(ScoreWeights),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPolicy {
    pub ranking: Ranking,
    pub thickness_filter: Option<ThicknessRange>,
}

impl SelectionPolicy {
    pub fn lexicographic() -> Self {
        Self {
            ranking: Ranking::Lexicographic,
            thickness_filter: None,
        }
    }

    pub fn scored(weights: ScoreWeights) -> Self {
        Self {
            ranking: Ranking::Scored(weights),
            thickness_filter: None,
        }
    }

    pub fn hard_filtered_scored(range: ThicknessRange, weights: ScoreWeights) -> Self {
        Self {
            ranking: Ranking::Scored(weights),
            thickness_filter: Some(range),
        }
    }

    pub fn from_config(config: &SelectionConfig) -> Self {
        let ranking = match config.policy {
            PolicyKind::Lexicographic => Ranking::Lexicographic,
            PolicyKind::Scored => Ranking::Scored(config.weights.clone()),
        };
        Self {
            ranking,
            thickness_filter: config.thickness_range,
        }
    }
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::lexicographic()
    }
}

/// A group removed by the thickness filter, with the reason as reported.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Exclusion {
    pub series_uid: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoEligibleSeries {
    /// Nothing parsed in the first place.
    EmptyCatalog,
    /// Groups existed but none survived the hard filter.
    AllFiltered {
        range: ThicknessRange,
        exclusions: Vec<Exclusion>,
    },
}

impl fmt::Display for NoEligibleSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoEligibleSeries::EmptyCatalog => write!(f, "No valid DICOM files found"),
            NoEligibleSeries::AllFiltered { range, exclusions } => {
                write!(
                    f,
                    "No series found with slice thickness in {}-{}mm range",
                    range.min_mm, range.max_mm
                )?;
                for exclusion in exclusions {
                    write!(f, "; {}: {}", exclusion.series_uid, exclusion.reason)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SelectedSeries {
    pub series_uid: String,
    pub series_number: i32,
    pub description: String,
    pub modality: String,
    pub key: SelectionKey,
    pub score: Option<f64>,
    pub slice_thickness: Option<String>,
    pub objects: Vec<ImagingObject>,
    pub exclusions: Vec<Exclusion>,
}

impl SelectedSeries {
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.byte_size).sum()
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "Series {} - {} ({} files, {}px area)",
            self.series_number, self.description, self.key.object_count, self.key.pixel_area
        );
        if let Some(score) = self.score {
            text.push_str(&format!(", score {score}"));
        }
        if let Some(thickness) = &self.slice_thickness {
            text.push_str(&format!(", slice thickness {thickness}mm"));
        }
        text
    }
}

/// First value of a possibly multi-valued DS, parsed.
fn parse_thickness(raw: &str) -> Option<f64> {
    raw.split('\\')
        .next()
        .map(str::trim)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// `Ok` when the representative member's thickness lies in `range`.
pub fn check_thickness(members: &[ImagingObject], range: &ThicknessRange) -> Result<(), String> {
    let raw = match members.first().and_then(|m| m.slice_thickness.as_deref()) {
        Some(raw) => raw,
        None => return Err("no slice thickness value".to_string()),
    };
    match parse_thickness(raw) {
        None => Err(format!("unparseable slice thickness '{raw}'")),
        Some(value) if range.contains(value) => Ok(()),
        Some(value) => Err(format!(
            "slice thickness {value}mm outside {}-{}mm",
            range.min_mm, range.max_mm
        )),
    }
}

/// Weighted score of a group, judged on its first member.
pub fn score_group(members: &[ImagingObject], weights: &ScoreWeights) -> f64 {
    let Some(first) = members.first() else {
        return 0.0;
    };
    let mut score = (members.len() as f64 * weights.per_object).min(weights.count_cap);

    if first.rows > 0 && first.columns > 0 && weights.area_divisor > 0.0 {
        score += (first.pixel_area() as f64 / weights.area_divisor).min(weights.area_cap);
    }

    let description = first.series_description.to_lowercase();
    let mentions = |keywords: &[String]| {
        keywords
            .iter()
            .any(|k| description.contains(&k.to_lowercase()))
    };
    if mentions(&weights.penalty_keywords) {
        score -= weights.keyword_penalty;
    } else if mentions(&weights.bonus_keywords) {
        score += weights.keyword_bonus;
    }

    if first.series_number > weights.series_number_threshold {
        score += weights.series_number_bonus;
    }
    if first
        .modality
        .eq_ignore_ascii_case(&weights.preferred_modality)
    {
        score += weights.modality_bonus;
    }
    score
}

struct Candidate {
    uid: String,
    key: SelectionKey,
    score: Option<f64>,
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    let by_score = match (a.score, b.score) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => Ordering::Equal,
    };
    by_score
        .then_with(|| a.key.cmp(&b.key))
        // smaller UID ranks higher on a full tie
        .then_with(|| b.uid.cmp(&a.uid))
}

/// Choose the winning group. The catalog is consumed; the winner's members
/// move into the result.
pub fn select_series(
    catalog: SeriesCatalog,
    policy: &SelectionPolicy,
) -> Result<SelectedSeries, NoEligibleSeries> {
    if catalog.is_empty() {
        return Err(NoEligibleSeries::EmptyCatalog);
    }

    let mut exclusions = Vec::new();
    let mut candidates = Vec::new();
    for (uid, members) in catalog.iter() {
        if let Some(range) = &policy.thickness_filter {
            if let Err(reason) = check_thickness(members, range) {
                debug!("excluding series {}: {}", uid, reason);
                exclusions.push(Exclusion {
                    series_uid: uid.to_string(),
                    reason,
                });
                continue;
            }
        }
        let score = match &policy.ranking {
            Ranking::Lexicographic => None,
            Ranking::Scored(weights) => Some(score_group(members, weights)),
        };
        candidates.push(Candidate {
            uid: uid.to_string(),
            key: SelectionKey::for_group(members),
            score,
        });
    }

    let Some(winner) = candidates.into_iter().max_by(compare) else {
        return Err(NoEligibleSeries::AllFiltered {
            // a filter must have been set for every group to be excluded
            range: policy.thickness_filter.unwrap_or_default(),
            exclusions,
        });
    };

    let mut groups = catalog.into_groups();
    let objects = groups.remove(&winner.uid).unwrap_or_default();
    let first = objects.first();
    Ok(SelectedSeries {
        series_number: first.map(|o| o.series_number).unwrap_or(0),
        description: first.map(|o| o.series_description.clone()).unwrap_or_default(),
        modality: first.map(|o| o.modality.clone()).unwrap_or_default(),
        slice_thickness: first.and_then(|o| o.slice_thickness.clone()),
        series_uid: winner.uid,
        key: winner.key,
        score: winner.score,
        objects,
        exclusions,
    })
}
