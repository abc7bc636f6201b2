//! Case identity: input discovery, case labels and surrogate identifiers.

use crate::catalog::{has_imaging_files, parse_imaging_object, scan_directory_excluding, ImagingObject};
use crate::config::{LabelStrategy, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Directory names the tool itself creates under an input tree.
pub const STAGING_DIR_NAME: &str = "temp_dcm2niix_processing";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct CaseLabel(String);

impl CaseLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendition of the label.
    pub fn sanitized(&self) -> String {
        sanitize_case_label(&self.0)
    }
}

impl fmt::Display for CaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sanitize_case_label(label: &str) -> String {
    let replaced: String = label
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        "unknown_case".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Archive,
    Folder,
}

/// One input item: a ZIP archive or a directory of imaging files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    /// Unique among the sources of one run.
    pub name: String,
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl InputSource {
    pub fn new(path: &Path, kind: SourceKind) -> Self {
        let name = match kind {
            SourceKind::Archive => path.file_stem(),
            SourceKind::Folder => path.file_name(),
        }
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "input".to_string());
        Self {
            name,
            path: path.to_path_buf(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    SingleArchive(InputSource),
    SingleFolder(InputSource),
    Batch(Vec<InputSource>),
    Unknown,
}

impl InputMode {
    pub fn sources(&self) -> Vec<InputSource> {
        match self {
            InputMode::SingleArchive(s) | InputMode::SingleFolder(s) => vec![s.clone()],
            InputMode::Batch(sources) => sources.clone(),
            InputMode::Unknown => Vec::new(),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, InputMode::Batch(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InputMode::SingleArchive(_) => "single_archive",
            InputMode::SingleFolder(_) => "single_folder",
            InputMode::Batch(_) => "batch",
            InputMode::Unknown => "unknown",
        }
    }
}

/// Names the discovery step must never mistake for new input: our own
/// output, staging and extraction directories. Output roots outside the
/// configured names are matched by canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRules {
    pub excluded_names: BTreeSet<String>,
    pub excluded_prefixes: Vec<String>,
    pub excluded_paths: Vec<PathBuf>,
}

impl DiscoveryRules {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut excluded_names: BTreeSet<String> =
            config.identity.excluded_dirs.iter().cloned().collect();
        excluded_names.insert(config.identity.output_dir_name.clone());
        excluded_names.insert(config.identity.deid_dir_name.clone());
        excluded_names.insert(STAGING_DIR_NAME.to_string());
        Self {
            excluded_names,
            excluded_prefixes: vec![config.extraction.work_prefix.clone()],
            excluded_paths: Vec::new(),
        }
    }

    /// Also exclude `dir` wherever it turns up. A directory that does not
    /// exist yet cannot be walked and is ignored.
    pub fn excluding_path(mut self, dir: &Path) -> Self {
        if let Ok(canonical) = dir.canonicalize() {
            if !self.excluded_paths.contains(&canonical) {
                self.excluded_paths.push(canonical);
            }
        }
        self
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded_names.contains(name)
            || self
                .excluded_prefixes
                .iter()
                .any(|p| !p.is_empty() && name.starts_with(p.as_str()))
    }

    /// Name rules first, then the canonical path of `dir`.
    pub fn is_excluded_dir(&self, dir: &Path) -> bool {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        if self.is_excluded(&name) {
            return true;
        }
        !self.excluded_paths.is_empty()
            && dir
                .canonicalize()
                .map(|c| self.excluded_paths.contains(&c))
                .unwrap_or(false)
    }
}

impl Default for DiscoveryRules {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

pub fn is_zip_archive(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    File::open(path)
        .map(|f| ZipArchive::new(BufReader::new(f)).is_ok())
        .unwrap_or(false)
}

fn folder_has_imaging(path: &Path) -> bool {
    has_imaging_files(path, 3, 5)
}

/// Direct children of `parent` that are archives or imaging folders, sorted
/// by name. Excluded names are skipped before anything is opened.
pub fn collect_batch_inputs(parent: &Path, rules: &DiscoveryRules) -> Vec<InputSource> {
    let mut entries: Vec<PathBuf> = match fs::read_dir(parent) {
        Ok(read) => read.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(e) => {
            warn!("cannot list {:?}: {}", parent, e);
            return Vec::new();
        }
    };
    entries.sort();

    let mut sources = Vec::new();
    for path in entries {
        if rules.is_excluded_dir(&path) {
            debug!("skipping own working directory {:?}", path);
            continue;
        }
        if is_zip_archive(&path) {
            sources.push(InputSource::new(&path, SourceKind::Archive));
        } else if path.is_dir() && folder_has_imaging(&path) {
            sources.push(InputSource::new(&path, SourceKind::Folder));
        }
    }
    disambiguate_names(&mut sources);
    sources
}

/// An archive `x.zip` next to a folder `x` would share the name `x`; such
/// sources fall back to their full file name.
fn disambiguate_names(sources: &mut [InputSource]) {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for source in sources.iter() {
        *counts.entry(source.name.clone()).or_default() += 1;
    }
    for source in sources.iter_mut() {
        if counts.get(&source.name).copied().unwrap_or(0) > 1 {
            if let Some(full) = source.path.file_name() {
                source.name = full.to_string_lossy().to_string();
            }
        }
    }
}

/// Classify the user-supplied input path.
pub fn detect_input_mode(input: &Path, rules: &DiscoveryRules) -> InputMode {
    if is_zip_archive(input) {
        return InputMode::SingleArchive(InputSource::new(input, SourceKind::Archive));
    }
    if input.is_dir() {
        let children = collect_batch_inputs(input, rules);
        let has_direct_files = fs::read_dir(input)
            .map(|read| {
                read.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .any(|p| p.is_file() && parse_imaging_object(&p).is_some())
            })
            .unwrap_or(false);

        if !children.is_empty() && !has_direct_files {
            return InputMode::Batch(children);
        }
        if has_direct_files || folder_has_imaging(input) {
            return InputMode::SingleFolder(InputSource::new(input, SourceKind::Folder));
        }
    }
    InputMode::Unknown
}

/// Effective strategy: combining several sources always qualifies by source.
pub fn effective_strategy(requested: Option<LabelStrategy>, source_count: usize) -> LabelStrategy {
    match (requested, source_count > 1) {
        (Some(LabelStrategy::Subject), true) | (None, true) => LabelStrategy::SourceSubject,
        (Some(strategy), _) => strategy,
        (None, false) => LabelStrategy::Subject,
    }
}

pub fn derive_label(source_name: &str, subject_id: &str, strategy: LabelStrategy) -> CaseLabel {
    match strategy {
        LabelStrategy::Subject => CaseLabel::new(subject_id),
        LabelStrategy::Source => CaseLabel::new(source_name),
        LabelStrategy::SourceSubject => CaseLabel::new(format!("{source_name}_{subject_id}")),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    pub label: CaseLabel,
    /// Names of the sources that contributed files.
    pub sources: Vec<String>,
    pub objects: Vec<ImagingObject>,
}

impl Case {
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.objects.iter().map(|o| o.path.as_path())
    }
}

/// CaseLabel → case, merged over every source of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseSet {
    cases: BTreeMap<CaseLabel, Case>,
}

impl CaseSet {
    /// Add one source's objects. A label that already exists gets the new
    /// files appended, never replaced.
    pub fn add_source(
        &mut self,
        source_name: &str,
        objects: Vec<ImagingObject>,
        strategy: LabelStrategy,
    ) {
        for object in objects {
            let label = derive_label(source_name, &object.subject_id, strategy);
            let case = self.cases.entry(label.clone()).or_insert_with(|| Case {
                label,
                sources: Vec::new(),
                objects: Vec::new(),
            });
            if !case.sources.iter().any(|s| s == source_name) {
                case.sources.push(source_name.to_string());
            }
            case.objects.push(object);
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &CaseLabel> {
        self.cases.keys()
    }

    pub fn get(&self, label: &CaseLabel) -> Option<&Case> {
        self.cases.get(label)
    }

    pub fn cases(&self) -> impl Iterator<Item = &Case> {
        self.cases.values()
    }

    pub fn into_cases(self) -> Vec<Case> {
        self.cases.into_values().collect()
    }
}

/// Result of scanning and merging every source of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub cases: CaseSet,
    pub strategy: Option<LabelStrategy>,
    /// Sources in which nothing parsed.
    pub empty_sources: Vec<String>,
}

/// Scan each `(source name, root directory)` pair and merge the results.
/// Directories matched by `rules` are not scanned.
pub fn resolve_cases(
    roots: &[(String, PathBuf)],
    requested: Option<LabelStrategy>,
    rules: &DiscoveryRules,
) -> Resolution {
    let strategy = effective_strategy(requested, roots.len());
    let mut resolution = Resolution {
        strategy: Some(strategy),
        ..Resolution::default()
    };
    for (name, root) in roots {
        let objects = scan_directory_excluding(root, |dir| rules.is_excluded_dir(dir));
        if objects.is_empty() {
            warn!("no imaging objects found in source {}", name);
            resolution.empty_sources.push(name.clone());
            continue;
        }
        info!("source {}: {} imaging objects", name, objects.len());
        resolution.cases.add_source(name, objects, strategy);
    }
    resolution
}

/// CaseLabel → surrogate identifier for one run. Immutable once built.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SurrogateMap {
    map: BTreeMap<CaseLabel, String>,
}

impl SurrogateMap {
    pub fn get(&self, label: &CaseLabel) -> Option<&str> {
        self.map.get(label).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CaseLabel, &str)> {
        self.map.iter().map(|(l, s)| (l, s.as_str()))
    }
}

/// Number the distinct labels in lexicographic order starting at `base`.
pub fn allocate_surrogates<'a, I>(labels: I, prefix: &str, base: u32, width: usize) -> SurrogateMap
where
    I: IntoIterator<Item = &'a CaseLabel>,
{
    let sorted: BTreeSet<&CaseLabel> = labels.into_iter().collect();
    let map = sorted
        .into_iter()
        .zip(u64::from(base)..)
        .map(|(label, n)| (label.clone(), format!("{prefix}_{n:0width$}")))
        .collect();
    SurrogateMap { map }
}

/// Output directory name per case: the sanitized label, with the surrogate
/// appended when two labels sanitize to the same name.
pub fn case_directory_names(surrogates: &SurrogateMap) -> BTreeMap<CaseLabel, String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for (label, _) in surrogates.iter() {
        *counts.entry(label.sanitized()).or_default() += 1;
    }
    surrogates
        .iter()
        .map(|(label, surrogate)| {
            let name = label.sanitized();
            let name = if counts[&name] > 1 {
                format!("{name}_{surrogate}")
            } else {
                name
            };
            (label.clone(), name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn object(path: &str, subject: &str) -> ImagingObject {
        let mut o = ImagingObject::new(path, "1.2.3");
        o.subject_id = subject.to_string();
        o
    }

    fn labels(set: &CaseSet) -> Vec<String> {
        set.labels().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_colliding_subjects_stay_distinct_across_sources() {
        let strategy = effective_strategy(Some(LabelStrategy::Subject), 2);
        let mut set = CaseSet::default();
        set.add_source("a", vec![object("/a/1", "P1"), object("/a/2", "P1")], strategy);
        set.add_source("b", vec![object("/b/1", "P1")], strategy);

        assert_eq!(labels(&set), vec!["a_P1", "b_P1"]);
        assert_eq!(set.get(&CaseLabel::new("a_P1")).unwrap().objects.len(), 2);
        assert_eq!(set.get(&CaseLabel::new("b_P1")).unwrap().objects.len(), 1);
    }

    #[test]
    fn test_same_label_merges_as_union() {
        let mut set = CaseSet::default();
        set.add_source("a", vec![object("/a/1", "P1")], LabelStrategy::Subject);
        set.add_source("b", vec![object("/b/1", "P1")], LabelStrategy::Subject);

        let case = set.get(&CaseLabel::new("P1")).unwrap();
        let files: Vec<&Path> = case.files().collect();
        assert_eq!(files, vec![Path::new("/a/1"), Path::new("/b/1")]);
        assert_eq!(case.sources, vec!["a", "b"]);
    }

    #[test]
    fn test_source_strategy_groups_whole_source() {
        let mut set = CaseSet::default();
        set.add_source(
            "dicom_123",
            vec![object("/x/1", "P1"), object("/x/2", "P2")],
            LabelStrategy::Source,
        );
        assert_eq!(labels(&set), vec!["dicom_123"]);
    }

    #[test]
    fn test_effective_strategy() {
        assert_eq!(effective_strategy(None, 1), LabelStrategy::Subject);
        assert_eq!(effective_strategy(None, 3), LabelStrategy::SourceSubject);
        assert_eq!(effective_strategy(Some(LabelStrategy::Source), 3), LabelStrategy::Source);
        assert_eq!(effective_strategy(Some(LabelStrategy::Subject), 1), LabelStrategy::Subject);
    }

    #[test]
    fn test_surrogates_are_sorted_and_stable() {
        let input = vec![CaseLabel::new("b"), CaseLabel::new("a"), CaseLabel::new("c"), CaseLabel::new("a")];
        let first = allocate_surrogates(&input, "ANON", 1, 5);
        let mut reversed = input.clone();
        reversed.reverse();
        let second = allocate_surrogates(&reversed, "ANON", 1, 5);

        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(first.get(&CaseLabel::new("a")), Some("ANON_00001"));
        assert_eq!(first.get(&CaseLabel::new("b")), Some("ANON_00002"));
        assert_eq!(first.get(&CaseLabel::new("c")), Some("ANON_00003"));

        let values: BTreeSet<&str> = first.iter().map(|(_, s)| s).collect();
        assert_eq!(values.len(), first.len());
    }

    #[test]
    fn test_surrogate_base_and_width() {
        let input = [CaseLabel::new("x"), CaseLabel::new("y")];
        let map = allocate_surrogates(&input, "CHD", 41, 3);
        assert_eq!(map.get(&CaseLabel::new("x")), Some("CHD_041"));
        assert_eq!(map.get(&CaseLabel::new("y")), Some("CHD_042"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_case_label("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_case_label("   "), "unknown_case");
        assert_eq!(sanitize_case_label(" 张三 "), "张三");
    }

    #[test]
    fn test_directory_names_disambiguate() {
        let input = [CaseLabel::new("a/b"), CaseLabel::new("a_b"), CaseLabel::new("c")];
        let surrogates = allocate_surrogates(&input, "ANON", 1, 5);
        let names = case_directory_names(&surrogates);
        assert_eq!(names[&CaseLabel::new("c")], "c");
        assert_eq!(names[&CaseLabel::new("a/b")], "a_b_ANON_00001");
        assert_eq!(names[&CaseLabel::new("a_b")], "a_b_ANON_00002");
    }

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in members {
            zip.start_file(*name, zip::write::FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_batch_discovery_skips_own_directories() {
        let dir = TempDir::new().unwrap();
        write_zip(&dir.path().join("case1.zip"), &[("a.txt", b"x")]);
        write_zip(&dir.path().join("case2.zip"), &[("b.txt", b"y")]);
        fs::create_dir_all(dir.path().join("output")).unwrap();
        fs::create_dir_all(dir.path().join("temp_extract_case1")).unwrap();
        // an archive inside an excluded directory must not surface either
        write_zip(&dir.path().join("output").join("old.zip"), &[("c.txt", b"z")]);
        fs::write(dir.path().join("readme.txt"), "hello").unwrap();

        let sources = collect_batch_inputs(dir.path(), &DiscoveryRules::default());
        let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["case1", "case2"]);
        assert!(sources.iter().all(|s| s.kind == SourceKind::Archive));

        match detect_input_mode(dir.path(), &DiscoveryRules::default()) {
            InputMode::Batch(found) => assert_eq!(found, sources),
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_detect_single_archive_and_unknown() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("study.zip");
        write_zip(&archive, &[("x.dcm", b"not really")]);
        assert!(matches!(
            detect_input_mode(&archive, &DiscoveryRules::default()),
            InputMode::SingleArchive(ref s) if s.name == "study"
        ));

        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        assert_eq!(detect_input_mode(&empty, &DiscoveryRules::default()), InputMode::Unknown);
    }

    #[test]
    fn test_disambiguate_archive_and_folder_names() {
        let mut sources = vec![
            InputSource::new(Path::new("/in/x"), SourceKind::Folder),
            InputSource::new(Path::new("/in/x.zip"), SourceKind::Archive),
            InputSource::new(Path::new("/in/y.zip"), SourceKind::Archive),
        ];
        disambiguate_names(&mut sources);
        let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["x", "x.zip", "y"]);
    }
}
