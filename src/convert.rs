//! External converter (dcm2niix) invocation.
//!
//! The selected series is copied into a freshly named, ASCII-only staging
//! directory; the converter reads from there and writes into a sibling
//! staging output directory, so neither the original input path nor the
//! final output path is ever handed to the tool. Results are moved into the
//! case output folder afterwards.

use crate::catalog::ImagingObject;
use crate::config::ConverterConfig;
use crate::error::{classify_failure, FailureCategory, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long captured output is awaited once the converter is gone. Pipes
/// inherited by a leftover grandchild stay open past that point.
const READER_GRACE: Duration = Duration::from_secs(2);

/// True when every character is printable ASCII without spaces.
pub fn is_transport_safe(path: &Path) -> bool {
    path.to_str()
        .map(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic()))
        .unwrap_or(false)
}

/// First existing candidate. Bare names are looked up on `PATH`.
pub fn locate_converter(candidates: &[PathBuf]) -> Result<PathBuf> {
    for candidate in candidates {
        let is_bare = candidate.components().count() == 1 && !candidate.is_absolute();
        if is_bare {
            if let Some(found) = search_path(candidate) {
                return Ok(found);
            }
        }
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    Err(PipelineError::ConverterMissing {
        searched: candidates
            .iter()
            .map(|c| c.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn search_path(name: &Path) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let plain = dir.join(name);
        if plain.is_file() {
            return Some(plain);
        }
        let exe = dir.join(name).with_extension("exe");
        exe.is_file().then_some(exe)
    })
}

/// A series copied into its own staging area. Dropping it removes the
/// staging directory, including after a timeout.
#[derive(Debug)]
pub struct StagedSeries {
    root: TempDir,
    input_dir: PathBuf,
    output_dir: PathBuf,
    file_count: usize,
}

impl StagedSeries {
    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }
}

/// Copy `objects` into a new staging directory under the first
/// transport-safe root among `preferred` and the system temp directory.
/// Files are renamed `IM00001.dcm`, `IM00002.dcm`, ... in member order.
pub fn stage_series(objects: &[ImagingObject], preferred: Option<&Path>) -> Result<StagedSeries> {
    let system_temp = std::env::temp_dir();
    let root_dir = preferred
        .into_iter()
        .chain(std::iter::once(system_temp.as_path()))
        .find(|p| is_transport_safe(p))
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "no ASCII-safe staging location (tried {:?} and {:?})",
                preferred, system_temp
            ))
        })?;
    fs::create_dir_all(root_dir)?;

    let root = tempfile::Builder::new()
        .prefix("dcm2niix_")
        .tempdir_in(root_dir)?;
    let input_dir = root.path().join("series");
    let output_dir = root.path().join("out");
    fs::create_dir_all(&input_dir)?;
    fs::create_dir_all(&output_dir)?;

    for (index, object) in objects.iter().enumerate() {
        let destination = input_dir.join(format!("IM{:05}.dcm", index + 1));
        fs::copy(&object.path, &destination)?;
    }
    debug!("staged {} files in {:?}", objects.len(), input_dir);

    Ok(StagedSeries {
        root,
        input_dir,
        output_dir,
        file_count: objects.len(),
    })
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversionStatus {
    Success,
    ToolFailure { exit_code: Option<i32> },
    TimedOut { after_secs: u64 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConversionResult {
    pub status: ConversionStatus,
    /// Primary outputs (`.nii.gz` / `.nii`), after reduction.
    pub outputs: Vec<PathBuf>,
    pub sidecars: Vec<PathBuf>,
    pub stdout: String,
    pub stderr: String,
    pub failure_category: Option<FailureCategory>,
    pub elapsed_ms: u64,
}

impl ConversionResult {
    pub fn success(&self) -> bool {
        self.status == ConversionStatus::Success
    }

    /// stderr when present, stdout otherwise.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    pub fn to_error(&self) -> Option<PipelineError> {
        match &self.status {
            ConversionStatus::Success => None,
            ConversionStatus::ToolFailure { exit_code } => Some(PipelineError::ConversionFailed {
                status: exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                diagnostics: self.diagnostics().to_string(),
            }),
            ConversionStatus::TimedOut { after_secs } => Some(PipelineError::ConversionTimeout {
                seconds: *after_secs,
                diagnostics: self.diagnostics().to_string(),
            }),
        }
    }
}

/// Output of one "largest output wins" pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduction {
    pub kept: Option<PathBuf>,
    pub removed: Vec<PathBuf>,
}

fn is_primary_output(name: &str) -> bool {
    name.ends_with(".nii.gz") || name.ends_with(".nii")
}

/// `x.nii.gz` / `x.nii` → `x.json`.
pub fn sidecar_for(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    output.with_file_name(format!("{stem}.json"))
}

/// Primary outputs in `dir` whose names start with `prefix`, sorted.
pub fn list_outputs(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut outputs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy())
                .map(|n| n.starts_with(prefix) && is_primary_output(&n))
                .unwrap_or(false)
        })
        .collect();
    outputs.sort();
    Ok(outputs)
}

/// Keep only the largest primary output (ties: first by name) and delete
/// the others together with their sidecars.
pub fn keep_largest_output(dir: &Path, prefix: &str) -> io::Result<Reduction> {
    let outputs = list_outputs(dir, prefix)?;
    if outputs.len() <= 1 {
        return Ok(Reduction {
            kept: outputs.into_iter().next(),
            removed: Vec::new(),
        });
    }

    let mut sized = Vec::with_capacity(outputs.len());
    for path in outputs {
        let size = fs::metadata(&path)?.len();
        sized.push((path, size));
    }
    let kept = sized
        .iter()
        .max_by(|(pa, sa), (pb, sb)| sa.cmp(sb).then_with(|| pb.cmp(pa)))
        .map(|(p, _)| p.clone());

    let mut removed = Vec::new();
    for (path, _) in sized {
        if Some(&path) == kept.as_ref() {
            continue;
        }
        let sidecar = sidecar_for(&path);
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
        fs::remove_file(&path)?;
        removed.push(path);
    }
    if let Some(kept) = &kept {
        info!(
            "removed {} smaller output(s), kept largest: {:?}",
            removed.len(),
            kept.file_name().unwrap_or_default()
        );
    }
    Ok(Reduction { kept, removed })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        let _ = tx.send(String::from_utf8_lossy(&buffer).into_owned());
    });
    rx
}

/// Output of one reader, or empty if it is not done by `until`. A reader
/// still blocked then is left behind detached.
fn collect_output(reader: Option<Receiver<String>>, until: Instant) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    reader
        .recv_timeout(until.saturating_duration_since(Instant::now()))
        .unwrap_or_default()
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[derive(Debug, Clone)]
pub struct Converter {
    program: PathBuf,
    config: ConverterConfig,
}

impl Converter {
    pub fn new(program: PathBuf, config: ConverterConfig) -> Self {
        Self { program, config }
    }

    /// Resolve the binary from the configured candidates. A missing binary
    /// is fatal for the whole run.
    pub fn locate(config: ConverterConfig) -> Result<Self> {
        let program = locate_converter(&config.candidates)?;
        info!("using converter {:?}", program);
        Ok(Self::new(program, config))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout_for(&self, object_count: usize) -> Duration {
        let secs = if object_count > self.config.large_series_threshold {
            self.config.extended_timeout_secs
        } else {
            self.config.timeout_secs
        };
        Duration::from_secs(secs)
    }

    pub fn args(&self, input_dir: &Path, output_dir: &Path, case_name: &str) -> Vec<OsString> {
        let yes_no = |flag: bool| if flag { "y" } else { "n" };
        vec![
            "-f".into(),
            self.config.name_template.replace("{case}", case_name).into(),
            "-o".into(),
            output_dir.as_os_str().to_os_string(),
            "-z".into(),
            yes_no(self.config.compress).into(),
            "-b".into(),
            yes_no(self.config.sidecar).into(),
            "-v".into(),
            self.config.verbosity.to_string().into(),
            input_dir.as_os_str().to_os_string(),
        ]
    }

    /// Run the converter on a staged series and move the surviving outputs
    /// into `destination`. Any failure of the tool itself is reported in the
    /// result; only environment problems come back as `Err`.
    pub fn convert(
        &self,
        staged: &StagedSeries,
        destination: &Path,
        case_name: &str,
    ) -> Result<ConversionResult> {
        let timeout = self.timeout_for(staged.file_count());
        let started = Instant::now();
        info!(
            "converting {} ({} files, timeout {}s)",
            case_name,
            staged.file_count(),
            timeout.as_secs()
        );

        let mut child = Command::new(&self.program)
            .args(self.args(staged.input_dir(), staged.output_dir(), case_name))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => PipelineError::ConverterMissing {
                    searched: self.program.display().to_string(),
                },
                _ => PipelineError::Io(e),
            })?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);
        let deadline = started + timeout;
        let exit = wait_with_deadline(&mut child, deadline)?;
        let readers_until = match exit {
            Some(_) => deadline.max(Instant::now()),
            None => Instant::now(),
        } + READER_GRACE;
        let stdout = collect_output(stdout_reader, readers_until);
        let stderr = collect_output(stderr_reader, readers_until);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let status = match exit {
            None => {
                warn!("converter timed out on {} after {}s", case_name, timeout.as_secs());
                ConversionStatus::TimedOut {
                    after_secs: timeout.as_secs(),
                }
            }
            Some(s) if s.success() => ConversionStatus::Success,
            Some(s) => ConversionStatus::ToolFailure { exit_code: s.code() },
        };

        let mut result = ConversionResult {
            status,
            outputs: Vec::new(),
            sidecars: Vec::new(),
            stdout,
            stderr,
            failure_category: None,
            elapsed_ms,
        };

        match &result.status {
            ConversionStatus::Success => {
                keep_largest_output(staged.output_dir(), case_name)?;
                fs::create_dir_all(destination)?;
                for output in list_outputs(staged.output_dir(), case_name)? {
                    let sidecar = sidecar_for(&output);
                    let target = destination.join(output.file_name().unwrap_or_default());
                    move_file(&output, &target)?;
                    result.outputs.push(target);
                    if sidecar.exists() {
                        let target = destination.join(sidecar.file_name().unwrap_or_default());
                        move_file(&sidecar, &target)?;
                        result.sidecars.push(target);
                    }
                }
            }
            ConversionStatus::TimedOut { .. } => {
                result.failure_category = Some(FailureCategory::Tool);
            }
            ConversionStatus::ToolFailure { .. } => {
                result.failure_category = Some(classify_failure(result.diagnostics()));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn converter(program: &Path, timeout_secs: u64) -> Converter {
        let config = ConverterConfig {
            candidates: vec![program.to_path_buf()],
            timeout_secs,
            extended_timeout_secs: timeout_secs * 2,
            large_series_threshold: 3,
            ..ConverterConfig::default()
        };
        Converter::new(program.to_path_buf(), config)
    }

    #[test]
    fn test_transport_safety() {
        assert!(is_transport_safe(Path::new("/tmp/dcm2niix_abc/series")));
        assert!(!is_transport_safe(Path::new("/data/第一次/case")));
        assert!(!is_transport_safe(Path::new("/data/with space")));
        assert!(!is_transport_safe(Path::new("")));
    }

    #[test]
    fn test_largest_output_wins() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        fs::write(d.join("case_1_a.nii.gz"), vec![0u8; 10]).unwrap();
        fs::write(d.join("case_1_a.json"), "{}").unwrap();
        fs::write(d.join("case_2_b.nii.gz"), vec![0u8; 300]).unwrap();
        fs::write(d.join("case_2_b.json"), "{}").unwrap();
        fs::write(d.join("case_3_c.nii.gz"), vec![0u8; 20]).unwrap();
        fs::write(d.join("case_3_c.json"), "{}").unwrap();
        fs::write(d.join("other_1.nii.gz"), vec![0u8; 999]).unwrap();

        let reduction = keep_largest_output(d, "case").unwrap();
        assert_eq!(reduction.kept, Some(d.join("case_2_b.nii.gz")));
        assert_eq!(reduction.removed.len(), 2);

        let remaining = list_outputs(d, "case").unwrap();
        assert_eq!(remaining, vec![d.join("case_2_b.nii.gz")]);
        assert!(d.join("case_2_b.json").exists());
        assert!(!d.join("case_1_a.json").exists());
        assert!(!d.join("case_3_c.json").exists());
        // other prefixes are untouched
        assert!(d.join("other_1.nii.gz").exists());
    }

    #[test]
    fn test_largest_output_tie_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        fs::write(d.join("c_b.nii"), vec![0u8; 5]).unwrap();
        fs::write(d.join("c_a.nii"), vec![0u8; 5]).unwrap();
        let reduction = keep_largest_output(d, "c_").unwrap();
        assert_eq!(reduction.kept, Some(d.join("c_a.nii")));
    }

    #[test]
    fn test_single_output_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x_1.nii.gz"), b"data").unwrap();
        let reduction = keep_largest_output(dir.path(), "x").unwrap();
        assert_eq!(reduction.kept, Some(dir.path().join("x_1.nii.gz")));
        assert!(reduction.removed.is_empty());
    }

    #[test]
    fn test_sidecar_for() {
        assert_eq!(sidecar_for(Path::new("/o/a_1.nii.gz")), PathBuf::from("/o/a_1.json"));
        assert_eq!(sidecar_for(Path::new("/o/a_1.nii")), PathBuf::from("/o/a_1.json"));
    }

    #[test]
    fn test_args_and_timeouts() {
        let conv = converter(Path::new("/usr/bin/dcm2niix"), 300);
        let args: Vec<String> = conv
            .args(Path::new("/s/in"), Path::new("/s/out"), "case7")
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["-f", "case7_%i_%s_%p", "-o", "/s/out", "-z", "y", "-b", "y", "-v", "0", "/s/in"]
        );
        assert_eq!(conv.timeout_for(3), Duration::from_secs(300));
        assert_eq!(conv.timeout_for(4), Duration::from_secs(600));
    }

    #[test]
    fn test_locate_missing_converter() {
        let err = locate_converter(&[PathBuf::from("/nope/dcm2niix"), PathBuf::from("no-such-tool-xyz")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConverterMissing { .. }));
    }

    #[test]
    fn test_staging_copies_and_cleans_up() {
        let src = TempDir::new().unwrap();
        let objects: Vec<ImagingObject> = (0..3)
            .map(|i| {
                let path = src.path().join(format!("图像{i}.dcm"));
                fs::write(&path, format!("slice {i}")).unwrap();
                ImagingObject::new(path, "1.2")
            })
            .collect();

        let staged = stage_series(&objects, None).unwrap();
        let root = staged.root().to_path_buf();
        assert!(is_transport_safe(staged.input_dir()));
        assert_eq!(staged.file_count(), 3);
        assert_eq!(
            fs::read_to_string(staged.input_dir().join("IM00002.dcm")).unwrap(),
            "slice 1"
        );
        drop(staged);
        assert!(!root.exists());
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake_dcm2niix.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn staged_one(src: &Path) -> StagedSeries {
        let file = src.join("a.dcm");
        fs::write(&file, b"x").unwrap();
        stage_series(&[ImagingObject::new(file, "1")], None).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_convert_success_moves_reduced_outputs() {
        let tools = TempDir::new().unwrap();
        // args: -f NAME -o OUT ...
        let program = script(
            tools.path(),
            r#"name=$(echo "$2" | sed 's/_%i_%s_%p//')
out="$4"
head -c 100 /dev/zero > "$out/${name}_1_small.nii.gz"
echo '{}' > "$out/${name}_1_small.json"
head -c 5000 /dev/zero > "$out/${name}_2_big.nii.gz"
echo '{"Modality":"CT"}' > "$out/${name}_2_big.json"
echo converted"#,
        );
        let staged = staged_one(tools.path());
        let dest = tools.path().join("dest");

        let result = converter(&program, 30).convert(&staged, &dest, "caseA").unwrap();
        assert!(result.success(), "{result:?}");
        assert_eq!(result.outputs, vec![dest.join("caseA_2_big.nii.gz")]);
        assert_eq!(result.sidecars, vec![dest.join("caseA_2_big.json")]);
        assert!(result.stdout.contains("converted"));
        assert!(!dest.join("caseA_1_small.nii.gz").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_convert_failure_is_captured() {
        let tools = TempDir::new().unwrap();
        let program = script(tools.path(), "echo 'Error: unable to read archive' >&2\nexit 2");
        let staged = staged_one(tools.path());

        let result = converter(&program, 30)
            .convert(&staged, &tools.path().join("dest"), "c")
            .unwrap();
        assert_eq!(result.status, ConversionStatus::ToolFailure { exit_code: Some(2) });
        assert!(result.diagnostics().contains("unable to read archive"));
        assert_eq!(result.failure_category, Some(FailureCategory::Archive));
        let err = result.to_error().unwrap();
        assert!(matches!(err, PipelineError::ConversionFailed { .. }));
        assert_eq!(Some(err.category()), result.failure_category);
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_is_not_held_up_by_leftover_children() {
        let tools = TempDir::new().unwrap();
        // the shell forks `sleep`, which keeps stdout and stderr open
        let program = script(tools.path(), "echo started\nsleep 30\necho never");
        let staged = staged_one(tools.path());

        let started = Instant::now();
        let result = converter(&program, 1)
            .convert(&staged, &tools.path().join("dest"), "c")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
        assert_eq!(result.status, ConversionStatus::TimedOut { after_secs: 1 });
        assert!(!result.stdout.contains("never"));
    }

    #[cfg(unix)]
    #[test]
    fn test_convert_timeout() {
        let tools = TempDir::new().unwrap();
        let program = script(tools.path(), "exec sleep 30");
        let staged = staged_one(tools.path());
        let root = staged.root().to_path_buf();

        let started = Instant::now();
        let result = converter(&program, 1)
            .convert(&staged, &tools.path().join("dest"), "c")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(result.status, ConversionStatus::TimedOut { after_secs: 1 });
        assert!(result.to_error().unwrap().is_retryable());

        drop(staged);
        assert!(!root.exists());
    }
}
