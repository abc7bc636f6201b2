//! Resumable archive extraction.
//!
//! The archive's own table of contents is compared against what already sits
//! in the working directory. A member counts as present when a regular file
//! of the declared uncompressed size exists at its path. Only missing members
//! are written, each through a `.part` file that is renamed into place, so an
//! interrupted run never leaves a truncated file looking complete.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub index: usize,
    pub relative_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionState {
    Complete,
    Partial { missing: Vec<ArchiveMember> },
    Absent,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionOutcome {
    /// Target already complete; nothing written.
    Reused,
    /// Target existed; only the missing members were written.
    Completed,
    /// Fresh extraction.
    Extracted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExtractionReport {
    pub archive: PathBuf,
    pub target: PathBuf,
    pub outcome: ExtractionOutcome,
    pub member_count: usize,
    pub files_written: usize,
    /// `(member, error)` for members that could not be materialized.
    pub failed_members: Vec<(String, String)>,
}

/// `<archive dir>/<prefix><archive stem>`.
pub fn working_dir_for(archive: &Path, prefix: &str) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    archive
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{prefix}{stem}"))
}

fn open_archive(archive: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(archive)?;
    Ok(ZipArchive::new(BufReader::new(file))?)
}

/// Regular-file members with a safe relative path. Entries escaping the
/// target (absolute paths, `..`) are skipped.
pub fn read_members(archive: &Path) -> Result<Vec<ArchiveMember>> {
    let mut zip = open_archive(archive)?;
    let mut members = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index)?;
        if entry.is_dir() {
            continue;
        }
        match entry.enclosed_name() {
            Some(relative) => members.push(ArchiveMember {
                index,
                relative_path: relative.to_path_buf(),
                size: entry.size(),
            }),
            None => warn!("skipping unsafe member name {:?} in {:?}", entry.name(), archive),
        }
    }
    Ok(members)
}

fn is_present(target: &Path, member: &ArchiveMember) -> bool {
    fs::metadata(target.join(&member.relative_path))
        .map(|m| m.is_file() && m.len() == member.size)
        .unwrap_or(false)
}

fn classify(target: &Path, members: &[ArchiveMember]) -> ExtractionState {
    if !target.is_dir() {
        return ExtractionState::Absent;
    }
    let missing: Vec<ArchiveMember> = members
        .iter()
        .filter(|m| !is_present(target, m))
        .cloned()
        .collect();
    if missing.is_empty() {
        ExtractionState::Complete
    } else if missing.len() == members.len() {
        ExtractionState::Absent
    } else {
        ExtractionState::Partial { missing }
    }
}

/// Compare the archive's table of contents with `target`. Read-only.
pub fn inspect(archive: &Path, target: &Path) -> Result<ExtractionState> {
    let members = read_members(archive)?;
    Ok(classify(target, &members))
}

fn write_member(
    zip: &mut ZipArchive<BufReader<File>>,
    target: &Path,
    member: &ArchiveMember,
) -> Result<()> {
    let destination = target.join(&member.relative_path);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut partial_name = destination.clone().into_os_string();
    partial_name.push(".part");
    let partial = PathBuf::from(partial_name);

    let mut entry = zip.by_index(member.index)?;
    let mut output = File::create(&partial)?;
    let copied = io::copy(&mut entry, &mut output);
    drop(output);
    match copied {
        Ok(_) => {
            fs::rename(&partial, &destination)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e.into())
        }
    }
}

/// Bring `target` up to date with `archive`, writing only what is missing.
///
/// Running this twice in a row writes nothing the second time. Fails only
/// when no member at all is on disk afterwards; members that cannot be read
/// are reported and retried on every run.
pub fn ensure_extracted(archive: &Path, target: &Path) -> Result<ExtractionReport> {
    let members = read_members(archive)?;
    let state = classify(target, &members);

    let (outcome, to_write) = match state {
        ExtractionState::Complete => {
            info!("reusing complete working copy {:?}", target);
            return Ok(ExtractionReport {
                archive: archive.to_path_buf(),
                target: target.to_path_buf(),
                outcome: ExtractionOutcome::Reused,
                member_count: members.len(),
                files_written: 0,
                failed_members: Vec::new(),
            });
        }
        ExtractionState::Partial { missing } => {
            info!(
                "completing working copy {:?}: {} of {} members missing",
                target,
                missing.len(),
                members.len()
            );
            (ExtractionOutcome::Completed, missing)
        }
        ExtractionState::Absent => {
            info!("extracting {:?} to {:?}", archive, target);
            (ExtractionOutcome::Extracted, members.clone())
        }
    };

    fs::create_dir_all(target)?;
    let mut zip = open_archive(archive)?;
    let mut files_written = 0;
    let mut failed_members = Vec::new();
    for member in &to_write {
        match write_member(&mut zip, target, member) {
            Ok(()) => files_written += 1,
            Err(e) => {
                warn!("failed to extract {:?}: {}", member.relative_path, e);
                failed_members.push((member.relative_path.to_string_lossy().to_string(), e.to_string()));
            }
        }
    }
    debug!("wrote {} members into {:?}", files_written, target);

    let present = members.len() - failed_members.len();
    if present == 0 && !members.is_empty() {
        let first = failed_members
            .first()
            .map(|(name, err)| format!("{name}: {err}"))
            .unwrap_or_default();
        return Err(PipelineError::Extraction {
            archive: archive.to_path_buf(),
            message: format!("no member could be extracted ({first})"),
        });
    }

    Ok(ExtractionReport {
        archive: archive.to_path_buf(),
        target: target.to_path_buf(),
        outcome,
        member_count: members.len(),
        files_written,
        failed_members,
    })
}

/// Delete a working copy after its case finished successfully.
pub fn remove_working_copy(target: &Path) -> io::Result<()> {
    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    Ok(())
}
