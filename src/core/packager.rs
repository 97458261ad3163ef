//! Artifact packaging.
//!
//! Flattens every regular file under a job's artifact directory into a single
//! zip archive, keyed by path relative to the artifact directory. The archive
//! is written to a temporary sibling path and renamed into place only once it
//! is complete, so an aborted packaging never leaves a file for transfer.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::error::PackagingError;

const BUFFER_SIZE: usize = 128 * 1024;
const PARTIAL_SUFFIX: &str = "partial";

/// Result of a packaging attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    /// Archive written at the target path.
    Created { files: usize, bytes: u64 },
    /// Nothing to archive; no file was written.
    Empty,
}

impl PackageOutcome {
    pub fn created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

/// A file selected for the archive.
#[derive(Debug, Clone)]
struct ArtifactFile {
    path: PathBuf,
    entry_name: String,
    size: u64,
}

/// Package `artifact_dir` into `target` on the blocking thread pool.
pub async fn package(artifact_dir: &Path, target: &Path) -> Result<PackageOutcome, PackagingError> {
    let artifact_dir = artifact_dir.to_path_buf();
    let target = target.to_path_buf();

    tokio::task::spawn_blocking(move || package_blocking(&artifact_dir, &target))
        .await
        .map_err(|e| PackagingError::Aborted(e.to_string()))?
}

/// Synchronous packaging. Must only be called after the job's command has
/// terminated.
pub fn package_blocking(artifact_dir: &Path, target: &Path) -> Result<PackageOutcome, PackagingError> {
    let files = list_artifact_files(artifact_dir, target)?;

    if files.is_empty() {
        debug!(dir = %artifact_dir.display(), "No artifacts to package");
        return Ok(PackageOutcome::Empty);
    }

    let partial = partial_path(target);
    match write_archive(&partial, &files) {
        Ok(bytes) => {
            fs::rename(&partial, target).map_err(|e| PackagingError::Write {
                path: target.to_path_buf(),
                source: e,
            })?;

            info!(
                archive = %target.display(),
                files = files.len(),
                bytes = bytes,
                "Packaged artifacts"
            );

            Ok(PackageOutcome::Created {
                files: files.len(),
                bytes,
            })
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&partial) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial archive");
                }
            }
            Err(e)
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Every regular file under `artifact_dir`, excluding `target` and its
/// partial sibling. Sorted by entry name.
fn list_artifact_files(artifact_dir: &Path, target: &Path) -> Result<Vec<ArtifactFile>, PackagingError> {
    let excluded = [target.to_path_buf(), partial_path(target)];
    let mut files = Vec::new();

    scan_recursive(artifact_dir, artifact_dir, &excluded, &mut files)?;
    files.sort_by(|a, b| a.entry_name.cmp(&b.entry_name));

    Ok(files)
}

fn scan_recursive(
    base: &Path,
    current: &Path,
    excluded: &[PathBuf],
    files: &mut Vec<ArtifactFile>,
) -> Result<(), PackagingError> {
    let scan_err = |source: io::Error| PackagingError::Scan {
        path: current.to_path_buf(),
        source,
    };

    let entries = match fs::read_dir(current) {
        Ok(entries) => entries,
        // The command may have removed its own artifact directory.
        Err(e) if e.kind() == io::ErrorKind::NotFound && current == base => return Ok(()),
        Err(e) => return Err(scan_err(e)),
    };

    for entry in entries {
        let entry = entry.map_err(scan_err)?;
        let path = entry.path();

        let mut metadata = path.symlink_metadata().map_err(|e| PackagingError::Scan {
            path: path.clone(),
            source: e,
        })?;

        // Linked files are archived under the link's name. Linked directories
        // are not descended into.
        if metadata.file_type().is_symlink() {
            match fs::metadata(&path) {
                Ok(target) if target.is_file() => metadata = target,
                Ok(_) => {
                    debug!(path = %path.display(), "Skipping symlink to a non-regular file");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping dangling symlink");
                    continue;
                }
            }
        }

        if metadata.is_dir() {
            scan_recursive(base, &path, excluded, files)?;
        } else if metadata.is_file() {
            if excluded.iter().any(|ex| ex == &path) {
                continue;
            }
            let entry_name = entry_name(base, &path).ok_or_else(|| PackagingError::Scan {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, "artifact path is not valid UTF-8"),
            })?;
            files.push(ArtifactFile {
                path,
                entry_name,
                size: metadata.len(),
            });
        }
    }

    Ok(())
}

/// Relative path with `/` separators, as stored in the archive.
fn entry_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn write_archive(archive_path: &Path, files: &[ArtifactFile]) -> Result<u64, PackagingError> {
    let write_err = |source: io::Error| PackagingError::Write {
        path: archive_path.to_path_buf(),
        source,
    };

    let file = File::create(archive_path).map_err(write_err)?;
    let mut zip = ZipWriter::new(BufWriter::with_capacity(BUFFER_SIZE, file));
    let mut bytes: u64 = 0;

    for artifact in files {
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(artifact.size >= u64::from(u32::MAX));

        zip.start_file(artifact.entry_name.as_str(), options)
            .map_err(|e| PackagingError::Encode {
                entry: artifact.entry_name.clone(),
                source: e,
            })?;

        let mut source = File::open(&artifact.path).map_err(|e| PackagingError::Read {
            path: artifact.path.clone(),
            source: e,
        })?;

        bytes += io::copy(&mut source, &mut zip).map_err(|e| PackagingError::Read {
            path: artifact.path.clone(),
            source: e,
        })?;
    }

    let mut writer = zip.finish().map_err(|e| PackagingError::Encode {
        entry: "central directory".to_string(),
        source: e,
    })?;
    writer.flush().map_err(write_err)?;
    writer
        .into_inner()
        .map_err(|e| write_err(e.into_error()))?
        .sync_all()
        .map_err(write_err)?;

    Ok(bytes)
}
