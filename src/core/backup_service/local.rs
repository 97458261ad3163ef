use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{BackupService, object_dir, object_name};

/// Buffer size for file I/O operations (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

const PROBE_FILE_NAME: &str = ".frosty-probe";

/// Same-second stores of one file name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Stores archives in a directory on a locally mounted filesystem.
///
/// Each archive is copied through a temporary file, synced, moved into place
/// without replacing anything, then re-read and compared against the BLAKE3
/// hash taken while copying.
pub struct LocalBackupService {
    destination: PathBuf,
    hostname: String,
}

impl LocalBackupService {
    pub fn new(destination: PathBuf, hostname: String) -> Self {
        Self {
            destination,
            hostname,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

#[async_trait]
impl BackupService for LocalBackupService {
    fn name(&self) -> &'static str {
        "local"
    }

    fn display_location(&self) -> String {
        format!("Local directory: {}", self.destination.display())
    }

    fn artifact_file_base_name(&self, job_name: &str) -> String {
        job_name.to_string()
    }

    async fn initialize(&self) -> Result<()> {
        let destination = self.destination.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            fs::create_dir_all(&destination).with_context(|| {
                format!("Failed to create destination {}", destination.display())
            })?;

            // Refuse to start a batch against a read-only destination.
            let probe = destination.join(PROBE_FILE_NAME);
            fs::write(&probe, b"")
                .with_context(|| format!("Destination {} is not writable", destination.display()))?;
            fs::remove_file(&probe).ok();

            debug!(destination = %destination.display(), "Local backup service ready");
            Ok(())
        })
        .await?
    }

    async fn store_file(&self, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("Not a file path: {}", path.display()))?
            .to_string_lossy()
            .into_owned();
        let at = Utc::now();
        let dir = self.destination.join(object_dir(&self.hostname, at));
        let source = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let (dest, bytes) =
                copy_verified(&source, &dir, |attempt| object_name(&file_name, at, attempt))?;
            info!(
                source = %source.display(),
                destination = %dest.display(),
                bytes = bytes,
                "Stored archive"
            );
            Ok(())
        })
        .await?
    }
}

/// Copy `source` into `dir` through a uniquely named temporary file, then
/// move it to the first free name produced by `name_for` and verify it.
/// Existing files are never overwritten.
fn copy_verified(
    source: &Path,
    dir: &Path,
    name_for: impl Fn(u32) -> String,
) -> Result<(PathBuf, u64)> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;
    let (bytes, source_hash) = copy_and_hash(source, &mut tmp)?;

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let dest = dir.join(name_for(attempt));
        match tmp.persist_noclobber(&dest) {
            Ok(_) => {
                let dest_hash = hash_file(&dest)?;
                if dest_hash != source_hash {
                    bail!("Verification failed: {} does not match its source", dest.display());
                }
                return Ok((dest, bytes));
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                debug!(dest = %dest.display(), "Destination taken, trying the next name");
                tmp = e.file;
            }
            Err(e) => {
                return Err(e.error)
                    .with_context(|| format!("Failed to move archive into {}", dest.display()));
            }
        }
    }

    bail!(
        "No free destination name for {} after {} attempts",
        dir.join(name_for(0)).display(),
        MAX_NAME_ATTEMPTS
    )
}

fn copy_and_hash(source: &Path, tmp: &mut NamedTempFile) -> Result<(u64, blake3::Hash)> {
    let source_file =
        File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
    let source_metadata = source_file.metadata()?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, tmp.as_file_mut());

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", source.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        writer
            .write_all(&buffer[..bytes_read])
            .context("Failed to write temporary file")?;
        bytes_written += bytes_read as u64;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush temporary file: {}", e.error()))?
        .sync_all()
        .context("Failed to sync temporary file")?;

    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
    if let Err(e) = filetime::set_file_mtime(tmp.path(), mtime) {
        debug!(path = %tmp.path().display(), error = %e, "Failed to preserve modification time");
    }

    Ok((bytes_written, hasher.finalize()))
}

fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}
