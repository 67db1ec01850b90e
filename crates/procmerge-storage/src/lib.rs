//! Merged-generation storage for procmerge: atomic batch writes, archive
//! rotation/pruning and the single-writer run lock.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use procmerge_core::{FileOutcome, Record, SkipReason};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "procmerge-storage";

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_ARCHIVE_DIR: &str = "_archive";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const LOCK_FILE_NAME: &str = ".procmerge.lock";

const SECS_PER_DAY: u64 = 24 * 60 * 60;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes through a temp file + rename so a reader never sees a
/// half-written batch.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)?;
    let written = file.write_all(bytes).and_then(|()| file.flush());
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}

/// On-disk envelope of one merged batch.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchEnvelope<'a> {
    crawler_id: &'a str,
    merged_at: DateTime<Utc>,
    batch_number: usize,
    total_batches: usize,
    total_records: usize,
    data: &'a [Record],
}

/// Descriptor of a batch file persisted by [`BatchWriter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenBatch {
    pub path: PathBuf,
    pub batch_number: usize,
    pub total_batches: usize,
    pub records: usize,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum BatchWriteCause {
    #[error("serializing batch: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing batch file: {0}")]
    Io(#[from] io::Error),
}

/// Batch `batch_number` failed. Everything in `written` is already on disk
/// and stays there.
#[derive(Debug, Error)]
#[error("writing batch {batch_number} of {total_batches} to {}", .path.display())]
pub struct BatchWriteError {
    pub batch_number: usize,
    pub total_batches: usize,
    pub path: PathBuf,
    pub written: Vec<WrittenBatch>,
    #[source]
    pub cause: BatchWriteCause,
}

#[derive(Debug, Clone)]
pub struct BatchWriter {
    dir: PathBuf,
    batch_size: usize,
}

impl BatchWriter {
    pub fn new(dir: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            dir: dir.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_file_name(
        output_prefix: &str,
        generated_at: DateTime<Utc>,
        batch_number: usize,
    ) -> String {
        let stamp = generated_at.format("%Y%m%d_%H%M%S");
        format!("{output_prefix}_{stamp}_batch{batch_number:03}.json")
    }

    /// Split `records` into contiguous chunks and persist each as one file.
    /// Writes nothing for an empty slice.
    pub fn write_batches(
        &self,
        records: &[Record],
        crawler_id: &str,
        output_prefix: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<Vec<WrittenBatch>, BatchWriteError> {
        let total_batches = records.len().div_ceil(self.batch_size);
        let mut written = Vec::with_capacity(total_batches);

        for (index, chunk) in records.chunks(self.batch_size).enumerate() {
            let batch_number = index + 1;
            let path = self.dir.join(Self::batch_file_name(
                output_prefix,
                generated_at,
                batch_number,
            ));
            let envelope = BatchEnvelope {
                crawler_id,
                merged_at: generated_at,
                batch_number,
                total_batches,
                total_records: chunk.len(),
                data: chunk,
            };

            let result = serde_json::to_vec_pretty(&envelope)
                .map_err(BatchWriteCause::from)
                .and_then(|bytes| {
                    write_atomically(&path, &bytes)
                        .map(|()| bytes)
                        .map_err(BatchWriteCause::from)
                });
            match result {
                Ok(bytes) => {
                    info!(
                        path = %path.display(),
                        batch_number,
                        total_batches,
                        records = chunk.len(),
                        "wrote merged batch"
                    );
                    written.push(WrittenBatch {
                        path,
                        batch_number,
                        total_batches,
                        records: chunk.len(),
                        bytes: bytes.len() as u64,
                        sha256: sha256_hex(&bytes),
                    });
                }
                Err(cause) => {
                    return Err(BatchWriteError {
                        batch_number,
                        total_batches,
                        path,
                        written,
                        cause,
                    })
                }
            }
        }

        Ok(written)
    }
}

/// Moves superseded merged files into an archive directory and prunes the
/// archive by age. Every per-file failure is reported, never raised.
#[derive(Debug, Clone)]
pub struct ArchiveRotator {
    archive_dir: PathBuf,
}

impl ArchiveRotator {
    pub fn new(primary_dir: impl AsRef<Path>, archive_dir_name: &str) -> Self {
        Self {
            archive_dir: primary_dir.as_ref().join(archive_dir_name),
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Leave the newest of `existing` (by file name, which embeds the
    /// generation stamp) in place and archive the rest.
    pub fn rotate(&self, existing: &[PathBuf]) -> Vec<FileOutcome> {
        let mut ordered = existing.to_vec();
        ordered.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        ordered.dedup();
        let Some(latest) = ordered.pop() else {
            return Vec::new();
        };
        debug!(path = %latest.display(), "retaining latest merged file");
        if ordered.is_empty() {
            return Vec::new();
        }

        if let Err(err) = fs::create_dir_all(&self.archive_dir) {
            warn!(dir = %self.archive_dir.display(), error = %err, "cannot create archive directory");
            return ordered
                .into_iter()
                .map(|path| FileOutcome::Skipped {
                    path,
                    reason: SkipReason::MoveFailed(format!(
                        "creating {}: {err}",
                        self.archive_dir.display()
                    )),
                })
                .collect();
        }

        ordered
            .into_iter()
            .map(|path| {
                let Some(name) = path.file_name() else {
                    return FileOutcome::Skipped {
                        reason: SkipReason::MoveFailed("path has no file name".to_string()),
                        path,
                    };
                };
                let target = self.archive_dir.join(name);
                match move_file(&path, &target) {
                    Ok(()) => {
                        info!(from = %path.display(), to = %target.display(), "archived merged file");
                        FileOutcome::Archived { path, to: target }
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to archive merged file");
                        FileOutcome::Skipped {
                            path,
                            reason: SkipReason::MoveFailed(err.to_string()),
                        }
                    }
                }
            })
            .collect()
    }

    /// Delete archived files last modified more than `retention_days` before
    /// `now`. A missing archive directory is a no-op.
    pub fn prune(&self, retention_days: u32, now: SystemTime) -> Vec<FileOutcome> {
        let retention = Duration::from_secs(u64::from(retention_days) * SECS_PER_DAY);
        let Some(cutoff) = now.checked_sub(retention) else {
            return Vec::new();
        };

        let entries = match fs::read_dir(&self.archive_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(dir = %self.archive_dir.display(), error = %err, "cannot list archive directory");
                return vec![FileOutcome::Skipped {
                    path: self.archive_dir.clone(),
                    reason: SkipReason::Unreadable(err.to_string()),
                }];
            }
        };

        let mut paths = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        paths.sort();

        let mut outcomes = Vec::new();
        for path in paths {
            let modified = match fs::metadata(&path).and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to stat archived file");
                    outcomes.push(FileOutcome::Skipped {
                        path,
                        reason: SkipReason::StatFailed(err.to_string()),
                    });
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed expired archive file");
                    outcomes.push(FileOutcome::Pruned { path });
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove archived file");
                    outcomes.push(FileOutcome::Skipped {
                        path,
                        reason: SkipReason::RemoveFailed(err.to_string()),
                    });
                }
            }
        }
        outcomes
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // rename cannot cross filesystems; fall back to copy + remove.
            if !from.is_file() || to.is_dir() {
                return Err(rename_err);
            }
            fs::copy(from, to).map_err(|_| rename_err)?;
            fs::remove_file(from)
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "another merge run holds {}; if no run is active the lock is stale and must be removed by hand",
        .0.display()
    )]
    Held(PathBuf),
    #[error("creating lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive marker file for one merge run over a directory. Removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE_NAME);
        fs::create_dir_all(dir).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                // Owner pid, for whoever has to clear a stale lock.
                if let Err(source) = writeln!(file, "{}", std::process::id()) {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    return Err(LockError::Io { path, source });
                }
                Ok(Self { path })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Held(path)),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
