//! Snapshot discovery + loading for scraper outputs and merged generations.
//!
//! Scrapers emit either a bare array of records, an envelope whose `data` key
//! holds the array, or an envelope whose `data` is an object of arrays keyed
//! by sub-category. All three flatten into one record list here.

use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use procmerge_core::{FileOutcome, Record, SkipReason};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "procmerge-adapters";

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("invalid file pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Records from one snapshot file. `ignored` counts array elements that were
/// not JSON objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub records: Vec<Record>,
    pub ignored: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedRecords {
    pub records: Vec<Record>,
    pub outcomes: Vec<FileOutcome>,
}

impl LoadedRecords {
    pub fn append(&mut self, mut other: LoadedRecords) {
        self.records.append(&mut other.records);
        self.outcomes.append(&mut other.outcomes);
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| o.is_skipped())
    }
}

/// Regular files in `dir` matching `pattern`, sorted by file name so read
/// order never depends on directory listing order.
pub fn discover(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, DiscoverError> {
    let full = format!(
        "{}/{}",
        Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let paths = glob::glob_with(&full, options).map_err(|source| DiscoverError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut files = paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(path = %err.path().display(), error = %err, "unreadable directory entry");
                None
            }
        })
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Like [`discover`], minus any file that belongs to the merged generation
/// identified by `merged_prefix`.
pub fn discover_raw(
    dir: &Path,
    pattern: &str,
    merged_prefix: &str,
) -> Result<Vec<PathBuf>, DiscoverError> {
    let merged_marker = format!("{merged_prefix}_");
    Ok(discover(dir, pattern)?
        .into_iter()
        .filter(|path| {
            let is_merged = path
                .file_name()
                .map(|name| name.to_string_lossy().starts_with(&merged_marker))
                .unwrap_or(false);
            if is_merged {
                debug!(path = %path.display(), "skipping merged output in raw scan");
            }
            !is_merged
        })
        .collect())
}

pub fn merged_pattern(merged_prefix: &str) -> String {
    format!("{merged_prefix}_*.json")
}

/// Merged generations of exactly `merged_prefix`: `<prefix>_` must be
/// followed by the generation stamp, so a dataset whose prefix extends this
/// one (`tender_merged_v2`) is never picked up.
pub fn discover_merged(dir: &Path, merged_prefix: &str) -> Result<Vec<PathBuf>, DiscoverError> {
    let marker = format!("{merged_prefix}_");
    Ok(discover(dir, &merged_pattern(merged_prefix))?
        .into_iter()
        .filter(|path| {
            let own = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(&marker))
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()));
            if !own {
                debug!(path = %path.display(), "skipping file of another merged prefix");
            }
            own
        })
        .collect())
}

pub fn load_snapshot_file(path: impl AsRef<Path>) -> Result<Snapshot, SkipReason> {
    let path = path.as_ref();
    let value = read_json_file(path)?;
    flatten_snapshot(value)
}

/// Load every file in order. Broken files are reported, never fatal.
pub fn load_snapshot_files(paths: &[PathBuf]) -> LoadedRecords {
    let mut loaded = LoadedRecords::default();
    for path in paths {
        match load_snapshot_file(path) {
            Ok(snapshot) => {
                debug!(
                    path = %path.display(),
                    records = snapshot.records.len(),
                    ignored = snapshot.ignored,
                    "loaded snapshot"
                );
                loaded.outcomes.push(FileOutcome::Loaded {
                    path: path.clone(),
                    records: snapshot.records.len(),
                    ignored: snapshot.ignored,
                });
                loaded.records.extend(snapshot.records);
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "skipping snapshot file");
                loaded.outcomes.push(FileOutcome::Skipped {
                    path: path.clone(),
                    reason,
                });
            }
        }
    }
    loaded
}

fn read_json_file(path: &Path) -> Result<Value, SkipReason> {
    let data = fs::read_to_string(path)
        .map_err(|err| SkipReason::Unreadable(format!("reading {}: {err}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|err| SkipReason::MalformedJson(format!("parsing {}: {err}", path.display())))
}

pub fn flatten_snapshot(value: Value) -> Result<Snapshot, SkipReason> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut envelope) => match envelope.remove("data") {
            Some(Value::Array(items)) => items,
            Some(Value::Object(groups)) => groups
                .into_iter()
                .filter_map(|(_, group)| match group {
                    Value::Array(items) => Some(items),
                    _ => None,
                })
                .flatten()
                .collect(),
            Some(other) => {
                return Err(SkipReason::UnexpectedShape(format!(
                    "`data` holds {}",
                    json_kind(&other)
                )))
            }
            None => {
                return Err(SkipReason::UnexpectedShape(
                    "object without a `data` key".to_string(),
                ))
            }
        },
        other => {
            return Err(SkipReason::UnexpectedShape(format!(
                "top-level {}",
                json_kind(&other)
            )))
        }
    };

    let mut snapshot = Snapshot::default();
    for item in items {
        match item {
            Value::Object(record) => snapshot.records.push(record),
            _ => snapshot.ignored += 1,
        }
    }
    Ok(snapshot)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
