//! Merge pipeline: version reduction, expiry filtering, batch output and
//! archive rotation per dataset.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use procmerge_adapters::{discover_merged, discover_raw, load_snapshot_files};
use procmerge_core::{
    canonical_json, temporal_key, value_key, CivilCalendar, FileOutcome, Fingerprint, Normalizer,
    Record, DEFAULT_ERA_OFFSET,
};
use procmerge_storage::{
    sha256_hex, write_atomically, ArchiveRotator, BatchWriter, RunLock, WrittenBatch,
    DEFAULT_ARCHIVE_DIR, DEFAULT_BATCH_SIZE, DEFAULT_RETENTION_DAYS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "procmerge-sync";

pub const REGISTRY_FILE_NAME: &str = "datasets.yaml";
pub const REPORTS_DIR_NAME: &str = "_reports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    VersionChain,
    ContentHash,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn DeduplicationStrategy> {
        match self {
            StrategyKind::VersionChain => Box::<VersionChainStrategy>::default(),
            StrategyKind::ContentHash => Box::new(ContentHashStrategy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub crawler_id: String,
    pub raw_pattern: String,
    pub merged_prefix: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub date_field: Option<String>,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub filter_expired: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_id_field() -> String {
    "tenderId".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading dataset registry {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing dataset registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("dataset #{index} has an empty `{field}`")]
    EmptyField { index: usize, field: &'static str },
    #[error("dataset name `{0}` is declared more than once")]
    DuplicateName(String),
    #[error("merged prefix `{0}` is shared by more than one dataset")]
    DuplicatePrefix(String),
    #[error("dataset `{0}` filters expired records but has no `date_field`")]
    ExpiryWithoutDateField(String),
}

/// Immutable set of dataset descriptors driving one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

impl DatasetRegistry {
    /// The three procurement datasets scraped today.
    pub fn builtin() -> Self {
        Self {
            datasets: vec![
                DatasetConfig {
                    name: "tender".into(),
                    crawler_id: "tender-announcement".into(),
                    raw_pattern: "tender_announcement_*.json".into(),
                    merged_prefix: "tender_merged".into(),
                    id_field: default_id_field(),
                    date_field: Some("deadline".into()),
                    strategy: StrategyKind::VersionChain,
                    filter_expired: true,
                    enabled: true,
                },
                DatasetConfig {
                    name: "promotion".into(),
                    crawler_id: "ppp-mof".into(),
                    raw_pattern: "procurement_*.json".into(),
                    merged_prefix: "promotion_merged".into(),
                    id_field: default_id_field(),
                    date_field: Some("announcementEndDate".into()),
                    strategy: StrategyKind::ContentHash,
                    filter_expired: true,
                    enabled: true,
                },
                DatasetConfig {
                    name: "public_read".into(),
                    crawler_id: "public-read".into(),
                    raw_pattern: "public_read_2*.json".into(),
                    merged_prefix: "public_read_merged".into(),
                    id_field: default_id_field(),
                    date_field: Some("public_read_end".into()),
                    strategy: StrategyKind::VersionChain,
                    filter_expired: true,
                    enabled: true,
                },
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Explicit file, else `<base>/datasets.yaml` if present, else built-ins.
    pub fn resolve(config: &MergeConfig) -> Result<Self, RegistryError> {
        if let Some(path) = &config.datasets_file {
            return Self::load(path);
        }
        let default_path = config.base_dir.join(REGISTRY_FILE_NAME);
        if default_path.is_file() {
            return Self::load(&default_path);
        }
        let registry = Self::builtin();
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        for (index, dataset) in self.datasets.iter().enumerate() {
            for (field, value) in [
                ("name", &dataset.name),
                ("crawler_id", &dataset.crawler_id),
                ("raw_pattern", &dataset.raw_pattern),
                ("merged_prefix", &dataset.merged_prefix),
                ("id_field", &dataset.id_field),
            ] {
                if value.trim().is_empty() {
                    return Err(RegistryError::EmptyField { index, field });
                }
            }
            if !names.insert(dataset.name.as_str()) {
                return Err(RegistryError::DuplicateName(dataset.name.clone()));
            }
            if !prefixes.insert(dataset.merged_prefix.as_str()) {
                return Err(RegistryError::DuplicatePrefix(dataset.merged_prefix.clone()));
            }
            let has_date_field = dataset
                .date_field
                .as_deref()
                .is_some_and(|f| !f.trim().is_empty());
            if dataset.filter_expired && !has_date_field {
                return Err(RegistryError::ExpiryWithoutDateField(dataset.name.clone()));
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DatasetConfig> {
        self.datasets.iter().filter(|d| d.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub base_dir: PathBuf,
    pub datasets_file: Option<PathBuf>,
    pub archive_dir_name: String,
    pub retention_days: u32,
    pub batch_size: usize,
    pub era_offset: i32,
    pub reference_date: Option<NaiveDate>,
    pub write_run_report: bool,
    pub scheduler_enabled: bool,
    pub merge_cron: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            datasets_file: None,
            archive_dir_name: DEFAULT_ARCHIVE_DIR.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            batch_size: DEFAULT_BATCH_SIZE,
            era_offset: DEFAULT_ERA_OFFSET,
            reference_date: None,
            write_run_report: true,
            scheduler_enabled: false,
            merge_cron: "0 0 3 * * *".to_string(),
        }
    }
}

impl MergeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let flag = |key: &str| {
            parse(key).map(|v| {
                matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
            })
        };

        Self {
            base_dir: lookup("PROCMERGE_BASE_DIR")
                .or_else(|| lookup("CRAWLER_BASE_DIR"))
                .map(PathBuf::from)
                .unwrap_or(defaults.base_dir),
            datasets_file: lookup("PROCMERGE_DATASETS_FILE").map(PathBuf::from),
            archive_dir_name: lookup("PROCMERGE_ARCHIVE_DIR").unwrap_or(defaults.archive_dir_name),
            retention_days: parse("PROCMERGE_ARCHIVE_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retention_days),
            batch_size: parse("PROCMERGE_BATCH_SIZE")
                .and_then(|v| v.parse::<usize>().ok())
                .map(|n| n.max(1))
                .unwrap_or(defaults.batch_size),
            era_offset: parse("PROCMERGE_ERA_OFFSET")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.era_offset),
            reference_date: parse("PROCMERGE_REFERENCE_DATE").and_then(|v| {
                NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                    .inspect_err(|err| {
                        warn!(
                            value = v.as_str(),
                            error = %err,
                            "ignoring malformed PROCMERGE_REFERENCE_DATE; using today"
                        );
                    })
                    .ok()
            }),
            write_run_report: flag("PROCMERGE_WRITE_RUN_REPORT")
                .unwrap_or(defaults.write_run_report),
            scheduler_enabled: flag("PROCMERGE_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            merge_cron: lookup("PROCMERGE_MERGE_CRON").unwrap_or(defaults.merge_cron),
        }
    }

    pub fn calendar(&self) -> CivilCalendar {
        CivilCalendar::new(self.era_offset)
    }

    /// The day records are judged against; local "today" unless pinned.
    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn archive_rotator(&self) -> ArchiveRotator {
        ArchiveRotator::new(&self.base_dir, &self.archive_dir_name)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.base_dir.join(REPORTS_DIR_NAME)
    }
}

/// Result of one strategy pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduction {
    pub records: Vec<Record>,
    pub dropped_without_id: usize,
}

/// Interchangeable policies for collapsing repeated snapshots of the same
/// records.
pub trait DeduplicationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    fn apply(&self, records: Vec<Record>, id_field: &str) -> Reduction;
}

/// Keeps, per entity id, only the chronological versions whose content
/// differs from the last version kept.
#[derive(Debug, Clone, Default)]
pub struct VersionChainStrategy {
    normalizer: Normalizer,
}

impl VersionChainStrategy {
    pub fn new(normalizer: Normalizer) -> Self {
        Self { normalizer }
    }
}

impl DeduplicationStrategy for VersionChainStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::VersionChain
    }

    fn apply(&self, records: Vec<Record>, id_field: &str) -> Reduction {
        let mut groups: Vec<Vec<Record>> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut dropped_without_id = 0usize;

        for record in records {
            let key = match record.get(id_field) {
                None | Some(Value::Null) => {
                    dropped_without_id += 1;
                    continue;
                }
                Some(id) => value_key(id),
            };
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(record);
        }
        if dropped_without_id > 0 {
            debug!(id_field, dropped_without_id, "records without id left out of version tracking");
        }

        let mut kept = Vec::new();
        for mut versions in groups {
            versions.sort_by_cached_key(temporal_key);
            let mut last_kept: Option<Fingerprint> = None;
            for record in versions {
                let fingerprint = self.normalizer.fingerprint(&record);
                if last_kept.as_ref() == Some(&fingerprint) {
                    continue;
                }
                last_kept = Some(fingerprint);
                kept.push(record);
            }
        }

        Reduction {
            records: kept,
            dropped_without_id,
        }
    }
}

/// Drops exact repeats keyed by id + hash of the full sorted-key record.
/// Capture timestamps count as content here.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHashStrategy;

impl DeduplicationStrategy for ContentHashStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ContentHash
    }

    fn apply(&self, records: Vec<Record>, id_field: &str) -> Reduction {
        let mut seen = HashSet::new();
        let records = records
            .into_iter()
            .filter(|record| seen.insert(content_key(record, id_field)))
            .collect();
        Reduction {
            records,
            dropped_without_id: 0,
        }
    }
}

fn content_key(record: &Record, id_field: &str) -> (String, String) {
    let id = record.get(id_field).map(value_key).unwrap_or_default();
    (id, sha256_hex(canonical_json(record).as_bytes()))
}

pub fn reduce_versions(records: Vec<Record>, id_field: &str) -> Vec<Record> {
    VersionChainStrategy::default().apply(records, id_field).records
}

pub fn dedupe(records: Vec<Record>, id_field: &str) -> Vec<Record> {
    ContentHashStrategy.apply(records, id_field).records
}

#[derive(Debug, Clone, Copy)]
pub struct ExpiryFilter {
    calendar: CivilCalendar,
    reference: NaiveDate,
}

impl ExpiryFilter {
    pub fn new(calendar: CivilCalendar, reference: NaiveDate) -> Self {
        Self {
            calendar,
            reference,
        }
    }

    pub fn is_expired(&self, record: &Record, date_field: &str) -> bool {
        self.calendar.is_expired(record.get(date_field), self.reference)
    }

    pub fn filter_active(&self, records: Vec<Record>, date_field: &str) -> Vec<Record> {
        records
            .into_iter()
            .filter(|record| !self.is_expired(record, date_field))
            .collect()
    }
}

pub fn filter_active(records: Vec<Record>, date_field: &str, reference: NaiveDate) -> Vec<Record> {
    ExpiryFilter::new(CivilCalendar::default(), reference).filter_active(records, date_field)
}

/// Consumer of the files a run considers finished, e.g. a remote uploader.
pub trait ReadyFileSink: Send + Sync {
    fn publish(&self, files: &[PathBuf]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LoggingSink;

impl ReadyFileSink for LoggingSink {
    fn publish(&self, files: &[PathBuf]) -> Result<()> {
        for file in files {
            info!(path = %file.display(), "merged file ready");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DatasetStatus {
    Merged,
    NoInput,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub dataset: String,
    pub strategy: StrategyKind,
    pub status: DatasetStatus,
    pub loaded_records: usize,
    pub after_reduction: usize,
    pub after_expiry: usize,
    pub dropped_without_id: usize,
    pub inputs: Vec<FileOutcome>,
    pub written: Vec<WrittenBatch>,
    pub archived: Vec<FileOutcome>,
}

impl DatasetReport {
    fn new(dataset: &DatasetConfig) -> Self {
        Self {
            dataset: dataset.name.clone(),
            strategy: dataset.strategy,
            status: DatasetStatus::NoInput,
            loaded_records: 0,
            after_reduction: 0,
            after_expiry: 0,
            dropped_without_id: 0,
            inputs: Vec::new(),
            written: Vec::new(),
            archived: Vec::new(),
        }
    }

    fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = DatasetStatus::Failed {
            error: error.into(),
        };
        self
    }

    pub fn written_records(&self) -> usize {
        self.written.iter().map(|b| b.records).sum()
    }

    pub fn skipped_files(&self) -> impl Iterator<Item = &FileOutcome> {
        self.inputs
            .iter()
            .chain(self.archived.iter())
            .filter(|o| o.is_skipped())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reference_date: NaiveDate,
    pub datasets: Vec<DatasetReport>,
    pub pruned: Vec<FileOutcome>,
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

impl RunReport {
    /// Batch files written by this run, in dataset then batch order.
    pub fn ready_files(&self) -> Vec<PathBuf> {
        self.datasets
            .iter()
            .flat_map(|d| d.written.iter().map(|b| b.path.clone()))
            .collect()
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetReport> {
        self.datasets.iter().find(|d| d.dataset == name)
    }

    pub fn has_failures(&self) -> bool {
        self.datasets
            .iter()
            .any(|d| matches!(d.status, DatasetStatus::Failed { .. }))
    }
}

pub struct MergePipeline {
    config: MergeConfig,
    registry: DatasetRegistry,
    sink: Box<dyn ReadyFileSink>,
}

impl MergePipeline {
    pub fn new(config: MergeConfig, registry: DatasetRegistry) -> Self {
        Self {
            config,
            registry,
            sink: Box::new(LoggingSink),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ReadyFileSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn run_once(&self) -> Result<RunReport> {
        self.run_once_at(Utc::now())
    }

    /// One merge pass over every enabled dataset, stamping outputs with
    /// `generated_at`.
    pub fn run_once_at(&self, generated_at: DateTime<Utc>) -> Result<RunReport> {
        self.registry
            .validate()
            .context("validating dataset registry")?;
        let _lock = RunLock::acquire(&self.config.base_dir).context("acquiring run lock")?;

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let reference_date = self.config.reference_date();
        info!(
            %run_id,
            base_dir = %self.config.base_dir.display(),
            today = %self.config.calendar().format(reference_date),
            "starting merge run"
        );

        let datasets = self
            .registry
            .enabled()
            .map(|dataset| self.merge_dataset(run_id, dataset, generated_at, reference_date))
            .collect::<Vec<_>>();
        let pruned = self.prune_archive();

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            reference_date,
            datasets,
            pruned,
            report_path: None,
        };

        if self.config.write_run_report {
            let path = write_run_report(&self.config.reports_dir(), &report)?;
            report.report_path = Some(path);
        }

        let ready = report.ready_files();
        if let Err(err) = self.sink.publish(&ready) {
            warn!(error = %format!("{err:#}"), files = ready.len(), "publishing ready files failed");
        }

        info!(
            %run_id,
            datasets = report.datasets.len(),
            ready_files = ready.len(),
            pruned = report.pruned.len(),
            "merge run complete"
        );
        Ok(report)
    }

    pub fn prune_archive(&self) -> Vec<FileOutcome> {
        self.config
            .archive_rotator()
            .prune(self.config.retention_days, SystemTime::now())
    }

    fn merge_dataset(
        &self,
        run_id: Uuid,
        dataset: &DatasetConfig,
        generated_at: DateTime<Utc>,
        reference_date: NaiveDate,
    ) -> DatasetReport {
        let span = info_span!("merge_dataset", %run_id, dataset = dataset.name.as_str());
        let _guard = span.enter();
        let mut report = DatasetReport::new(dataset);
        let dir = &self.config.base_dir;

        let merged_files = match discover_merged(dir, &dataset.merged_prefix) {
            Ok(files) => files,
            Err(err) => return report.failed(err.to_string()),
        };
        let raw_files = match discover_raw(dir, &dataset.raw_pattern, &dataset.merged_prefix) {
            Ok(files) => files,
            Err(err) => return report.failed(err.to_string()),
        };

        let mut loaded = load_snapshot_files(&merged_files);
        let previous = loaded.records.len();
        loaded.append(load_snapshot_files(&raw_files));
        info!(
            previous,
            raw = loaded.records.len() - previous,
            merged_files = merged_files.len(),
            raw_files = raw_files.len(),
            "loaded records"
        );
        report.loaded_records = loaded.records.len();
        report.inputs = loaded.outcomes;

        if loaded.records.is_empty() {
            info!("no input records; nothing to merge");
            return report;
        }

        let reduction = dataset
            .strategy
            .build()
            .apply(loaded.records, &dataset.id_field);
        report.dropped_without_id = reduction.dropped_without_id;
        report.after_reduction = reduction.records.len();
        if reduction.dropped_without_id > 0 {
            info!(
                dropped = reduction.dropped_without_id,
                id_field = dataset.id_field.as_str(),
                "dropped records without an id"
            );
        }

        let active = match (&dataset.date_field, dataset.filter_expired) {
            (Some(date_field), true) => ExpiryFilter::new(self.config.calendar(), reference_date)
                .filter_active(reduction.records, date_field),
            _ => reduction.records,
        };
        report.after_expiry = active.len();
        info!(
            strategy = ?dataset.strategy,
            after_reduction = report.after_reduction,
            after_expiry = report.after_expiry,
            "reduced records"
        );

        let writer = BatchWriter::new(dir, self.config.batch_size);
        match writer.write_batches(
            &active,
            &dataset.crawler_id,
            &dataset.merged_prefix,
            generated_at,
        ) {
            Ok(written) => {
                report.written = written;
                report.archived = self.config.archive_rotator().rotate(&merged_files);
                report.status = DatasetStatus::Merged;
                report
            }
            Err(err) => {
                warn!(error = %err, cause = %err.cause, "batch write failed; previous generation left in place");
                let message = format!("{err}: {}", err.cause);
                report.written = err.written;
                report.failed(message)
            }
        }
    }
}

/// Persist a run report as `run_<stamp>_<run_id>.json` under `reports_dir`.
pub fn write_run_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let name = format!(
        "run_{}_{}.json",
        report.started_at.format("%Y%m%d_%H%M%S"),
        report.run_id
    );
    let path = reports_dir.join(name);
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    write_atomically(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub fn run_merge_once_from_env() -> Result<RunReport> {
    let config = MergeConfig::from_env();
    let registry = DatasetRegistry::resolve(&config).context("loading dataset registry")?;
    MergePipeline::new(config, registry).run_once()
}

pub async fn maybe_build_scheduler(
    config: MergeConfig,
    registry: DatasetRegistry,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.merge_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        let registry = registry.clone();
        Box::pin(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                MergePipeline::new(config, registry).run_once()
            })
            .await;
            match outcome {
                Ok(Ok(report)) => info!(
                    run_id = %report.run_id,
                    ready_files = report.ready_files().len(),
                    "scheduled merge finished"
                ),
                Ok(Err(err)) => warn!(error = %format!("{err:#}"), "scheduled merge failed"),
                Err(err) => warn!(error = %err, "scheduled merge task panicked"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Markdown summary of the most recent `runs` run reports.
pub fn report_markdown(runs: usize, base_dir: Option<PathBuf>) -> Result<String> {
    let root = base_dir.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join(REPORTS_DIR_NAME);
    let mut files = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with("run_"))
                    .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    files.sort();
    files.reverse();

    let mut lines = vec!["# procmerge runs".to_string(), String::new()];
    for path in files.into_iter().take(runs.max(1)) {
        let report: RunReport = serde_json::from_str(
            &std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;

        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- started: {}", report.started_at.to_rfc3339()));
        lines.push(format!("- reference date: {}", report.reference_date));
        for dataset in &report.datasets {
            let status = match &dataset.status {
                DatasetStatus::Merged => "merged".to_string(),
                DatasetStatus::NoInput => "no input".to_string(),
                DatasetStatus::Failed { error } => format!("failed ({error})"),
            };
            lines.push(format!(
                "- {}: {} | loaded {} -> reduced {} -> active {} | {} file(s), {} skipped",
                dataset.dataset,
                status,
                dataset.loaded_records,
                dataset.after_reduction,
                dataset.after_expiry,
                dataset.written.len(),
                dataset.skipped_files().count(),
            ));
        }
        if !report.pruned.is_empty() {
            lines.push(format!("- pruned archive files: {}", report.pruned.len()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
