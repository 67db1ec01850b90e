use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{NaiveDate, TimeZone, Utc};
use procmerge_core::FileOutcome;
use procmerge_storage::LOCK_FILE_NAME;
use procmerge_sync::{
    report_markdown, DatasetRegistry, DatasetStatus, MergeConfig, MergePipeline, ReadyFileSink,
};
use serde_json::Value;
use tempfile::tempdir;

#[derive(Clone, Default)]
struct RecordingSink {
    published: Arc<Mutex<Vec<Vec<PathBuf>>>>,
}

impl ReadyFileSink for RecordingSink {
    fn publish(&self, files: &[PathBuf]) -> Result<()> {
        self.published
            .lock()
            .expect("sink lock")
            .push(files.to_vec());
        Ok(())
    }
}

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn seed_fixtures(base: &Path) {
    for (dir, file) in [
        ("tender", "tender_announcement_20251201_060000.json"),
        ("promotion", "procurement_20251201_060000.json"),
        ("public_read", "public_read_20251201_060000.json"),
    ] {
        fs::copy(fixtures_root().join(dir).join(file), base.join(file)).expect("copy fixture");
    }
}

fn config_for(base: &Path) -> MergeConfig {
    MergeConfig {
        base_dir: base.to_path_buf(),
        batch_size: 2,
        reference_date: NaiveDate::from_ymd_opt(2025, 12, 1),
        ..MergeConfig::default()
    }
}

fn file_names(dir: &Path, prefix: &str) -> Vec<String> {
    let mut names = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with(prefix))
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[test]
fn merges_rotates_and_reports_across_generations() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    seed_fixtures(base);
    fs::write(base.join("tender_announcement_20251201_063000.json"), "{\"data\": [")
        .expect("write broken");

    let sink = RecordingSink::default();
    let pipeline = MergePipeline::new(config_for(base), DatasetRegistry::builtin())
        .with_sink(Box::new(sink.clone()));

    // First generation.
    let first = pipeline
        .run_once_at(Utc.with_ymd_and_hms(2025, 12, 1, 7, 0, 0).unwrap())
        .expect("first run");
    assert!(!first.has_failures());

    let tender = first.dataset("tender").expect("tender");
    assert_eq!(tender.status, DatasetStatus::Merged);
    assert_eq!(tender.loaded_records, 3);
    assert_eq!(tender.after_reduction, 3);
    assert_eq!(tender.after_expiry, 2);
    assert_eq!(tender.written.len(), 1);
    assert!(tender.archived.is_empty());
    assert_eq!(tender.skipped_files().count(), 1);

    let promotion = first.dataset("promotion").expect("promotion");
    assert_eq!(promotion.loaded_records, 3);
    assert_eq!(promotion.after_expiry, 2);

    let public_read = first.dataset("public_read").expect("public_read");
    assert_eq!(public_read.dropped_without_id, 1);
    assert_eq!(public_read.after_expiry, 1);

    assert_eq!(first.ready_files().len(), 3);
    assert!(first.report_path.as_ref().is_some_and(|p| p.is_file()));
    assert!(!base.join(LOCK_FILE_NAME).exists());

    let batch: Value = serde_json::from_str(
        &fs::read_to_string(base.join("tender_merged_20251201_070000_batch001.json"))
            .expect("read batch"),
    )
    .expect("parse batch");
    assert_eq!(batch["crawlerId"], "tender-announcement");
    assert_eq!(batch["batchNumber"], 1);
    assert_eq!(batch["totalBatches"], 1);
    assert_eq!(batch["totalRecords"], 2);
    assert_eq!(batch["data"][0]["tenderId"], "TP-114-0087");
    assert_eq!(batch["data"][1]["tenderId"], "NT-114-0310");

    // Second generation: one tender changed upstream.
    fs::write(
        base.join("tender_announcement_20251202_060000.json"),
        r#"{"data": [{
            "tenderId": "TP-114-0087",
            "tenderName": "信義路人行道改善工程",
            "deadline": "114/12/15",
            "budget_amount": "13,100,000",
            "scrapedAt": "2025-12-02T06:00:10"
        }]}"#,
    )
    .expect("write second scrape");

    let second = pipeline
        .run_once_at(Utc.with_ymd_and_hms(2025, 12, 2, 7, 0, 0).unwrap())
        .expect("second run");
    let tender = second.dataset("tender").expect("tender");
    assert_eq!(tender.loaded_records, 6);
    assert_eq!(tender.after_reduction, 4);
    assert_eq!(tender.after_expiry, 3);
    assert_eq!(tender.written.len(), 2);
    assert!(tender.archived.is_empty());
    assert_eq!(second.dataset("promotion").map(|d| d.after_expiry), Some(2));
    assert_eq!(
        file_names(base, "tender_merged_"),
        vec![
            "tender_merged_20251201_070000_batch001.json",
            "tender_merged_20251202_070000_batch001.json",
            "tender_merged_20251202_070000_batch002.json",
        ]
    );

    // Third generation retires everything but the newest previous file.
    let third = pipeline
        .run_once_at(Utc.with_ymd_and_hms(2025, 12, 3, 7, 0, 0).unwrap())
        .expect("third run");
    let tender = third.dataset("tender").expect("tender");
    assert_eq!(tender.after_expiry, 3);
    assert_eq!(
        tender
            .archived
            .iter()
            .filter(|o| matches!(o, FileOutcome::Archived { .. }))
            .count(),
        2
    );
    assert_eq!(
        file_names(&base.join("_archive"), "tender_merged_"),
        vec![
            "tender_merged_20251201_070000_batch001.json",
            "tender_merged_20251202_070000_batch001.json",
        ]
    );

    let published = sink.published.lock().expect("sink lock");
    assert_eq!(published.len(), 3);
    assert_eq!(published[1].len(), 4);

    let markdown = report_markdown(5, Some(base.to_path_buf())).expect("markdown");
    assert!(markdown.contains("# procmerge runs"));
    assert!(markdown.contains("- tender: merged"));
}

#[test]
fn dataset_without_input_is_reported_and_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let registry = DatasetRegistry::from_yaml_str(
        r#"
datasets:
  - name: tender
    crawler_id: tender-announcement
    raw_pattern: "tender_announcement_*.json"
    merged_prefix: tender_merged
"#,
    )
    .expect("registry");
    let config = MergeConfig {
        write_run_report: false,
        ..config_for(dir.path())
    };

    let report = MergePipeline::new(config, registry)
        .run_once_at(Utc.with_ymd_and_hms(2025, 12, 1, 7, 0, 0).unwrap())
        .expect("run");
    assert_eq!(report.datasets.len(), 1);
    assert_eq!(report.datasets[0].status, DatasetStatus::NoInput);
    assert!(report.ready_files().is_empty());
    assert!(report.report_path.is_none());
    assert!(!dir.path().join("_reports").exists());
}

#[test]
fn failed_batch_write_marks_only_that_dataset() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    seed_fixtures(base);
    fs::create_dir(base.join("tender_merged_20251201_070000_batch001.json")).expect("blocker");

    let report = MergePipeline::new(config_for(base), DatasetRegistry::builtin())
        .run_once_at(Utc.with_ymd_and_hms(2025, 12, 1, 7, 0, 0).unwrap())
        .expect("run");

    assert!(report.has_failures());
    let tender = report.dataset("tender").expect("tender");
    assert!(matches!(tender.status, DatasetStatus::Failed { .. }));
    assert!(tender.written.is_empty());
    assert!(tender.archived.is_empty());
    assert_eq!(
        report.dataset("promotion").map(|d| d.status.clone()),
        Some(DatasetStatus::Merged)
    );
    assert_eq!(report.ready_files().len(), 2);
}

#[test]
fn concurrent_run_is_refused() {
    let dir = tempdir().expect("tempdir");
    seed_fixtures(dir.path());
    fs::write(dir.path().join(LOCK_FILE_NAME), "4242").expect("write lock");

    let err = MergePipeline::new(config_for(dir.path()), DatasetRegistry::builtin())
        .run_once()
        .expect_err("lock held");
    assert!(format!("{err:#}").contains("run lock"));
    assert!(file_names(dir.path(), "tender_merged_").is_empty());
}

#[test]
fn datasets_with_overlapping_prefixes_stay_isolated() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let registry = DatasetRegistry::from_yaml_str(
        r#"
datasets:
  - name: tender
    crawler_id: tender-announcement
    raw_pattern: "tender_raw_*.json"
    merged_prefix: tender_merged
  - name: tender_v2
    crawler_id: tender-announcement-v2
    raw_pattern: "v2_raw_*.json"
    merged_prefix: tender_merged_v2
"#,
    )
    .expect("registry");
    fs::write(base.join("tender_raw_1.json"), r#"[{"tenderId": "A"}]"#).expect("write");
    fs::write(base.join("v2_raw_1.json"), r#"[{"tenderId": "V2ONLY"}]"#).expect("write");

    let pipeline = MergePipeline::new(config_for(base), registry);
    let names = |outcomes: &[FileOutcome]| {
        outcomes
            .iter()
            .map(|o| o.path().file_name().expect("name").to_string_lossy().to_string())
            .collect::<Vec<_>>()
    };

    pipeline
        .run_once_at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        .expect("first run");
    let second = pipeline
        .run_once_at(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap())
        .expect("second run");
    let tender = second.dataset("tender").expect("tender");
    assert_eq!(
        names(&tender.inputs),
        vec!["tender_merged_20250101_000000_batch001.json", "tender_raw_1.json"]
    );
    assert_eq!(tender.after_reduction, 1);
    assert_eq!(
        names(&second.dataset("tender_v2").expect("v2").inputs),
        vec!["tender_merged_v2_20250101_000000_batch001.json", "v2_raw_1.json"]
    );

    let third = pipeline
        .run_once_at(Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap())
        .expect("third run");
    assert_eq!(
        names(&third.dataset("tender").expect("tender").archived),
        vec!["tender_merged_20250101_000000_batch001.json"]
    );
    assert_eq!(
        names(&third.dataset("tender_v2").expect("v2").archived),
        vec!["tender_merged_v2_20250101_000000_batch001.json"]
    );

    let batch: Value = serde_json::from_str(
        &fs::read_to_string(base.join("tender_merged_20250103_000000_batch001.json"))
            .expect("read batch"),
    )
    .expect("parse batch");
    assert_eq!(batch["totalRecords"], 1);
    assert_eq!(batch["data"][0]["tenderId"], "A");
}
