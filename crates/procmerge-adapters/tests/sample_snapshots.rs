use std::path::PathBuf;

use procmerge_adapters::{discover_raw, load_snapshot_files};
use procmerge_core::FileOutcome;

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[test]
fn tender_fixture_loads_envelope_records() {
    let dir = fixtures_root().join("tender");
    let files = discover_raw(&dir, "tender_announcement_*.json", "tender_merged").expect("discover");
    assert_eq!(files.len(), 1);

    let loaded = load_snapshot_files(&files);
    assert_eq!(loaded.records.len(), 3);
    assert_eq!(loaded.records[0]["tenderId"], "TP-114-0087");
    assert!(matches!(
        loaded.outcomes[0],
        FileOutcome::Loaded { records: 3, ignored: 0, .. }
    ));
}

#[test]
fn promotion_fixture_flattens_sub_categories() {
    let dir = fixtures_root().join("promotion");
    let files = discover_raw(&dir, "procurement_*.json", "promotion_merged").expect("discover");
    let loaded = load_snapshot_files(&files);
    assert_eq!(loaded.records.len(), 3);
    assert!(loaded
        .records
        .iter()
        .any(|r| r["listType"] == "registered" && r["tenderId"] == "PPP-113-204"));
}

#[test]
fn public_read_fixture_is_a_bare_array() {
    let dir = fixtures_root().join("public_read");
    let files = discover_raw(&dir, "public_read_2*.json", "public_read_merged").expect("discover");
    let loaded = load_snapshot_files(&files);
    assert_eq!(loaded.records.len(), 2);
    assert_eq!(loaded.skipped().count(), 0);
}
