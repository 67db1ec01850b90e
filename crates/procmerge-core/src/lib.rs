//! Record model, content fingerprints and date handling for procmerge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "procmerge-core";

/// One scraped procurement case at one point in time. Fields are opaque
/// apart from the id, timestamp and date fields the engine is told to read.
pub type Record = Map<String, Value>;

/// Capture and bookkeeping timestamps that never count as a content change.
pub const VOLATILE_FIELDS: &[&str] = &[
    "scrapedAt",
    "scraped_at",
    "scrapedTime",
    "scrape_time",
    "scraped_at_ts",
    "lastUpdateTime",
    "updatedAt",
    "updated_at",
    "createdAt",
    "created_at",
];

/// Fields consulted, in precedence order, when deriving a [`TemporalKey`].
pub const TEMPORAL_FIELDS: &[&str] = &[
    "scrapedAt",
    "scraped_at",
    "scrapedTime",
    "scrape_time",
    "createdAt",
    "created_at",
];

pub const INTERNAL_FIELD_PREFIX: &str = "_";

/// Civil year = era year + this offset for the Minguo calendar used by the
/// procurement sites.
pub const DEFAULT_ERA_OFFSET: i32 = 1911;

static DEFAULT_NORMALIZER: LazyLock<Normalizer> = LazyLock::new(Normalizer::default);

static CIVIL_DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["/", r"\.", "-"]
        .iter()
        .map(|delim| {
            Regex::new(&format!(
                r"^([0-9]{{3}}){delim}([0-9]{{1,2}}){delim}([0-9]{{1,2}})"
            ))
            .expect("valid civil date pattern")
        })
        .collect()
});

static BASIC_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]{4})([0-9]{2})([0-9]{2})T([0-9]{2})([0-9]{2})([0-9]{2})(.*)$")
        .expect("valid basic timestamp pattern")
});

/// Content-only view of a record. Equality is by key/value set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(BTreeMap<String, Value>);

impl Fingerprint {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Strips volatile fields from records to produce [`Fingerprint`]s.
#[derive(Debug, Clone)]
pub struct Normalizer {
    volatile: BTreeSet<String>,
    internal_prefix: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(VOLATILE_FIELDS.iter().copied(), INTERNAL_FIELD_PREFIX)
    }
}

impl Normalizer {
    pub fn new<I, S>(volatile: I, internal_prefix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            volatile: volatile.into_iter().map(Into::into).collect(),
            internal_prefix: internal_prefix.into(),
        }
    }

    pub fn is_volatile(&self, field: &str) -> bool {
        self.volatile.contains(field)
            || (!self.internal_prefix.is_empty() && field.starts_with(&self.internal_prefix))
    }

    pub fn fingerprint(&self, record: &Record) -> Fingerprint {
        Fingerprint(
            record
                .iter()
                .filter(|(field, _)| !self.is_volatile(field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
        )
    }
}

/// Fingerprint a record with the default volatile-field set.
pub fn normalize(record: &Record) -> Fingerprint {
    DEFAULT_NORMALIZER.fingerprint(record)
}

/// Sort key approximating when a record was captured.
///
/// Variant order is the sort priority: parsed instants first, then present
/// but unparsable values (lexicographic), then records with no timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TemporalKey {
    Parsed(DateTime<FixedOffset>),
    Unparsed(String),
    Missing,
}

impl TemporalKey {
    pub fn priority(&self) -> u8 {
        match self {
            TemporalKey::Parsed(_) => 0,
            TemporalKey::Unparsed(_) => 1,
            TemporalKey::Missing => 2,
        }
    }
}

pub fn temporal_key(record: &Record) -> TemporalKey {
    for field in TEMPORAL_FIELDS {
        let Some(value) = record.get(*field) else {
            continue;
        };
        if !is_truthy(value) {
            continue;
        }
        return match value {
            Value::String(raw) => parse_timestamp(raw)
                .map(TemporalKey::Parsed)
                .unwrap_or_else(|| TemporalKey::Unparsed(raw.clone())),
            other => TemporalKey::Unparsed(other.to_string()),
        };
    }
    TemporalKey::Missing
}

/// Parse an ISO-8601-like timestamp. A trailing `Z` is UTC; values without
/// an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    let mut normalized = match raw.strip_suffix('Z').or_else(|| raw.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => raw.to_string(),
    };
    // Basic form: 20240301T080000[offset]
    if let Some(caps) = BASIC_TIMESTAMP.captures(&normalized) {
        normalized = format!(
            "{}-{}-{}T{}:{}:{}{}",
            &caps[1], &caps[2], &caps[3], &caps[4], &caps[5], &caps[6], &caps[7]
        );
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed);
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M%:z",
        "%Y-%m-%d %H:%M%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
    ] {
        if let Ok(parsed) = DateTime::parse_from_str(&normalized, fmt) {
            return Some(parsed);
        }
    }

    let utc = FixedOffset::east_opt(0)?;
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Some(utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| utc.from_utc_datetime(&naive))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Rebuild a value with object keys in sorted order at every depth.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(canonicalize_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonicalize_map(map: &Map<String, Value>) -> Map<String, Value> {
    let sorted: BTreeMap<&String, &Value> = map.iter().collect();
    sorted
        .into_iter()
        .map(|(field, value)| (field.clone(), canonicalize(value)))
        .collect()
}

/// Compact sorted-key serialization of a whole record.
pub fn canonical_json(record: &Record) -> String {
    Value::Object(canonicalize_map(record)).to_string()
}

/// Identity of a JSON value for grouping. Strings are used verbatim; other
/// values by their JSON text, so `"7"` and `7` stay distinct.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => format!("s:{s}"),
        other => format!("j:{other}"),
    }
}

/// Offset civil calendar for dates written as `YYY/MM/DD`, `YYY.MM.DD` or
/// `YYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CivilCalendar {
    pub era_offset: i32,
}

impl Default for CivilCalendar {
    fn default() -> Self {
        Self {
            era_offset: DEFAULT_ERA_OFFSET,
        }
    }
}

impl CivilCalendar {
    pub fn new(era_offset: i32) -> Self {
        Self { era_offset }
    }

    pub fn parse(&self, raw: &str) -> Option<NaiveDate> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        for pattern in CIVIL_DATE_PATTERNS.iter() {
            let Some(caps) = pattern.captures(raw) else {
                continue;
            };
            let (Ok(year), Ok(month), Ok(day)) = (
                caps[1].parse::<i32>(),
                caps[2].parse::<u32>(),
                caps[3].parse::<u32>(),
            ) else {
                continue;
            };
            let Some(civil_year) = year.checked_add(self.era_offset) else {
                continue;
            };
            if let Some(date) = NaiveDate::from_ymd_opt(civil_year, month, day) {
                return Some(date);
            }
        }
        None
    }

    pub fn format(&self, date: NaiveDate) -> String {
        use chrono::Datelike;
        format!(
            "{}/{:02}/{:02}",
            date.year() - self.era_offset,
            date.month(),
            date.day()
        )
    }

    /// Expired iff the value parses and falls strictly before `reference`.
    /// Missing, non-string and unparsable values are never expired.
    pub fn is_expired(&self, value: Option<&Value>, reference: NaiveDate) -> bool {
        let Some(Value::String(raw)) = value else {
            return false;
        };
        self.parse(raw).is_some_and(|date| date < reference)
    }
}

pub fn is_expired(value: Option<&Value>, reference: NaiveDate) -> bool {
    CivilCalendar::default().is_expired(value, reference)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    Unreadable(String),
    MalformedJson(String),
    UnexpectedShape(String),
    MoveFailed(String),
    StatFailed(String),
    RemoveFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unreadable(detail) => write!(f, "unreadable: {detail}"),
            SkipReason::MalformedJson(detail) => write!(f, "malformed json: {detail}"),
            SkipReason::UnexpectedShape(detail) => write!(f, "unexpected shape: {detail}"),
            SkipReason::MoveFailed(detail) => write!(f, "move failed: {detail}"),
            SkipReason::StatFailed(detail) => write!(f, "stat failed: {detail}"),
            SkipReason::RemoveFailed(detail) => write!(f, "remove failed: {detail}"),
        }
    }
}

/// What happened to one file during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Loaded {
        path: PathBuf,
        records: usize,
        ignored: usize,
    },
    Archived {
        path: PathBuf,
        to: PathBuf,
    },
    Pruned {
        path: PathBuf,
    },
    Skipped {
        path: PathBuf,
        reason: SkipReason,
    },
}

impl FileOutcome {
    pub fn path(&self) -> &Path {
        match self {
            FileOutcome::Loaded { path, .. }
            | FileOutcome::Archived { path, .. }
            | FileOutcome::Pruned { path }
            | FileOutcome::Skipped { path, .. } => path,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, FileOutcome::Skipped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn fingerprint_ignores_capture_time_and_internal_fields() {
        let a = rec(json!({"tenderId": "X1", "title": "road", "scrapedAt": "2024-01-01T00:00:00", "_page": 3}));
        let b = rec(json!({"title": "road", "tenderId": "X1", "updated_at": "later", "created_at": "x"}));
        assert_eq!(normalize(&a), normalize(&b));
        assert_eq!(normalize(&a).fields().collect::<Vec<_>>(), vec!["tenderId", "title"]);
    }

    #[test]
    fn fingerprint_sees_content_changes() {
        let a = rec(json!({"tenderId": "X1", "budget": 100}));
        let b = rec(json!({"tenderId": "X1", "budget": 120}));
        assert_ne!(normalize(&a), normalize(&b));
    }

    #[test]
    fn custom_normalizer_uses_its_own_field_set() {
        let normalizer = Normalizer::new(["fetched"], "");
        let a = rec(json!({"fetched": 1, "_keep": true}));
        let b = rec(json!({"fetched": 2, "_keep": true}));
        assert_eq!(normalizer.fingerprint(&a), normalizer.fingerprint(&b));
        assert!(normalizer.fingerprint(&a).get("_keep").is_some());
    }

    #[test]
    fn temporal_key_parses_iso_and_zulu() {
        let zulu = temporal_key(&rec(json!({"scrapedAt": "2024-03-01T08:00:00Z"})));
        let offset = temporal_key(&rec(json!({"scrapedAt": "2024-03-01T16:00:00+08:00"})));
        assert_eq!(zulu.priority(), 0);
        assert_eq!(zulu, offset);

        let naive = temporal_key(&rec(json!({"scraped_at": "2024-03-01T08:00:00.123456"})));
        assert_eq!(naive.priority(), 0);
        assert!(zulu < naive);
    }

    #[test]
    fn timestamps_with_space_offset_or_basic_form_parse() {
        let expected = parse_timestamp("2024-03-01T00:00:00Z").expect("ts");
        assert_eq!(parse_timestamp("2024-03-01 08:00+08:00"), Some(expected));
        assert_eq!(parse_timestamp("20240301T000000"), Some(expected));
        assert_eq!(parse_timestamp("20240301T080000+08:00"), Some(expected));
        assert_eq!(parse_timestamp("20240301T000000Z"), Some(expected));
    }

    #[test]
    fn temporal_key_precedence_and_fallbacks() {
        let key = temporal_key(&rec(json!({
            "createdAt": "2020-01-01T00:00:00",
            "scrapedAt": "2024-01-01T00:00:00",
        })));
        assert_eq!(key, TemporalKey::Parsed(parse_timestamp("2024-01-01T00:00:00").expect("ts")));

        let skipped_empty = temporal_key(&rec(json!({"scrapedAt": "", "created_at": "2021-05-05"})));
        assert_eq!(skipped_empty.priority(), 0);

        let unparsed = temporal_key(&rec(json!({"scrapedAt": "yesterday"})));
        assert_eq!(unparsed, TemporalKey::Unparsed("yesterday".into()));

        let numeric = temporal_key(&rec(json!({"scrape_time": 1700000000})));
        assert_eq!(numeric, TemporalKey::Unparsed("1700000000".into()));

        assert_eq!(temporal_key(&rec(json!({"title": "x"}))), TemporalKey::Missing);
    }

    #[test]
    fn temporal_keys_order_by_priority_then_value() {
        let mut keys = vec![
            TemporalKey::Missing,
            TemporalKey::Unparsed("b".into()),
            TemporalKey::Parsed(parse_timestamp("2024-02-01T00:00:00Z").expect("ts")),
            TemporalKey::Unparsed("a".into()),
            TemporalKey::Parsed(parse_timestamp("2024-01-01T00:00:00Z").expect("ts")),
        ];
        keys.sort();
        assert_eq!(
            keys.iter().map(TemporalKey::priority).collect::<Vec<_>>(),
            vec![0, 0, 1, 1, 2]
        );
        assert_eq!(keys[2], TemporalKey::Unparsed("a".into()));
        assert!(keys[0] < keys[1]);
    }

    #[test]
    fn civil_calendar_accepts_three_delimiters() {
        let cal = CivilCalendar::default();
        let expected = NaiveDate::from_ymd_opt(2025, 12, 13);
        assert_eq!(cal.parse("114/12/13"), expected);
        assert_eq!(cal.parse("114.12.13"), expected);
        assert_eq!(cal.parse(" 114-12-13 17:00 "), expected);
        assert_eq!(cal.parse("114/2/30"), None);
        assert_eq!(cal.parse("2025/12/13"), None);
        assert_eq!(cal.format(NaiveDate::from_ymd_opt(2025, 1, 5).expect("date")), "114/01/05");
    }

    #[test]
    fn civil_calendar_offset_is_configurable() {
        let cal = CivilCalendar::new(2000);
        assert_eq!(cal.parse("024/06/01"), NaiveDate::from_ymd_opt(2024, 6, 1));
    }

    #[test]
    fn civil_calendar_rejects_offsets_that_overflow() {
        let cal = CivilCalendar::new(i32::MAX);
        assert_eq!(cal.parse("114/12/15"), None);
        let reference = NaiveDate::from_ymd_opt(2025, 12, 1).expect("date");
        assert!(!cal.is_expired(Some(&json!("114/12/15")), reference));
    }

    #[test]
    fn expiry_fails_open() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).expect("date");
        assert!(!is_expired(Some(&json!("")), today));
        assert!(!is_expired(None, today));
        assert!(!is_expired(Some(&Value::Null), today));
        assert!(!is_expired(Some(&json!("not-a-date")), today));
        assert!(!is_expired(Some(&json!(20240101)), today));
    }

    #[test]
    fn expiry_is_strictly_before_reference() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).expect("date");
        assert!(is_expired(Some(&json!("114/05/31")), today));
        assert!(!is_expired(Some(&json!("114/06/01")), today));
        assert!(!is_expired(Some(&json!("114/06/02")), today));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = rec(json!({"b": 1, "a": {"z": 1, "y": [{"d": 1, "c": 2}]}}));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[{"c":2,"d":1}],"z":1},"b":1}"#);
    }

    #[test]
    fn value_key_keeps_types_apart() {
        assert_ne!(value_key(&json!("7")), value_key(&json!(7)));
        assert_eq!(value_key(&json!("X1")), value_key(&json!("X1")));
    }

    #[test]
    fn file_outcome_serializes_with_status_tag() {
        let outcome = FileOutcome::Skipped {
            path: PathBuf::from("a.json"),
            reason: SkipReason::MalformedJson("eof".into()),
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["status"], "skipped");
        assert_eq!(value["reason"]["kind"], "malformed_json");
        assert!(outcome.is_skipped());
        assert_eq!(outcome.path(), Path::new("a.json"));
    }
}
