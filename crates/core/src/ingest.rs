//! Event table and CSV ingest.
//!
//! Malformed input is fatal: a missing required column, an empty id, or an
//! unparseable timestamp aborts the whole load.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::{debug, info};

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::types::{Attributes, EventRecord, FeatureUsage};

pub const USER_ID_COLUMN: &str = "user_id";
pub const EVENT_NAME_COLUMN: &str = "event_name";
pub const EVENT_TIMESTAMP_COLUMN: &str = "event_timestamp";

const FEATURE_NAME_COLUMN: &str = "feature_name";
const USAGE_TIMESTAMP_COLUMN: &str = "usage_timestamp";
const SIGNUP_DATE_COLUMN: &str = "signup_date";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// In-memory event log: the records plus the metadata columns they carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    columns: Vec<String>,
    events: Vec<EventRecord>,
}

impl EventTable {
    pub fn new(columns: Vec<String>, events: Vec<EventRecord>) -> Self {
        Self { columns, events }
    }

    /// Build a table whose metadata columns are the union of the records'
    /// attribute keys.
    pub fn from_events(events: Vec<EventRecord>) -> Self {
        let columns: BTreeSet<&String> = events.iter().flat_map(|e| e.attributes.keys()).collect();
        let columns = columns.into_iter().cloned().collect();
        Self { columns, events }
    }

    /// Read a CSV event log. `user_id`, `event_name` and `event_timestamp`
    /// are required; every other header becomes a metadata column.
    pub fn from_csv_reader<R: Read>(reader: R) -> AnalyticsResult<Self> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = reader.headers()?.clone();

        let user_idx = column_index(&headers, USER_ID_COLUMN)?;
        let name_idx = column_index(&headers, EVENT_NAME_COLUMN)?;
        let ts_idx = column_index(&headers, EVENT_TIMESTAMP_COLUMN)?;
        let metadata: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| ![user_idx, name_idx, ts_idx].contains(i))
            .map(|(i, h)| (i, h.to_string()))
            .collect();

        let mut events = Vec::new();
        for (i, result) in reader.records().enumerate() {
            let record = result?;
            // Header is line 1.
            let row = i + 2;
            let user_id = required_field(&record, user_idx, USER_ID_COLUMN, row)?;
            let event_name = required_field(&record, name_idx, EVENT_NAME_COLUMN, row)?;
            let raw_ts = record.get(ts_idx).unwrap_or_default();
            let event_timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
                AnalyticsError::InvalidTimestamp {
                    row,
                    column: EVENT_TIMESTAMP_COLUMN.into(),
                    value: raw_ts.to_string(),
                }
            })?;

            let attributes: Attributes = metadata
                .iter()
                .filter_map(|(idx, column)| {
                    record
                        .get(*idx)
                        .filter(|v| !v.is_empty())
                        .map(|v| (column.clone(), v.to_string()))
                })
                .collect();

            events.push(EventRecord {
                user_id,
                event_name,
                event_timestamp,
                attributes,
            });
        }

        let columns = metadata.into_iter().map(|(_, c)| c).collect();
        debug!(rows = events.len(), "Parsed event CSV");
        Ok(Self { columns, events })
    }

    pub fn load_csv(path: impl AsRef<Path>) -> AnalyticsResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let table = Self::from_csv_reader(BufReader::new(file))?;
        info!(
            path = %path.display(),
            events = table.len(),
            columns = ?table.columns,
            "Loaded event table"
        );
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Fail with `MissingColumn` for the first metadata column not present.
    pub fn require_columns<S: AsRef<str>>(&self, columns: &[S]) -> AnalyticsResult<()> {
        match columns.iter().find(|c| !self.has_column(c.as_ref())) {
            Some(missing) => Err(AnalyticsError::MissingColumn(missing.as_ref().to_string())),
            None => Ok(()),
        }
    }
}

/// Read a CSV of feature usage with `user_id`, `feature_name`,
/// `usage_timestamp` and `signup_date` columns.
pub fn read_feature_usage<R: Read>(reader: R) -> AnalyticsResult<Vec<FeatureUsage>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = reader.headers()?.clone();

    let user_idx = column_index(&headers, USER_ID_COLUMN)?;
    let feature_idx = column_index(&headers, FEATURE_NAME_COLUMN)?;
    let usage_idx = column_index(&headers, USAGE_TIMESTAMP_COLUMN)?;
    let signup_idx = column_index(&headers, SIGNUP_DATE_COLUMN)?;

    let mut usages = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let row = i + 2;
        usages.push(FeatureUsage {
            user_id: required_field(&record, user_idx, USER_ID_COLUMN, row)?,
            feature_name: required_field(&record, feature_idx, FEATURE_NAME_COLUMN, row)?,
            usage_timestamp: timestamp_field(&record, usage_idx, USAGE_TIMESTAMP_COLUMN, row)?,
            signup_date: timestamp_field(&record, signup_idx, SIGNUP_DATE_COLUMN, row)?,
        });
    }
    Ok(usages)
}

pub fn load_feature_usage(path: impl AsRef<Path>) -> AnalyticsResult<Vec<FeatureUsage>> {
    let path = path.as_ref();
    let usages = read_feature_usage(BufReader::new(File::open(path)?))?;
    info!(path = %path.display(), rows = usages.len(), "Loaded feature usage");
    Ok(usages)
}

/// Parse RFC 3339, `YYYY-mm-dd HH:MM[:SS[.f]]` (space or `T`), or a bare
/// date (midnight). Offsets are dropped after conversion to UTC.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn column_index(headers: &csv::StringRecord, column: &str) -> AnalyticsResult<usize> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| AnalyticsError::MissingColumn(column.to_string()))
}

fn required_field(
    record: &csv::StringRecord,
    idx: usize,
    column: &str,
    row: usize,
) -> AnalyticsResult<String> {
    match record.get(idx) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AnalyticsError::InvalidRecord {
            row,
            reason: format!("empty {column}"),
        }),
    }
}

fn timestamp_field(
    record: &csv::StringRecord,
    idx: usize,
    column: &str,
    row: usize,
) -> AnalyticsResult<NaiveDateTime> {
    let raw = record.get(idx).unwrap_or_default();
    parse_timestamp(raw).ok_or_else(|| AnalyticsError::InvalidTimestamp {
        row,
        column: column.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
user_id,event_name,event_timestamp,ab_group,plan_tier
u1,signup,2024-03-01 09:00:00,A,free
u1,activate,2024-03-01T10:30:00,A,
u2,signup,2024-03-02,B,pro
";

    #[test]
    fn test_read_csv_events() {
        let table = EventTable::from_csv_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.columns(), ["ab_group", "plan_tier"]);

        let first = &table.events()[0];
        assert_eq!(first.user_id, "u1");
        assert_eq!(first.attribute("plan_tier"), Some("free"));
        // Empty cells are absent, not empty strings.
        assert_eq!(table.events()[1].attribute("plan_tier"), None);
        assert_eq!(
            table.events()[2].event_timestamp,
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_missing_required_column() {
        let csv = "user_id,event_timestamp\nu1,2024-03-01\n";
        let err = EventTable::from_csv_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, AnalyticsError::MissingColumn(c) if c == "event_name"));
    }

    #[test]
    fn test_unparseable_timestamp_is_fatal() {
        let csv = "user_id,event_name,event_timestamp\nu1,signup,2024-03-01\nu2,signup,yesterday\n";
        let err = EventTable::from_csv_reader(csv.as_bytes()).unwrap_err();
        match err {
            AnalyticsError::InvalidTimestamp { row, value, .. } => {
                assert_eq!(row, 3);
                assert_eq!(value, "yesterday");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_user_id_is_fatal() {
        let csv = "user_id,event_name,event_timestamp\n,signup,2024-03-01\n";
        assert!(matches!(
            EventTable::from_csv_reader(csv.as_bytes()),
            Err(AnalyticsError::InvalidRecord { row: 2, .. })
        ));
    }

    #[test]
    fn test_require_columns() {
        let table = EventTable::from_csv_reader(SAMPLE.as_bytes()).unwrap();
        assert!(table.require_columns(&["ab_group"]).is_ok());
        assert!(matches!(
            table.require_columns(&["ab_group", "country"]),
            Err(AnalyticsError::MissingColumn(c)) if c == "country"
        ));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-03-01T09:00:00Z").is_some());
        assert!(parse_timestamp("2024-03-01T09:00:00+02:00").is_some());
        assert!(parse_timestamp("2024-03-01 09:00:00.250").is_some());
        assert!(parse_timestamp("2024-03-01 09:00").is_some());
        assert!(parse_timestamp("2024-03-01").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("03/01/2024").is_none());
    }

    #[test]
    fn test_from_events_infers_columns() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let table = EventTable::from_events(vec![
            EventRecord::new("u1", "signup", ts).with_attribute("plan_tier", "pro"),
            EventRecord::new("u2", "signup", ts).with_attribute("ab_group", "A"),
        ]);
        assert_eq!(table.columns(), ["ab_group", "plan_tier"]);
    }

    #[test]
    fn test_read_feature_usage() {
        let csv = "\
user_id,feature_name,usage_timestamp,signup_date
u1,export,2024-03-01 12:00:00,2024-03-01 00:00:00
";
        let usages = read_feature_usage(csv.as_bytes()).unwrap();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].hours_since_signup(), 12.0);
    }
}
