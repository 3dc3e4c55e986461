//! Schedule reference store.
//!
//! File format, one duty interval per line:
//! `routeNumber;vehicleStateNumber;fromDateTime;toDateTime` with datetimes
//! as `DD/MM/YYYYThh:mm:ssZ±hh:mm`.
//!
//! Entries are grouped per state number and kept sorted by their start
//! instant; lookups scan for the first interval containing the queried
//! time, bounds inclusive. Intervals for one state number are assumed not
//! to overlap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::snapshot::SnapshotMap;
use super::{read_records, watch_and_reload, ReloadError, StoreError};
use crate::models::ScheduleEntry;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<route>[^;]*);(?P<transport>[^;]*);(?P<begin>[^;]+);(?P<end>[^;]+)")
        .expect("valid schedule pattern")
});

const DATETIME_FORMAT: &str = "%d/%m/%YT%H:%M:%SZ%:z";

pub struct ScheduleStore {
    file: PathBuf,
    data: SnapshotMap<String, Vec<ScheduleEntry>>,
}

impl ScheduleStore {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            data: SnapshotMap::new(),
        }
    }

    /// The entry covering `at` for this state number, bounds inclusive.
    pub fn current_for(&self, state_number: &str, at: DateTime<Utc>) -> Result<ScheduleEntry, StoreError> {
        let entries = self.data.get(state_number).ok_or(StoreError::NotFound)?;
        entries
            .into_iter()
            .find(|entry| entry.valid_from <= at && at <= entry.valid_to)
            .ok_or(StoreError::NotFound)
    }

    pub fn replace(&self, entries: Vec<ScheduleEntry>) {
        let mut data: HashMap<String, Vec<ScheduleEntry>> = HashMap::with_capacity(entries.len());
        for entry in entries {
            data.entry(entry.state_number.clone()).or_default().push(entry);
        }
        for entries in data.values_mut() {
            entries.sort_by_key(|entry| entry.valid_from);
        }
        self.data.replace(data);
    }

    /// Load the file now and on every change, until cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), notify::Error> {
        watch_and_reload(&self.file, &token, || self.reload()).await
    }

    fn reload(&self) {
        match self.read_file() {
            Ok(entries) => self.replace(entries),
            Err(err) => {
                error!(file = %self.file.display(), error = %err, "load schedule datasource");
            }
        }
    }

    fn read_file(&self) -> Result<Vec<ScheduleEntry>, ReloadError> {
        read_records(&self.file, parse_record)
    }
}

fn parse_record(record: &str) -> Result<ScheduleEntry, String> {
    let caps = PATTERN
        .captures(record)
        .ok_or_else(|| "record does not match `route;transport;begin;end`".to_string())?;
    Ok(ScheduleEntry {
        route_number: caps["route"].to_string(),
        state_number: caps["transport"].to_string(),
        valid_from: parse_datetime(&caps["begin"]).map_err(|e| format!("invalid begin datetime: {e}"))?,
        valid_to: parse_datetime(&caps["end"]).map_err(|e| format!("invalid end datetime: {e}"))?,
    })
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_str(value, DATETIME_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("value `{value}` is not in format `{DATETIME_FORMAT}`"))
}
