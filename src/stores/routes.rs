//! Route reference store.
//!
//! File format, one route per line:
//! `internalNumber;yandexNumber;twoGisNumber`

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::snapshot::SnapshotMap;
use super::{read_records, watch_and_reload, ReloadError, StoreError};
use crate::models::Route;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<internal>[^;]*);(?P<yandex>[^;]*);(?P<two_gis>[^;]*)")
        .expect("valid route pattern")
});

pub struct RouteStore {
    file: PathBuf,
    data: SnapshotMap<String, Route>,
}

impl RouteStore {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            data: SnapshotMap::new(),
        }
    }

    pub fn get(&self, number: &str) -> Result<Route, StoreError> {
        self.data.get(number).ok_or(StoreError::NotFound)
    }

    pub fn replace(&self, routes: Vec<Route>) {
        let mut data = HashMap::with_capacity(routes.len());
        for route in routes {
            data.insert(route.number.clone(), route);
        }
        self.data.replace(data);
    }

    /// Load the file now and on every change, until cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), notify::Error> {
        watch_and_reload(&self.file, &token, || self.reload()).await
    }

    fn reload(&self) {
        match self.read_file() {
            Ok(routes) => self.replace(routes),
            Err(err) => {
                error!(file = %self.file.display(), error = %err, "load route datasource");
            }
        }
    }

    fn read_file(&self) -> Result<Vec<Route>, ReloadError> {
        read_records(&self.file, parse_record)
    }
}

fn parse_record(record: &str) -> Result<Route, String> {
    let caps = PATTERN
        .captures(record)
        .ok_or_else(|| "record does not match `internal;yandex;two_gis`".to_string())?;
    Ok(Route {
        number: caps["internal"].to_string(),
        yandex_number: caps["yandex"].to_string(),
        two_gis_number: caps["two_gis"].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_record() {
        let route = parse_record("21;21А;route-21").unwrap();
        assert_eq!(route.number, "21");
        assert_eq!(route.yandex_number, "21А");
        assert_eq!(route.two_gis_number, "route-21");

        let empty_fields = parse_record(";;").unwrap();
        assert_eq!(empty_fields.number, "");

        assert!(parse_record("21;only-one-field").is_err());
    }

    #[test]
    fn test_failed_reload_keeps_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "21;21;21").unwrap();
        file.flush().unwrap();

        let store = RouteStore::new(file.path());
        store.reload();
        assert!(store.get("21").is_ok());

        // A malformed line aborts the reload entirely.
        writeln!(file, "broken").unwrap();
        file.flush().unwrap();
        store.reload();
        assert!(store.get("21").is_ok());
    }

    #[test]
    fn test_read_file_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "21;21;21\n\n  \n33;33;33\n").unwrap();
        file.flush().unwrap();

        let store = RouteStore::new(file.path());
        let routes = store.read_file().unwrap();
        assert_eq!(routes.len(), 2);
    }
}
