//! Vehicle reference store.
//!
//! File format, one vehicle per line:
//! `guid;stateNumber;type` with type one of bus/trolleybus/tramway/minibus
//! (case-insensitive).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::snapshot::SnapshotMap;
use super::{read_records, watch_and_reload, ReloadError, StoreError};
use crate::models::{Vehicle, VehicleType};

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<uid>[^;]*);(?P<state>[^;]*);(?P<type>[^;]*)").expect("valid vehicle pattern")
});

pub struct VehicleStore {
    file: PathBuf,
    data: SnapshotMap<String, Vehicle>,
}

impl VehicleStore {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            data: SnapshotMap::new(),
        }
    }

    pub fn get(&self, guid: &str) -> Result<Vehicle, StoreError> {
        self.data.get(guid).ok_or(StoreError::NotFound)
    }

    pub fn replace(&self, vehicles: Vec<Vehicle>) {
        let mut data = HashMap::with_capacity(vehicles.len());
        for vehicle in vehicles {
            data.insert(vehicle.guid.clone(), vehicle);
        }
        self.data.replace(data);
    }

    /// Load the file now and on every change, until cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), notify::Error> {
        watch_and_reload(&self.file, &token, || self.reload()).await
    }

    fn reload(&self) {
        match self.read_file() {
            Ok(vehicles) => self.replace(vehicles),
            Err(err) => {
                error!(file = %self.file.display(), error = %err, "load vehicle datasource");
            }
        }
    }

    fn read_file(&self) -> Result<Vec<Vehicle>, ReloadError> {
        read_records(&self.file, parse_record)
    }
}

fn parse_record(record: &str) -> Result<Vehicle, String> {
    let caps = PATTERN
        .captures(record)
        .ok_or_else(|| "record does not match `guid;state;type`".to_string())?;
    let kind = VehicleType::parse(&caps["type"])
        .ok_or_else(|| format!("unexpected vehicle type `{}`", &caps["type"]))?;
    Ok(Vehicle {
        guid: caps["uid"].to_string(),
        state_number: caps["state"].to_string(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_record() {
        let vehicle = parse_record("353173067939817;А123ВС43;bus").unwrap();
        assert_eq!(vehicle.guid, "353173067939817");
        assert_eq!(vehicle.state_number, "А123ВС43");
        assert_eq!(vehicle.kind, VehicleType::Bus);
    }

    #[test]
    fn test_parse_record_type_is_case_insensitive() {
        assert_eq!(parse_record("1;a;TROLLEYBUS").unwrap().kind, VehicleType::Trolleybus);
        assert_eq!(parse_record("1;a;Tramway").unwrap().kind, VehicleType::Tramway);
        assert_eq!(parse_record("1;a;minibus").unwrap().kind, VehicleType::Minibus);
    }

    #[test]
    fn test_parse_record_rejects_unknown_type() {
        assert!(parse_record("1;a;train").is_err());
        assert!(parse_record("1;a;").is_err());
    }

    #[test]
    fn test_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "guid-1;S1;bus").unwrap();
        writeln!(file, "guid-2;S2;tramway").unwrap();
        file.flush().unwrap();

        let store = VehicleStore::new(file.path());
        store.reload();
        assert_eq!(store.get("guid-2").unwrap().state_number, "S2");
        assert!(store.get("guid-3").is_err());
    }
}
