use chrono::{DateTime, Utc};

/// Protocol-independent position report produced by the decoders.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    /// Tracker identifier as transmitted by the device
    pub uid: String,
    /// Time the coordinates were captured by the receiver (UTC)
    pub time: DateTime<Utc>,
    /// Latitude in degrees (WGS84)
    pub latitude: f64,
    /// Longitude in degrees (WGS84)
    pub longitude: f64,
    /// Speed in km/h
    pub speed: u32,
    /// Course in degrees (0-359)
    pub course: u32,
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            uid: String::new(),
            time: DateTime::UNIX_EPOCH,
            latitude: 0.0,
            longitude: 0.0,
            speed: 0,
            course: 0,
        }
    }
}

impl GpsFix {
    /// A default-constructed fix is the placeholder the broadcasters start
    /// with; consumers must not forward it.
    pub fn is_empty(&self) -> bool {
        self.uid.is_empty()
            && self.time == DateTime::UNIX_EPOCH
            && self.latitude == 0.0
            && self.longitude == 0.0
            && self.speed == 0
            && self.course == 0
    }
}

/// A public transport route with its identifiers in the external mapping
/// systems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub number: String,
    pub yandex_number: String,
    pub two_gis_number: String,
}

/// Vehicle kind, as classified in the vehicle reference file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleType {
    Bus,
    Trolleybus,
    Tramway,
    Minibus,
}

impl VehicleType {
    /// Parse a reference-file value, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "bus" => Some(VehicleType::Bus),
            "trolleybus" => Some(VehicleType::Trolleybus),
            "tramway" => Some(VehicleType::Tramway),
            "minibus" => Some(VehicleType::Minibus),
            _ => None,
        }
    }
}

/// A tracked vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vehicle {
    /// Identifier the trackers use (join key for incoming fixes)
    pub guid: String,
    /// Registration plate (join key to the schedule)
    pub state_number: String,
    pub kind: VehicleType,
}

/// One duty interval: a vehicle serving a route between two instants,
/// bounds inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub route_number: String,
    pub state_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

/// The joined view published for every successfully correlated fix.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSnapshot {
    pub route: Route,
    pub vehicle: Vehicle,
    pub location: GpsFix,
    pub schedule: ScheduleEntry,
}
