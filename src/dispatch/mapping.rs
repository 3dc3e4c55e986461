//! Batching sender for external mapping services.
//!
//! Accumulates snapshots from the tracking feed into windows (50 items or
//! 5 seconds, whichever first) and POSTs each non-empty window as an XML
//! payload, optionally gzip-compressed. Delivery is best-effort: a failed
//! window is logged and never retried.

use std::io::Write;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::{MappingConfig, RouteNumberSource};
use crate::models::{TrackingSnapshot, VehicleType};

const WINDOW_SIZE: usize = 50;
const WINDOW_TIMEOUT: Duration = Duration::from_secs(5);

/// Timestamp format the mapping services expect: DDMMYYYY:hhmmss, UTC.
const TRACK_TIME_FORMAT: &str = "%d%m%Y:%H%M%S";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Status(u16),
    #[error("Marshal to xml: {0}")]
    Xml(String),
    #[error("Compress payload: {0}")]
    Compress(#[from] std::io::Error),
}

pub struct MappingSender {
    client: Client,
    name: String,
    client_id: String,
    url: String,
    compressed: bool,
    route_source: RouteNumberSource,
}

impl MappingSender {
    pub fn new(config: &MappingConfig) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            name: config.name.clone(),
            client_id: config.client_id.clone(),
            url: config.url.clone(),
            compressed: config.compressed,
            route_source: config.route_number,
        })
    }

    /// Collect and send windows until cancelled.
    pub async fn run(
        &self,
        mut rx: watch::Receiver<Option<TrackingSnapshot>>,
        token: CancellationToken,
    ) {
        while !token.is_cancelled() {
            let window = collect_window(&mut rx, WINDOW_SIZE, WINDOW_TIMEOUT, &token).await;
            if window.is_empty() {
                if rx.has_changed().is_err() {
                    // Feed is gone; nothing more will ever arrive.
                    return;
                }
                continue;
            }
            if let Err(err) = self.send(&window).await {
                error!(service = %self.name, error = %err, "send tracks to mapping service");
            }
        }
    }

    async fn send(&self, snapshots: &[TrackingSnapshot]) -> Result<(), DispatchError> {
        let xml = build_payload(&self.client_id, self.route_source, snapshots)?;

        let request = if self.compressed {
            let compressed = gzip(xml.as_bytes())?;
            let form = reqwest::multipart::Form::new()
                .text("compressed", "1")
                .part("data", reqwest::multipart::Part::bytes(compressed));
            self.client.post(&self.url).multipart(form)
        } else {
            let body = format!("compressed=0&data={}", urlencoding::encode(&xml));
            self.client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body)
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DispatchError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Accumulate snapshots until `size` items are collected or `timeout`
/// elapses since the window started. An expired empty window comes back
/// empty; the caller starts the next one immediately.
async fn collect_window(
    rx: &mut watch::Receiver<Option<TrackingSnapshot>>,
    size: usize,
    timeout: Duration,
    token: &CancellationToken,
) -> Vec<TrackingSnapshot> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut window = Vec::with_capacity(size);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(snapshot) = rx.borrow_and_update().clone() else {
                    continue;
                };
                window.push(snapshot);
                if window.len() >= size {
                    break;
                }
            }
        }
    }

    window
}

#[derive(Debug, Serialize)]
#[serde(rename = "tracks")]
struct TracksPayload<'a> {
    #[serde(rename = "@clid")]
    clid: &'a str,
    #[serde(rename = "track")]
    tracks: Vec<Track>,
}

#[derive(Debug, Serialize)]
struct Track {
    /// Vehicle identifier, stable across updates
    #[serde(rename = "@uuid")]
    uuid: String,
    /// GPS signal category; public transport tracks are "normal"
    #[serde(rename = "@category")]
    category: &'static str,
    #[serde(rename = "@route")]
    route: String,
    #[serde(rename = "@vehicle_type")]
    vehicle_type: &'static str,
    point: TrackPoint,
}

#[derive(Debug, Serialize)]
struct TrackPoint {
    #[serde(rename = "@latitude")]
    latitude: f64,
    #[serde(rename = "@longitude")]
    longitude: f64,
    #[serde(rename = "@avg_speed")]
    avg_speed: u32,
    #[serde(rename = "@direction")]
    direction: u32,
    #[serde(rename = "@time")]
    time: String,
}

/// Vehicle-type codes of the mapping services' track protocol.
fn vehicle_type_code(kind: VehicleType) -> &'static str {
    match kind {
        VehicleType::Bus => "bus",
        VehicleType::Trolleybus => "trolleybus",
        VehicleType::Tramway => "tramway",
        VehicleType::Minibus => "minibus",
    }
}

fn build_payload(
    clid: &str,
    route_source: RouteNumberSource,
    snapshots: &[TrackingSnapshot],
) -> Result<String, DispatchError> {
    let tracks = snapshots
        .iter()
        .map(|snapshot| Track {
            uuid: snapshot.vehicle.state_number.clone(),
            category: "n",
            route: match route_source {
                RouteNumberSource::Yandex => snapshot.route.yandex_number.clone(),
                RouteNumberSource::TwoGis => snapshot.route.two_gis_number.clone(),
            },
            vehicle_type: vehicle_type_code(snapshot.vehicle.kind),
            point: TrackPoint {
                latitude: snapshot.location.latitude,
                longitude: snapshot.location.longitude,
                avg_speed: snapshot.location.speed,
                direction: snapshot.location.course,
                time: snapshot.location.time.format(TRACK_TIME_FORMAT).to_string(),
            },
        })
        .collect();

    let payload = TracksPayload { clid, tracks };
    quick_xml::se::to_string(&payload).map_err(|err| DispatchError::Xml(err.to_string()))
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GpsFix, Route, ScheduleEntry, Vehicle};
    use chrono::{TimeZone, Utc};

    fn snapshot(speed: u32) -> TrackingSnapshot {
        TrackingSnapshot {
            route: Route {
                number: "R1".to_string(),
                yandex_number: "21А".to_string(),
                two_gis_number: "21".to_string(),
            },
            vehicle: Vehicle {
                guid: "V1".to_string(),
                state_number: "S1".to_string(),
                kind: VehicleType::Bus,
            },
            location: GpsFix {
                uid: "V1".to_string(),
                time: Utc.with_ymd_and_hms(2009, 1, 10, 14, 20, 45).unwrap(),
                latitude: 55.75363,
                longitude: 37.62007,
                speed,
                course: 242,
            },
            schedule: ScheduleEntry {
                route_number: "R1".to_string(),
                state_number: "S1".to_string(),
                valid_from: Utc.with_ymd_and_hms(2009, 1, 10, 0, 0, 0).unwrap(),
                valid_to: Utc.with_ymd_and_hms(2009, 1, 10, 23, 59, 59).unwrap(),
            },
        }
    }

    #[test]
    fn test_build_payload() {
        let xml = build_payload("client-1", RouteNumberSource::Yandex, &[snapshot(53)]).unwrap();
        assert!(xml.starts_with("<tracks clid=\"client-1\">"));
        assert!(xml.contains("uuid=\"S1\""));
        assert!(xml.contains("category=\"n\""));
        assert!(xml.contains("route=\"21А\""));
        assert!(xml.contains("vehicle_type=\"bus\""));
        assert!(xml.contains("avg_speed=\"53\""));
        assert!(xml.contains("direction=\"242\""));
        assert!(xml.contains("time=\"10012009:142045\""));
    }

    #[test]
    fn test_build_payload_two_gis_route_number() {
        let xml = build_payload("client-1", RouteNumberSource::TwoGis, &[snapshot(10)]).unwrap();
        assert!(xml.contains("route=\"21\""));
    }

    #[test]
    fn test_gzip_roundtrip() {
        let payload = b"<tracks clid=\"x\"/>";
        let compressed = gzip(payload).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut decompressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_window_splits_on_size() {
        let (tx, mut rx) = watch::channel(None);
        let token = CancellationToken::new();

        let collector = tokio::spawn(async move {
            let first = collect_window(&mut rx, WINDOW_SIZE, WINDOW_TIMEOUT, &token).await;
            let second = collect_window(&mut rx, WINDOW_SIZE, WINDOW_TIMEOUT, &token).await;
            (first, second)
        });

        // A burst of 60 snapshots, yielding so the collector keeps up with
        // every value.
        for i in 0..60u32 {
            tx.send_replace(Some(snapshot(i)));
            tokio::task::yield_now().await;
        }

        let (first, second) = collector.await.unwrap();
        assert_eq!(first.len(), 50);
        assert_eq!(first[0].location.speed, 0);
        assert_eq!(first[49].location.speed, 49);
        assert_eq!(second.len(), 10);
        assert_eq!(second[9].location.speed, 59);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_window_expires_empty() {
        let (tx, mut rx) = watch::channel(None);
        let token = CancellationToken::new();

        let window = collect_window(&mut rx, WINDOW_SIZE, WINDOW_TIMEOUT, &token).await;
        assert!(window.is_empty());
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_window_splits_on_timeout() {
        let (tx, mut rx) = watch::channel(None);
        let token = CancellationToken::new();

        tx.send_replace(Some(snapshot(1)));
        let window = collect_window(&mut rx, WINDOW_SIZE, WINDOW_TIMEOUT, &token).await;
        assert_eq!(window.len(), 1);
        drop(tx);
    }
}
