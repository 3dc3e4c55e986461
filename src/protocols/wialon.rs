//! WialonIPS text protocol decoder.
//!
//! Trackers speak a newline-delimited ASCII protocol: a login message
//! `#L#<uid>;...` once per connection, then one `#D#...` data message per
//! fix. Coordinates arrive as degrees-and-minutes (`DDDMM.MMMM`) and are
//! converted to decimal WGS84 degrees here.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::error;

/// Login message: `#L#<uid>;` with anything after the semicolon ignored.
static PATTERN_LOGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#L#(?P<uid>\w+);").expect("valid login pattern"));

/// Data message: `#D#<date>;<time>;<lat>;<N|S>;<lon>;<E|W>;<speed>;<course>;<alt>;<sats>`
/// with trailing fields ignored.
static PATTERN_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"#D#(?P<date>\d+);(?P<time>\d+);(?P<lat>\d+\.\d+);(?P<lat_dir>\w+);(?P<lon>\d+\.\d+);(?P<lon_dir>\w+);(?P<speed>\d+);(?P<course>\d+);(?P<alt>\d+\.\d+);(?P<sats>\d+)",
    )
    .expect("valid data pattern")
});

/// Timestamp layout in data messages: DDMMYY + HHMMSS, UTC.
const LAYOUT_TIME: &str = "%d%m%y%H%M%S";

#[derive(Debug, Error)]
pub enum WialonError {
    #[error("Malformed login message: {0:?}")]
    Format(String),
    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),
}

/// A coordinate as transmitted on the wire: degrees and minutes packed into
/// one decimal number (`DDDMM.MMMM`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate(pub f64);

impl Coordinate {
    /// Convert to decimal WGS84 degrees, rounded to six decimal places.
    pub fn to_wgs84(self) -> f64 {
        let degrees = (self.0 / 100.0).trunc();
        let minutes = self.0 - degrees * 100.0;
        degrees + (minutes / 60.0 * 1e6).round() / 1e6
    }
}

/// One parsed data message, coordinates still in wire format.
#[derive(Debug, Clone, PartialEq)]
struct DataRecord {
    time: DateTime<Utc>,
    latitude: Coordinate,
    longitude: Coordinate,
    speed: u32,
    course: u32,
}

/// A decoded fix, coordinates converted to WGS84.
#[derive(Debug, Clone, PartialEq)]
pub struct WialonFix {
    pub uid: String,
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: u32,
    pub course: u32,
}

/// Pull-based decoder over one connection's byte stream. Construction
/// consumes the login message; a stream that does not start with one is not
/// a WialonIPS stream and the decoder cannot be built.
pub struct WialonDecoder<R> {
    reader: LineReader<R>,
    uid: String,
}

impl<R: AsyncRead + Unpin> WialonDecoder<R> {
    pub async fn new(reader: R) -> Result<Self, WialonError> {
        let mut reader = LineReader::new(reader);
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(WialonError::Format(String::new())),
            Err(err) => return Err(WialonError::Io(err)),
        };
        let uid = parse_login(&line).ok_or(WialonError::Format(line))?;
        Ok(Self { reader, uid })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Next valid fix from the stream. Malformed data messages and the
    /// known lat=90/lon=0 device artifact are skipped. Returns `None` on
    /// end of stream, or on a read error (logged, not propagated — the
    /// connection just ends).
    pub async fn next(&mut self) -> Option<WialonFix> {
        loop {
            let line = match self.reader.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => {
                    error!(uid = %self.uid, error = %err, "wialon data read");
                    return None;
                }
            };

            let Some(record) = parse_data(&line) else {
                continue;
            };

            // Some devices emit a bogus 90/0 position while acquiring a
            // satellite lock; the raw wire values identify it.
            if record.latitude.0.trunc() as i64 == 90 && record.longitude.0.trunc() as i64 == 0 {
                continue;
            }

            return Some(WialonFix {
                uid: self.uid.clone(),
                time: record.time,
                latitude: record.latitude.to_wgs84(),
                longitude: record.longitude.to_wgs84(),
                speed: record.speed,
                course: record.course,
            });
        }
    }
}

fn parse_login(line: &str) -> Option<String> {
    let caps = PATTERN_LOGIN.captures(line)?;
    Some(caps["uid"].to_string())
}

fn parse_data(line: &str) -> Option<DataRecord> {
    let caps = PATTERN_DATA.captures(line)?;

    let time =
        NaiveDateTime::parse_from_str(&format!("{}{}", &caps["date"], &caps["time"]), LAYOUT_TIME)
            .ok()?
            .and_utc();

    // The pattern only admits digit runs; out-of-range values fall back to
    // zero rather than killing the stream.
    Some(DataRecord {
        time,
        latitude: Coordinate(caps["lat"].parse().unwrap_or_default()),
        longitude: Coordinate(caps["lon"].parse().unwrap_or_default()),
        speed: caps["speed"].parse().unwrap_or_default(),
        course: caps["course"].parse().unwrap_or_default(),
    })
}

/// Newline-delimited reads that tolerate arbitrary (non-UTF-8) tracker
/// garbage between valid messages.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// One line without its trailing newline; `None` at end of stream. A
    /// final line without a newline is still returned.
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_to_wgs84() {
        assert_eq!(Coordinate(5844.6826).to_wgs84(), 58.74471);
        assert_eq!(Coordinate(5010.7126).to_wgs84(), 50.178543);
    }

    #[test]
    fn test_parse_login() {
        assert_eq!(
            parse_login("#L#353173067939817;NA"),
            Some("353173067939817".to_string())
        );
        assert_eq!(parse_login("#L353173067939817;NA"), None);
    }

    #[test]
    fn test_parse_data() {
        let record = parse_data(
            "#D#060521;081606;5844.6826;N;05010.7126;E;8;131;113.000000;15;7.000000;3;NA;NA;;SOS:1:1",
        )
        .unwrap();
        assert_eq!(record.time, Utc.with_ymd_and_hms(2021, 5, 6, 8, 16, 6).unwrap());
        assert_eq!(record.latitude, Coordinate(5844.6826));
        assert_eq!(record.longitude, Coordinate(5010.7126));
        assert_eq!(record.speed, 8);
        assert_eq!(record.course, 131);
    }

    #[test]
    fn test_parse_data_rejects_malformed() {
        assert!(parse_data("#D#06rrr0521;081606;5844.6826;N;05010.7126;E;8;131;1.0;15").is_none());
        assert!(parse_data("#L#353173067939817;NA").is_none());
        assert!(parse_data("").is_none());
    }

    #[tokio::test]
    async fn test_decoder_rejects_bad_login() {
        let source = b"#L353173067939817;NA\n" as &[u8];
        assert!(matches!(
            WialonDecoder::new(source).await,
            Err(WialonError::Format(_))
        ));
    }

    #[tokio::test]
    async fn test_decoder_skips_invalid_records() {
        let source = concat!(
            "#L#353173067939817;NA\n",
            "#D#060521;081606;5844.6826;N;05010.7126;E;8;131;113.000000;15;7.000000;3;NA;NA;;SOS:1:1\n",
            "#D#06rrr0521;081606;5844.6826;N;05010.7126;E;8;131;113.000000;15;7.000000;3;NA;NA;;SOS:1:1\n",
            "#D#060521;081606;90.0;N;0.0;E;8;131;113.000000;15;7.000000;3;NA;NA;;SOS:1:1\n",
            "\n",
            "#L#0eee60521;081606;5844.6826;N;05010.7126;E;8;131;113.000000;15\n",
            "\n",
            "#D#060521;081606;5844.6826;N;05010.7126;E;24;131;113.000000;15;7.000000;3;NA;NA;;SOS:1:1\n",
        )
        .as_bytes();

        let mut decoder = WialonDecoder::new(source).await.unwrap();
        assert_eq!(decoder.uid(), "353173067939817");

        let first = decoder.next().await.unwrap();
        assert_eq!(first.uid, "353173067939817");
        assert_eq!(first.time, Utc.with_ymd_and_hms(2021, 5, 6, 8, 16, 6).unwrap());
        assert_eq!(first.latitude, 58.74471);
        assert_eq!(first.longitude, 50.178543);
        assert_eq!(first.speed, 8);

        let second = decoder.next().await.unwrap();
        assert_eq!(second.speed, 24);

        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn test_decoder_returns_final_unterminated_line() {
        let source = concat!(
            "#L#42;NA\n",
            "#D#060521;081606;5844.6826;N;05010.7126;E;8;131;113.000000;15",
        )
        .as_bytes();

        let mut decoder = WialonDecoder::new(source).await.unwrap();
        assert!(decoder.next().await.is_some());
        assert!(decoder.next().await.is_none());
    }
}
