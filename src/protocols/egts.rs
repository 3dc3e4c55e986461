//! EGTS binary protocol decoder.
//!
//! Framed transport per the governmental telemetry standard (Mintransport
//! order no. 285): a fixed header prefix carrying the protocol marker and
//! length fields, a service frame of data records, and CRC trailers. Only
//! application-data packets carrying `EGTS_SR_POS_DATA` subrecords produce
//! fixes; everything else is read and discarded to stay on frame boundaries.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{error, warn};

/// First byte of every packet; anything else means the peer is not
/// speaking EGTS and the stream cannot be re-synchronized.
const PROTOCOL_MARKER: u8 = 0x01;
/// Fixed-size prefix read before the packet length is known.
const HEADER_PREFIX_LEN: usize = 10;
/// Header length including its checksum byte; route-info headers are not
/// used by the trackers this decoder serves.
const HEADER_LEN: u8 = 11;
/// EGTS_PT_APPDATA
const PT_APPDATA: u8 = 1;
/// EGTS_SR_POS_DATA
const SR_POS_DATA: u8 = 16;

/// Navigation timestamps count seconds from 2010-01-01 00:00:00 UTC.
fn egts_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).single().expect("valid epoch")
}

#[derive(Debug, Error)]
pub enum EgtsDecodeError {
    #[error("Unsupported header length {0}")]
    HeaderLength(u8),
    #[error("Header checksum mismatch")]
    HeaderCrc,
    #[error("Frame checksum mismatch")]
    FrameCrc,
    #[error("Truncated packet body")]
    Truncated,
}

/// One position extracted from an application-data record.
#[derive(Debug, Clone, PartialEq)]
pub struct EgtsFix {
    pub object_id: u32,
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: u32,
    pub course: u32,
}

/// Pull-based decoder over one connection's byte stream.
pub struct EgtsDecoder<R> {
    reader: BufReader<R>,
    /// Trackers may elide the object id on consecutive records; the last
    /// one seen on this stream fills the gap.
    last_object_id: u32,
    /// Fixes decoded from the current packet, drained before the next read.
    pending: std::collections::VecDeque<EgtsFix>,
}

impl<R: AsyncRead + Unpin> EgtsDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            last_object_id: 0,
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Next fix from the stream. Packets that fail to decode are skipped;
    /// a stream that does not frame as EGTS at all is abandoned. Returns
    /// `None` on end of stream or read error.
    pub async fn next(&mut self) -> Option<EgtsFix> {
        loop {
            if let Some(fix) = self.pending.pop_front() {
                return Some(fix);
            }

            let mut header = [0u8; HEADER_PREFIX_LEN];
            if let Err(err) = self.reader.read_exact(&mut header).await {
                if err.kind() != std::io::ErrorKind::UnexpectedEof {
                    error!(error = %err, "egts header read");
                }
                return None;
            }

            if header[0] != PROTOCOL_MARKER {
                warn!(marker = header[0], "stream does not frame as EGTS, closing connection");
                return None;
            }

            // Total length = header length + frame data + 2 bytes of frame
            // CRC when a frame is present, else just the header.
            let frame_len = u16::from_le_bytes([header[5], header[6]]) as usize;
            let header_len = header[3] as usize;
            let total = if frame_len > 0 {
                header_len + frame_len + 2
            } else {
                header_len
            };
            if total < HEADER_PREFIX_LEN {
                warn!(total, "egts packet length shorter than its header, closing connection");
                return None;
            }

            let mut packet = vec![0u8; total];
            packet[..HEADER_PREFIX_LEN].copy_from_slice(&header);
            if let Err(err) = self.reader.read_exact(&mut packet[HEADER_PREFIX_LEN..]).await {
                error!(error = %err, "egts body read");
                return None;
            }

            match decode_packet(&packet, &mut self.last_object_id) {
                Ok(fixes) => self.pending.extend(fixes),
                Err(err) => {
                    error!(error = %err, "decoding egts packet");
                }
            }
        }
    }
}

/// Decode one complete packet. Non-application packets decode to no fixes.
/// The caller's `last_object_id` provides and receives the record
/// continuation id.
fn decode_packet(data: &[u8], last_object_id: &mut u32) -> Result<Vec<EgtsFix>, EgtsDecodeError> {
    let header_len = data[3];
    if header_len != HEADER_LEN || (header_len as usize) > data.len() {
        return Err(EgtsDecodeError::HeaderLength(header_len));
    }
    let header_len = header_len as usize;
    if crc8(&data[..header_len - 1]) != data[header_len - 1] {
        return Err(EgtsDecodeError::HeaderCrc);
    }

    if data[9] != PT_APPDATA {
        return Ok(Vec::new());
    }

    let frame_len = u16::from_le_bytes([data[5], data[6]]) as usize;
    if frame_len == 0 {
        return Ok(Vec::new());
    }
    if data.len() < header_len + frame_len + 2 {
        return Err(EgtsDecodeError::Truncated);
    }
    let frame = &data[header_len..header_len + frame_len];
    let stored = u16::from_le_bytes([data[header_len + frame_len], data[header_len + frame_len + 1]]);
    if crc16(frame) != stored {
        return Err(EgtsDecodeError::FrameCrc);
    }

    decode_service_frame(frame, last_object_id)
}

/// Walk the service data records of an application-data frame, yielding one
/// fix per record that carries a position subrecord.
fn decode_service_frame(
    frame: &[u8],
    last_object_id: &mut u32,
) -> Result<Vec<EgtsFix>, EgtsDecodeError> {
    const OBFE: u8 = 0x01;
    const EVFE: u8 = 0x02;
    const TMFE: u8 = 0x04;

    let mut cursor = Cursor::new(frame);
    let mut fixes = Vec::new();

    while cursor.remaining() > 0 {
        let record_len = cursor.u16_le()? as usize;
        let _record_number = cursor.u16_le()?;
        let flags = cursor.u8()?;

        if flags & OBFE != 0 {
            *last_object_id = cursor.u32_le()?;
        }
        if flags & EVFE != 0 {
            cursor.skip(4)?;
        }
        if flags & TMFE != 0 {
            cursor.skip(4)?;
        }

        let _source_service = cursor.u8()?;
        let _recipient_service = cursor.u8()?;

        let mut record = Cursor::new(cursor.bytes(record_len)?);
        while record.remaining() > 0 {
            let subrecord_type = record.u8()?;
            let subrecord_len = record.u16_le()? as usize;
            let subrecord = record.bytes(subrecord_len)?;
            if subrecord_type == SR_POS_DATA {
                fixes.push(decode_pos_data(subrecord, *last_object_id)?);
                break;
            }
        }
    }

    Ok(fixes)
}

/// EGTS_SR_POS_DATA: navigation time, packed coordinates, speed/course.
fn decode_pos_data(data: &[u8], object_id: u32) -> Result<EgtsFix, EgtsDecodeError> {
    const LAHS: u8 = 0x20;
    const LOHS: u8 = 0x40;
    const DIRH: u8 = 0x80;

    let mut cursor = Cursor::new(data);
    let navigation_time = cursor.u32_le()?;
    let raw_latitude = cursor.u32_le()?;
    let raw_longitude = cursor.u32_le()?;
    let flags = cursor.u8()?;
    let speed_low = cursor.u8()?;
    let speed_high = cursor.u8()?;
    let direction = cursor.u8()?;

    // Coordinates are packed as a fraction of a hemisphere; the flags carry
    // the hemisphere signs.
    let mut latitude = raw_latitude as f64 * 90.0 / u32::MAX as f64;
    if flags & LAHS != 0 {
        latitude = -latitude;
    }
    let mut longitude = raw_longitude as f64 * 180.0 / u32::MAX as f64;
    if flags & LOHS != 0 {
        longitude = -longitude;
    }

    // Speed: 14 bits in units of 0.1 km/h. The two top bits of the high
    // byte are the altitude sign and the ninth course bit.
    let speed = (u16::from_le_bytes([speed_low, speed_high & 0x3F]) / 10) as u32;
    let course = direction as u32 + if speed_high & DIRH != 0 { 256 } else { 0 };

    Ok(EgtsFix {
        object_id,
        time: egts_epoch() + chrono::Duration::seconds(navigation_time as i64),
        latitude,
        longitude,
        speed,
        course,
    })
}

fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 };
        }
    }
    crc
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// Bounds-checked reads over a byte slice; any overrun is a truncation.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, EgtsDecodeError> {
        let byte = *self.data.get(self.pos).ok_or(EgtsDecodeError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16_le(&mut self) -> Result<u16, EgtsDecodeError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, EgtsDecodeError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], EgtsDecodeError> {
        if self.remaining() < len {
            return Err(EgtsDecodeError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), EgtsDecodeError> {
        self.bytes(len).map(|_| ())
    }
}
