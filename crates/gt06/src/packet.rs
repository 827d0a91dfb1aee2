//! Payload decoding for the supported GT06 protocol numbers.
//!
//! Parsed packets form a closed variant set; the session handler dispatches
//! on the tag. The parser performs no I/O and no rounding before the final
//! coordinate division.

use crate::codec::Frame;
use crate::error::{Gt06Error, Result};
use chrono::{DateTime, NaiveDate, Utc};

/// Login request carrying the BCD-encoded IMEI.
pub const PROTO_LOGIN: u8 = 0x01;
/// GPS location report.
pub const PROTO_LOCATION: u8 = 0x12;
/// Keep-alive heartbeat.
pub const PROTO_HEARTBEAT: u8 = 0x13;

/// Divisor turning the raw 32-bit coordinate into decimal degrees.
const COORD_DIVISOR: f64 = 1_800_000.0;

/// How the parser derives coordinate signs.
///
/// Most firmware emits latitude and longitude as signed 32-bit values, but
/// some variants send magnitudes and encode the hemisphere in the
/// course/status word instead. The gateway exposes this as configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HemisphereMode {
    /// Trust the sign of the 32-bit big-endian value.
    #[default]
    Signed,
    /// Read magnitudes as unsigned; course-word bit 10 set means southern
    /// latitude, bit 11 set means western longitude.
    Flags,
}

/// A decoded location fix, all angles in WGS-84 decimal degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    /// Device-reported UTC instant of the fix.
    pub timestamp: DateTime<Utc>,
    /// Satellites used, 0-15.
    pub satellites: u8,
    pub lat: f64,
    pub lon: f64,
    /// Speed in km/h.
    pub speed: u8,
    /// Course over ground in degrees, stored modulo 360. The raw field is
    /// ten bits wide (0..1023); values past 359 wrap.
    pub course: u16,
    /// Real-time fix as opposed to a stored/differential one.
    pub realtime_gps: bool,
}

/// A parsed device packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Login { imei: String },
    Location(LocationFix),
    Heartbeat,
    Unknown { protocol: u8 },
}

/// Decode a frame payload according to its protocol number.
pub fn parse(frame: &Frame, mode: HemisphereMode) -> Result<Packet> {
    match frame.protocol {
        PROTO_LOGIN => parse_login(&frame.payload),
        PROTO_LOCATION => parse_location(&frame.payload, mode).map(Packet::Location),
        PROTO_HEARTBEAT => Ok(Packet::Heartbeat),
        protocol => Ok(Packet::Unknown { protocol }),
    }
}

fn parse_login(payload: &[u8]) -> Result<Packet> {
    if payload.len() < 8 {
        return Err(Gt06Error::TruncatedPayload {
            protocol: PROTO_LOGIN,
            len: payload.len(),
        });
    }

    let imei = decode_bcd_imei(&payload[..8])?;
    Ok(Packet::Login { imei })
}

/// Decode an 8-byte BCD IMEI, nibble by nibble.
///
/// `0xF` nibbles are padding and skipped. A 16-digit result with a leading
/// zero is the usual left-padded form and loses the pad. Anything that does
/// not end up as exactly 15 decimal digits is rejected.
fn decode_bcd_imei(bytes: &[u8]) -> Result<String> {
    let mut digits = String::with_capacity(16);

    for &b in bytes {
        for nibble in [b >> 4, b & 0x0F] {
            if nibble == 0x0F {
                continue;
            }
            if nibble > 9 {
                return Err(Gt06Error::InvalidImei(format!(
                    "non-decimal nibble 0x{nibble:X}"
                )));
            }
            digits.push((b'0' + nibble) as char);
        }
    }

    if digits.len() == 16 && digits.starts_with('0') {
        digits.remove(0);
    }

    if digits.len() != 15 {
        return Err(Gt06Error::InvalidImei(format!(
            "{} digits after decoding",
            digits.len()
        )));
    }

    Ok(digits)
}

/// Payload layout past the protocol byte:
///
/// ```text
/// [0..6]   date-time: year-2000, month, day, hour, minute, second (UTC)
/// [6]      high nibble: satellites, low nibble: status/length flags
/// [7..11]  latitude,  32-bit big-endian, degrees * 1_800_000
/// [11..15] longitude, 32-bit big-endian, degrees * 1_800_000
/// [15]     speed, km/h
/// [16..18] course/status word: low 10 bits course, bit 13 real-time GPS,
///          bits 10/11 hemisphere flags in `Flags` mode
/// ```
fn parse_location(payload: &[u8], mode: HemisphereMode) -> Result<LocationFix> {
    if payload.len() < 18 {
        return Err(Gt06Error::TruncatedPayload {
            protocol: PROTO_LOCATION,
            len: payload.len(),
        });
    }

    let timestamp = NaiveDate::from_ymd_opt(
        2000 + payload[0] as i32,
        payload[1] as u32,
        payload[2] as u32,
    )
    .and_then(|d| d.and_hms_opt(payload[3] as u32, payload[4] as u32, payload[5] as u32))
    .ok_or(Gt06Error::InvalidTimestamp)?
    .and_utc();

    let satellites = payload[6] >> 4;

    let lat_raw = i32::from_be_bytes([payload[7], payload[8], payload[9], payload[10]]);
    let lon_raw = i32::from_be_bytes([payload[11], payload[12], payload[13], payload[14]]);

    let speed = payload[15];
    let word = u16::from_be_bytes([payload[16], payload[17]]);

    let course = (word & 0x03FF) % 360;
    let realtime_gps = word & 0x2000 != 0;

    let (lat, lon) = match mode {
        HemisphereMode::Signed => (
            lat_raw as f64 / COORD_DIVISOR,
            lon_raw as f64 / COORD_DIVISOR,
        ),
        HemisphereMode::Flags => {
            let lat_mag = lat_raw as u32 as f64 / COORD_DIVISOR;
            let lon_mag = lon_raw as u32 as f64 / COORD_DIVISOR;
            (
                if word & 0x0400 != 0 { -lat_mag } else { lat_mag },
                if word & 0x0800 != 0 { -lon_mag } else { lon_mag },
            )
        }
    };

    Ok(LocationFix {
        timestamp,
        satellites,
        lat,
        lon,
        speed,
        course,
        realtime_gps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn frame(protocol: u8, payload: &[u8]) -> Frame {
        Frame {
            length: (payload.len() + 5) as u8,
            protocol,
            payload: Bytes::copy_from_slice(payload),
            serial: 1,
        }
    }

    fn location_payload(lat_raw: i32, lon_raw: i32, word: u16) -> Vec<u8> {
        let mut p = vec![0x19, 0x06, 0x13, 0x12, 0x1E, 0x21, 0x9B];
        p.extend_from_slice(&lat_raw.to_be_bytes());
        p.extend_from_slice(&lon_raw.to_be_bytes());
        p.push(0x28);
        p.extend_from_slice(&word.to_be_bytes());
        p
    }

    #[test]
    fn test_login_left_padded_imei() {
        let f = frame(PROTO_LOGIN, &[0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]);
        let packet = parse(&f, HemisphereMode::Signed).expect("parse");
        assert_eq!(
            packet,
            Packet::Login {
                imei: "123456789012345".to_string()
            }
        );
    }

    #[test]
    fn test_login_trailing_f_pad() {
        // 15 digits followed by one 0xF pad nibble.
        let f = frame(PROTO_LOGIN, &[0x12, 0x34, 0x56, 0x78, 0x90, 0x12, 0x34, 0x5F]);
        let packet = parse(&f, HemisphereMode::Signed).expect("parse");
        assert_eq!(
            packet,
            Packet::Login {
                imei: "123456789012345".to_string()
            }
        );
    }

    #[test]
    fn test_login_rejects_short_imei() {
        // Two pad nibbles leave only 14 digits.
        let f = frame(PROTO_LOGIN, &[0xFF, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]);
        assert!(parse(&f, HemisphereMode::Signed).is_err());
    }

    #[test]
    fn test_login_rejects_non_decimal() {
        let f = frame(PROTO_LOGIN, &[0x0A, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]);
        assert!(parse(&f, HemisphereMode::Signed).is_err());
    }

    #[test]
    fn test_login_truncated() {
        let f = frame(PROTO_LOGIN, &[0x01, 0x23]);
        assert!(parse(&f, HemisphereMode::Signed).is_err());
    }

    #[test]
    fn test_location_fields() {
        // 28.3949 * 1_800_000 and 84.124 * 1_800_000, exact.
        let payload = location_payload(51_110_820, 151_423_200, 0x205A);
        let f = frame(PROTO_LOCATION, &payload);

        let Packet::Location(fix) = parse(&f, HemisphereMode::Signed).expect("parse") else {
            panic!("expected location");
        };

        assert_eq!(
            fix.timestamp,
            Utc.with_ymd_and_hms(2025, 6, 19, 18, 30, 33).unwrap()
        );
        assert_eq!(fix.satellites, 9);
        assert_eq!(fix.lat, 28.3949);
        assert_eq!(fix.lon, 84.124);
        assert_eq!(fix.speed, 0x28);
        assert_eq!(fix.course, 90);
        assert!(fix.realtime_gps);
    }

    #[test]
    fn test_location_zero_coordinates_exact() {
        let payload = location_payload(0, 0, 0x2000);
        let f = frame(PROTO_LOCATION, &payload);

        let Packet::Location(fix) = parse(&f, HemisphereMode::Signed).expect("parse") else {
            panic!("expected location");
        };

        assert_eq!(fix.lat, 0.0);
        assert_eq!(fix.lon, 0.0);
    }

    #[test]
    fn test_location_negative_signed_coordinates() {
        let payload = location_payload(-51_110_820, -151_423_200, 0x2000);
        let f = frame(PROTO_LOCATION, &payload);

        let Packet::Location(fix) = parse(&f, HemisphereMode::Signed).expect("parse") else {
            panic!("expected location");
        };

        assert_eq!(fix.lat, -28.3949);
        assert_eq!(fix.lon, -84.124);
    }

    #[test]
    fn test_location_course_wraps_past_360() {
        // Raw course 1023 stored modulo 360.
        let payload = location_payload(0, 0, 0x03FF);
        let f = frame(PROTO_LOCATION, &payload);

        let Packet::Location(fix) = parse(&f, HemisphereMode::Signed).expect("parse") else {
            panic!("expected location");
        };

        assert_eq!(fix.course, 1023 % 360);
        assert!(!fix.realtime_gps);
    }

    #[test]
    fn test_location_hemisphere_flags_mode() {
        // Magnitudes with south + west flag bits set.
        let payload = location_payload(51_110_820, 151_423_200, 0x0C00);
        let f = frame(PROTO_LOCATION, &payload);

        let Packet::Location(fix) = parse(&f, HemisphereMode::Flags).expect("parse") else {
            panic!("expected location");
        };

        assert_eq!(fix.lat, -28.3949);
        assert_eq!(fix.lon, -84.124);
    }

    #[test]
    fn test_location_truncated() {
        let f = frame(PROTO_LOCATION, &[0x19, 0x06, 0x13]);
        assert!(parse(&f, HemisphereMode::Signed).is_err());
    }

    #[test]
    fn test_heartbeat() {
        let f = frame(PROTO_HEARTBEAT, &[]);
        assert_eq!(parse(&f, HemisphereMode::Signed).expect("parse"), Packet::Heartbeat);
    }

    #[test]
    fn test_unknown_protocol() {
        let f = frame(0x8A, &[0x01, 0x02]);
        assert_eq!(
            parse(&f, HemisphereMode::Signed).expect("parse"),
            Packet::Unknown { protocol: 0x8A }
        );
    }
}
