//! GT06 stream framing and acknowledgment encoding.
//!
//! Inbound frames share the shape
//!
//! ```text
//! 0x78 0x78 | length | protocol | payload… | serial(2) | crc(2) | 0x0D 0x0A
//! ```
//!
//! where `length` counts every byte from `protocol` through `crc` inclusive,
//! so a well-formed frame occupies `length + 5` bytes on the wire. Cheap
//! tracker firmware frequently omits the checksum, in which case the body
//! between the length byte and the terminator is two bytes short and ends
//! with the serial. The decoder accepts both shapes; frames whose body
//! matches neither are dropped without closing the stream.
//!
//! The codec carries no per-device state and is usable with
//! [`tokio_util::codec::Framed`] over the session socket.

use crate::crc;
use crate::error::Gt06Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Frame prefix byte, repeated twice.
pub const START_BYTE: u8 = 0x78;
/// Terminator bytes.
pub const TERMINATOR: [u8; 2] = [0x0D, 0x0A];

/// Smallest legal value of the length field: protocol + serial + crc.
const MIN_LENGTH: u8 = 5;
/// Prefix (2) + length byte (1).
const HEADER_LEN: usize = 3;

/// A parsed GT06 frame: protocol number, payload bytes and the device
/// serial echoed back in the acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Declared length field (protocol through crc inclusive).
    pub length: u8,
    /// Protocol number selecting the payload layout.
    pub protocol: u8,
    /// Bytes between the protocol number and the serial.
    pub payload: Bytes,
    /// Device-assigned serial for this frame.
    pub serial: u16,
}

/// An acknowledgment to be written back to the device: the protocol number
/// and serial of the frame being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub protocol: u8,
    pub serial: u16,
}

impl Ack {
    pub fn new(protocol: u8, serial: u16) -> Self {
        Self { protocol, serial }
    }

    /// Encode to the canonical 10-byte wire form.
    pub fn to_bytes(self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0] = START_BYTE;
        out[1] = START_BYTE;
        out[2] = 0x05;
        out[3] = self.protocol;
        out[4] = (self.serial >> 8) as u8;
        out[5] = self.serial as u8;
        let crc = crc::checksum(&out[2..6]);
        out[6] = (crc >> 8) as u8;
        out[7] = crc as u8;
        out[8] = TERMINATOR[0];
        out[9] = TERMINATOR[1];
        out
    }
}

/// Stream codec for GT06 frames.
#[derive(Debug, Default)]
pub struct Gt06Codec;

impl Gt06Codec {
    pub fn new() -> Self {
        Self
    }
}

/// Position of the first `0x78 0x78` pair in `buf`, if any.
fn find_prefix(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w[0] == START_BYTE && w[1] == START_BYTE)
}

/// Position of the first `0x0D 0x0A` pair in `buf`, if any.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w == TERMINATOR)
}

impl Decoder for Gt06Codec {
    type Item = Frame;
    type Error = Gt06Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Gt06Error> {
        loop {
            // Resynchronize: drop garbage up to the next frame prefix,
            // keeping a trailing lone 0x78 that may be a split prefix.
            match find_prefix(src) {
                Some(0) => {}
                Some(skip) => {
                    debug!(skipped = skip, "resynchronized to frame prefix");
                    src.advance(skip);
                }
                None => {
                    let keep = if src.last() == Some(&START_BYTE) { 1 } else { 0 };
                    if src.len() > keep {
                        debug!(skipped = src.len() - keep, "no frame prefix in buffer");
                        src.advance(src.len() - keep);
                    }
                    return Ok(None);
                }
            }

            if src.len() < HEADER_LEN + 1 {
                return Ok(None);
            }

            let length = src[2];
            if length < MIN_LENGTH {
                warn!(length, "impossible frame length, resynchronizing");
                src.advance(2);
                continue;
            }

            // Standard shape: the terminator sits exactly length bytes past
            // the length field and the body carries a trailing CRC.
            let body_end = HEADER_LEN + length as usize;
            if src.len() >= body_end + 2
                && src[body_end] == TERMINATOR[0]
                && src[body_end + 1] == TERMINATOR[1]
            {
                let expected = crc::checksum(&src[2..body_end - 2]);
                let received =
                    u16::from_be_bytes([src[body_end - 2], src[body_end - 1]]);
                if expected != received {
                    warn!(
                        expected = format_args!("{expected:04X}"),
                        received = format_args!("{received:04X}"),
                        "frame checksum mismatch, dropping frame"
                    );
                    src.advance(body_end + 2);
                    continue;
                }

                let mut frame = src.split_to(body_end + 2);
                frame.advance(HEADER_LEN);
                let protocol = frame.get_u8();
                // payload | serial(2) | crc(2) | 0D 0A
                let payload = frame.split_to(frame.len() - 6).freeze();
                let serial = frame.get_u16();
                return Ok(Some(Frame {
                    length,
                    protocol,
                    payload,
                    serial,
                }));
            }

            // Checksum-less shape: the terminator arrives two bytes early
            // and the body ends with the serial.
            if let Some(pos) = find_terminator(&src[HEADER_LEN..]) {
                if pos == length as usize - 2 && pos >= 3 {
                    let mut frame = src.split_to(HEADER_LEN + pos + 2);
                    frame.advance(HEADER_LEN);
                    let protocol = frame.get_u8();
                    // payload | serial(2) | 0D 0A
                    let payload = frame.split_to(frame.len() - 4).freeze();
                    let serial = frame.get_u16();
                    return Ok(Some(Frame {
                        length,
                        protocol,
                        payload,
                        serial,
                    }));
                }

                // A stray 0D 0A before the declared extent is complete may
                // be payload bytes of a still-arriving frame; only give up
                // once the full extent is here without a valid terminator.
                if src.len() >= body_end + 2 {
                    warn!(
                        length,
                        body_len = pos, "frame body does not match declared length, dropping"
                    );
                    src.advance(HEADER_LEN + pos + 2);
                    continue;
                }
                return Ok(None);
            }

            // Buffer long enough for the declared length but no terminator
            // anywhere: the declared length is wrong. Skip the declared
            // extent and rescan.
            if src.len() >= body_end + 2 {
                warn!(length, "frame terminator missing, dropping declared extent");
                src.advance(body_end + 2);
                continue;
            }

            // Partial frame, wait for the next read.
            return Ok(None);
        }
    }
}

impl Encoder<Ack> for Gt06Codec {
    type Error = Gt06Error;

    fn encode(&mut self, ack: Ack, dst: &mut BytesMut) -> Result<(), Gt06Error> {
        dst.put_slice(&ack.to_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut Gt06Codec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).expect("decode") {
            out.push(frame);
        }
        out
    }

    /// Canonical login frame with checksum, IMEI 123456789012345, serial 1.
    const LOGIN_FULL: [u8; 18] = [
        0x78, 0x78, 0x0D, 0x01, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45,
        0x00, 0x01, 0x8C, 0xDD, 0x0D, 0x0A,
    ];

    /// Same login as emitted by checksum-less firmware.
    const LOGIN_BARE: [u8; 16] = [
        0x78, 0x78, 0x0D, 0x01, 0x08, 0x68, 0x02, 0x20, 0x38, 0x53, 0x17, 0x24,
        0x00, 0x01, 0x0D, 0x0A,
    ];

    #[test]
    fn test_decode_full_login() {
        let mut buf = BytesMut::from(&LOGIN_FULL[..]);
        let frames = decode_all(&mut Gt06Codec::new(), &mut buf);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x01);
        assert_eq!(frames[0].serial, 0x0001);
        assert_eq!(
            frames[0].payload.as_ref(),
            &[0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_bare_login() {
        let mut buf = BytesMut::from(&LOGIN_BARE[..]);
        let frames = decode_all(&mut Gt06Codec::new(), &mut buf);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x01);
        assert_eq!(frames[0].serial, 0x0001);
        assert_eq!(
            frames[0].payload.as_ref(),
            &[0x08, 0x68, 0x02, 0x20, 0x38, 0x53, 0x17, 0x24]
        );
    }

    #[test]
    fn test_resync_on_leading_junk() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF, 0xFF]);
        buf.extend_from_slice(&LOGIN_FULL);

        let frames = decode_all(&mut Gt06Codec::new(), &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x01);
    }

    #[test]
    fn test_frame_straddling_two_reads() {
        let mut codec = Gt06Codec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&LOGIN_FULL[..7]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(&LOGIN_FULL[7..]);
        let frame = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(frame.protocol, 0x01);
        assert_eq!(frame.serial, 0x0001);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&LOGIN_FULL);
        buf.extend_from_slice(&LOGIN_BARE);

        let frames = decode_all(&mut Gt06Codec::new(), &mut buf);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let mut corrupted = LOGIN_FULL;
        corrupted[14] ^= 0xFF;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupted);
        buf.extend_from_slice(&LOGIN_FULL);

        let frames = decode_all(&mut Gt06Codec::new(), &mut buf);
        assert_eq!(frames.len(), 1, "corrupted frame dropped, next one kept");
    }

    #[test]
    fn test_impossible_length_resync() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x78, 0x78, 0x02, 0x01]);
        buf.extend_from_slice(&LOGIN_FULL);

        let frames = decode_all(&mut Gt06Codec::new(), &mut buf);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_trailing_prefix_byte_kept() {
        let mut codec = Gt06Codec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x78]);

        assert!(codec.decode(&mut buf).expect("decode").is_none());
        assert_eq!(buf.as_ref(), &[0x78], "possible split prefix preserved");

        buf.extend_from_slice(&LOGIN_FULL[1..]);
        let frame = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(frame.protocol, 0x01);
    }

    #[test]
    fn test_ack_round_trip() {
        // Acknowledging the canonical login must produce the canonical
        // server response bytes.
        let mut buf = BytesMut::from(&LOGIN_FULL[..]);
        let frame = Gt06Codec::new().decode(&mut buf).expect("decode").expect("frame");

        let ack = Ack::new(frame.protocol, frame.serial);
        assert_eq!(
            ack.to_bytes(),
            [0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]
        );
    }

    #[test]
    fn test_encode_ack_via_encoder() {
        let mut dst = BytesMut::new();
        Gt06Codec::new()
            .encode(Ack::new(0x13, 0x002A), &mut dst)
            .expect("encode");

        assert_eq!(dst.len(), 10);
        assert_eq!(&dst[..4], &[0x78, 0x78, 0x05, 0x13]);
        assert_eq!(&dst[8..], &TERMINATOR);
    }
}
