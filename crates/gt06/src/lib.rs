//! GT06 tracker protocol support.
//!
//! The GT06 family of vehicle GPS trackers speaks a small binary protocol
//! over long-lived TCP connections: frames delimited by a `0x78 0x78`
//! prefix and `0x0D 0x0A` suffix, typed by a one-byte protocol number.
//! This crate covers the wire layer only:
//!
//! - [`crc`] — the ITU CRC-16 used by frame checksums and acknowledgments
//! - [`codec`] — stream framing ([`tokio_util::codec::Decoder`]) and ACK
//!   encoding ([`tokio_util::codec::Encoder`])
//! - [`packet`] — payload decoding into a closed variant set
//!
//! Everything here is pure byte manipulation; sessions, device state and
//! fan-out live in the gateway crate.

pub mod codec;
pub mod crc;
pub mod error;
pub mod packet;

pub use codec::{Ack, Frame, Gt06Codec};
pub use error::{Gt06Error, Result};
pub use packet::{HemisphereMode, LocationFix, Packet};
