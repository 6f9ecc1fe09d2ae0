//! Handshake and phase-notification frames, owned by the session core.

use std::sync::Arc;

use chrono::TimeDelta;

use crate::packet::{CodecError, FieldSpec, PacketSchema};

/// `handshake:u32, time:u32, delta:u32`, 13 bytes, both directions.
pub const HANDSHAKE_HEADER: u8 = 0xFF;

/// `phase:u8`, sent whenever the session changes phase.
pub const PHASE_HEADER: u8 = 0xFE;

pub(crate) fn handshake_schema() -> Result<Arc<PacketSchema>, CodecError> {
    PacketSchema::builder("handshake", HANDSHAKE_HEADER)
        .both()
        .field(FieldSpec::u32("handshake"))
        .field(FieldSpec::u32("time"))
        .field(FieldSpec::u32("delta"))
        .build()
}

pub(crate) fn phase_schema() -> Result<Arc<PacketSchema>, CodecError> {
    PacketSchema::builder("phase", PHASE_HEADER)
        .outgoing()
        .field(FieldSpec::u8("phase"))
        .build()
}

/// Estimated server-minus-client clock difference.
///
/// `delta` is the client's round-trip estimate; half of it is taken as the
/// one-way latency. Times are millisecond ticks that may wrap, so the
/// difference is taken modulo 2^32 and read back as signed.
pub fn clock_offset(server_time: u32, client_time: u32, delta: u32) -> TimeDelta {
    let client_now = client_time.wrapping_add(delta / 2);
    let diff = server_time.wrapping_sub(client_now) as i32;
    TimeDelta::milliseconds(i64::from(diff))
}
