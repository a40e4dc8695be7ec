//! End-to-end frame codec coverage (spec §8, S1): building a request,
//! corrupting it, and confirming decode rejects it.

use fb_bus_gateway::frame;
use fb_bus_gateway::wire::{PacketKind, ProtocolVersion, TERMINATOR};

#[test]
fn discover_search_frame_roundtrips() {
    let payload = [ProtocolVersion::V1.byte(), PacketKind::Discover.byte(), 0x01];
    let encoded = frame::encode(&payload);

    assert_eq!(encoded.last(), Some(&TERMINATOR));
    assert_eq!(frame::decode(&encoded).unwrap(), &payload);
}

#[test]
fn read_multiple_registers_frame_roundtrips() {
    let payload = [
        ProtocolVersion::V1.byte(),
        PacketKind::ReadMultipleRegisters.byte(),
        0x01, // register kind: Input
        0x00, // start address
        0x03, // count
    ];
    let encoded = frame::encode(&payload);
    assert_eq!(frame::decode(&encoded).unwrap(), &payload);
}

#[test]
fn corrupted_crc_is_rejected() {
    let payload = [ProtocolVersion::V1.byte(), PacketKind::Ping.byte()];
    let mut encoded = frame::encode(&payload);
    let crc_hi = encoded.len() - 3;
    encoded[crc_hi] ^= 0xFF;

    assert!(frame::decode(&encoded).is_err());
}

#[test]
fn truncated_frame_is_rejected() {
    let payload = [ProtocolVersion::V1.byte(), PacketKind::Pong.byte()];
    let encoded = frame::encode(&payload);
    let truncated = &encoded[..encoded.len() - 2];

    assert!(frame::decode(truncated).is_err());
}
