//! Core-only integration tests, no sockets or threads

use bytes::{Bytes, BytesMut};
use liteconn_core::{
    encode_conversation, index_at_or_after, split_conversation, CoreError, Flags, Header, Packet,
    TimeoutSetting, CONVERSATION_PREFIX_SIZE,
};
use std::time::Duration;

#[test]
fn test_header_layout_is_big_endian() {
    let mut header = Header::new(0x0102_0304, Flags::IMP | Flags::DATA)
        .with_id32(0x0A0B_0C0D)
        .with_id64(0x1112_1314_1516_1718);
    header.index = 0x0506_0708;

    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    assert_eq!(
        &buf[..],
        &[
            0x01, 0x02, 0x03, 0x04, // session
            0x05, 0x06, 0x07, 0x08, // index
            0x11, // flags
            0x0A, 0x0B, 0x0C, 0x0D, // id32
            0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, // id64
        ]
    );
    assert_eq!(buf.len(), Header::SIZE);
}

#[test]
fn test_short_datagram_has_no_header() {
    assert!(Packet::decode(Bytes::from(vec![0u8; Header::SIZE - 1])).is_none());
    assert!(Header::peek(&[]).is_none());

    let bare = Packet::decode(Bytes::from(vec![0u8; Header::SIZE])).unwrap();
    assert!(bare.payload.is_empty());
    // An all-zero header parses but carries no valid flags.
    assert!(!bare.header.flags.is_well_formed());
}

#[test]
fn test_header_only_datagrams_decode() {
    let controls = [
        Header::new(0, Flags::SYN).with_id32(0x1111),
        Header::new(0x1111, Flags::SYN | Flags::ACK).with_id32(0x2222),
        Header::new(0x2222, Flags::ACK).with_id32(3),
        Header::new(0x2222, Flags::HBT),
        Header::new(0x2222, Flags::HBT | Flags::ACK),
        Header::new(0x2222, Flags::FIN),
    ];
    for header in controls {
        let wire = Packet::control(header).encode();
        assert_eq!(wire.len(), Header::SIZE, "{} encodes to the wrong size", header.flags);
        let decoded = Packet::decode(wire).unwrap();
        assert_eq!(decoded.header, header);
        assert!(decoded.payload.is_empty());
        assert!(decoded.header.flags.is_well_formed());
    }
}

#[test]
fn test_one_byte_payload_survives() {
    let packet = Packet::new(Header::new(5, Flags::DATA), Bytes::from_static(&[42]));
    let decoded = Packet::decode(packet.encode()).unwrap();
    assert_eq!(&decoded.payload[..], &[42]);
}

#[test]
fn test_packet_keeps_payload_after_header() {
    let packet = Packet::new(
        Header::new(7, Flags::DATA).with_id64(99),
        Bytes::from_static(b"payload"),
    );
    let wire = packet.encode();
    assert_eq!(wire.len(), packet.size());
    assert_eq!(&wire[Header::SIZE..], b"payload");

    let peeked = Header::peek(&wire).unwrap();
    assert_eq!(peeked, packet.header);
    assert_eq!(Packet::decode(wire).unwrap(), packet);
}

#[test]
fn test_flag_combinations_produced_by_connections() {
    let produced = [
        Flags::SYN,
        Flags::SYN | Flags::ACK,
        Flags::ACK,
        Flags::FIN,
        Flags::HBT,
        Flags::HBT | Flags::ACK,
        Flags::DATA,
        Flags::DATA | Flags::IMP,
        Flags::DATA | Flags::REQ | Flags::IMP,
        Flags::DATA | Flags::ACK | Flags::IMP,
        Flags::DATA | Flags::ACK | Flags::REQ | Flags::IMP,
        Flags::CXL | Flags::IMP,
        Flags::ACK | Flags::CXL | Flags::IMP,
    ];
    for flags in produced {
        assert!(flags.is_well_formed(), "{flags} rejected");
    }

    let nonsense = [
        Flags::empty(),
        Flags::SYN | Flags::DATA,
        Flags::FIN | Flags::ACK,
        Flags::HBT | Flags::IMP,
        Flags::REQ,
        Flags::CXL | Flags::DATA,
        Flags::IMP,
        Flags::IMP | Flags::ACK,
    ];
    for flags in nonsense {
        assert!(!flags.is_well_formed(), "{flags} accepted");
    }
}

#[test]
fn test_flags_display_in_bit_order() {
    let flags = Flags::HBT | Flags::ACK;
    assert_eq!(flags.to_string(), "ACK|HBT");
    assert_eq!(format!("{:?}", Flags::DATA | Flags::IMP), "DATA|IMP");
    assert_eq!(Flags::empty().to_string(), "(none)");
}

#[test]
fn test_conversation_prefix() {
    let framed = encode_conversation(0xDEAD_BEEF_0000_0001, b"next turn");
    assert_eq!(framed.len(), CONVERSATION_PREFIX_SIZE + 9);

    let (next, data) = split_conversation(framed).unwrap();
    assert_eq!(next, 0xDEAD_BEEF_0000_0001);
    assert_eq!(&data[..], b"next turn");

    let err = split_conversation(Bytes::from_static(b"short")).unwrap_err();
    assert!(matches!(err, CoreError::Protocol { .. }));
}

#[test]
fn test_index_comparison_across_wrap() {
    assert!(index_at_or_after(5, 5));
    assert!(index_at_or_after(6, 5));
    assert!(!index_at_or_after(4, 5));
    assert!(index_at_or_after(0, u32::MAX));
    assert!(index_at_or_after(3, u32::MAX - 3));
    assert!(!index_at_or_after(u32::MAX, 0));
}

#[test]
fn test_timeout_presets_validate() {
    for setting in [
        TimeoutSetting::default(),
        TimeoutSetting::lan(),
        TimeoutSetting::relaxed(),
    ] {
        setting.validate().unwrap();
    }

    let backwards = TimeoutSetting::custom(
        Duration::from_millis(100),
        Duration::from_secs(1),
        Duration::from_millis(10),
        Duration::from_secs(1),
    );
    assert!(matches!(backwards.validate(), Err(CoreError::Config { .. })));
}
