use i2c_sniffer::frame::*;
use i2c_sniffer::gpio::Level;

fn filled(kind: FrameKind, value: u8, ack: bool) -> Frame {
    let mut frame = Frame::with_kind(kind, 1, 0);
    for shift in (0..8).rev() {
        frame.set_bit(Level::from(value >> shift & 1 == 1)).unwrap();
    }
    frame.set_bit(Level::from(!ack)).unwrap();
    frame
}

#[test]
fn test_bits_fill_msb_first_then_ack() {
    let mut frame = Frame::with_kind(FrameKind::Data, 0, 0);
    for bit in [true, false, true, false, true, false, true, true] {
        frame.set_bit(Level::from(bit)).unwrap();
    }
    assert_eq!(frame.value(), 0xAB);
    assert_eq!(frame.ack(), None);
    assert!(!frame.is_complete());

    frame.set_bit(Level::Low).unwrap();
    assert_eq!(frame.ack(), Some(true));
    assert!(frame.is_complete());
}

#[test]
fn test_tenth_bit_is_rejected() {
    let mut frame = filled(FrameKind::Data, 0x00, false);
    assert_eq!(frame.ack(), Some(false));
    assert_eq!(
        frame.set_bit(Level::High),
        Err(FrameError::BitOverflow { sequence: 1 })
    );
    // frame unchanged
    assert_eq!(frame.bit_count(), FRAME_BITS);
    assert_eq!(frame.ack(), Some(false));
}

#[test]
fn test_control_frames_are_complete_immediately() {
    for kind in [FrameKind::Start, FrameKind::Stop, FrameKind::RepeatedStart] {
        let frame = Frame::with_kind(kind, 0, 0);
        assert!(frame.is_complete());
        assert_eq!(frame.to_string(), kind.name());
    }
    assert!(!Frame::new(0, 0).is_complete());
}

#[test]
fn test_address_frame_splits_address_and_direction() {
    let write = filled(FrameKind::Address, 0x50 << 1, true);
    assert_eq!(write.address(), Some(0x50));
    assert_eq!(write.direction(), Some(Direction::Write));

    let read = filled(FrameKind::Address, 0x50 << 1 | 1, false);
    assert_eq!(read.direction(), Some(Direction::Read));
    assert_eq!(read.to_string(), "ADDRESS 0x50 READ NACK");

    // only address frames carry an address
    let data = filled(FrameKind::Data, 0xA0, true);
    assert_eq!(data.address(), None);
    assert_eq!(data.direction(), None);
}

#[test]
fn test_ten_bit_header_pattern() {
    assert!(filled(FrameKind::Address, 0xF0, true).is_ten_bit_header());
    assert!(filled(FrameKind::Address, 0xF7, true).is_ten_bit_header());
    assert!(!filled(FrameKind::Address, 0xF8, true).is_ten_bit_header());
    assert!(!filled(FrameKind::Address, 0xE8, true).is_ten_bit_header());
    assert!(!filled(FrameKind::Data, 0xF0, true).is_ten_bit_header());
}

#[test]
fn test_partial_frame_rendering() {
    let mut frame = Frame::with_kind(FrameKind::Data, 3, 0);
    frame.set_bit(Level::High).unwrap();
    frame.set_bit(Level::Low).unwrap();
    assert_eq!(frame.to_string(), "DATA 0x02 (2/9 bits)");

    let address2 = filled(FrameKind::Address2, 0x23, true);
    assert_eq!(address2.to_string(), "ADDRESS2 0x23 ACK");
}

#[test]
fn test_anomaly_messages() {
    assert_eq!(
        Anomaly::IncompleteFrame { sequence: 2, bits: 4 }.to_string(),
        "frame 2 incomplete (4 of 9 bits)"
    );
    assert_eq!(
        Anomaly::Interrupted.to_string(),
        "transaction interrupted before STOP"
    );
    assert_eq!(TargetAddress::TenBit(0x223).to_string(), "0x223 (10-bit)");
    assert_eq!(TargetAddress::SevenBit(0x50).to_string(), "0x50");
}

#[test]
fn test_frame_serialises_to_json() {
    let frame = filled(FrameKind::Address, 0xA0, true);
    let json = serde_json::to_value(frame).unwrap();
    assert_eq!(json["kind"], "Address");
    assert_eq!(json["value"], 0xA0);
    assert_eq!(json["acknowledged"], true);
}
