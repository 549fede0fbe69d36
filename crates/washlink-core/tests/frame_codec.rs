//! Tests for the Modbus-ASCII frame codec

use bytes::BytesMut;
use pretty_assertions::assert_eq;
use tokio_util::codec::{Decoder, Encoder};
use washlink_core::protocol::{decode, decode_all, encode, lrc, Frame, FrameCodec, Request, Response};
use washlink_core::simulator;

fn sample_frames() -> Vec<Frame> {
    vec![
        encode(0x0C, 0x05, &[0x01, 0x2F, 0xFF, 0x00]),
        encode(0x0C, 0x03, &[0x00, 0x0A, 0x00, 0x01]),
        encode(0x01, 0x01, &[0x08, 0xD9, 0x00, 0x01]),
        encode(0x01, 0x03, &[0x02, 0x00, 0x0A]),
        encode(0xF7, 0x83, &[0x02]),
    ]
}

#[test]
fn test_decode_inverts_encode() {
    for frame in sample_frames() {
        assert_eq!(decode(&frame.to_wire()), Some(frame));
    }
}

#[test]
fn test_mutated_checksum_is_rejected() {
    for frame in sample_frames() {
        let mut wire = frame.to_wire();
        // Last hex digit of the checksum sits just before "\r\n"
        let pos = wire.len() - 3;
        wire[pos] = if wire[pos] == b'0' { b'1' } else { b'0' };
        assert_eq!(decode(&wire), None, "mutated {:?}", String::from_utf8_lossy(&wire));
    }
}

#[test]
fn test_concatenated_frames_decode_in_order() {
    let frames = sample_frames();
    let wire: Vec<u8> = frames.iter().flat_map(|f| f.to_wire()).collect();
    assert_eq!(decode_all(&wire), frames);
}

#[test]
fn test_missing_start_marker_is_tolerated() {
    let frame = encode(0x0C, 0x03, &[0x02, 0x00, 0x05]);
    let wire = frame.to_wire();
    assert_eq!(decode(&wire[1..]), Some(frame));
}

#[test]
fn test_lowercase_hex_is_accepted() {
    let wire = b":01050905ff00ed\r\n";
    let frame = decode(wire).expect("lower-case frame");
    assert_eq!(frame.address, 0x01);
    assert_eq!(frame.payload, vec![0x09, 0x05, 0xFF, 0x00]);
}

#[test]
fn test_frames_spanning_reads() {
    let frames = sample_frames();
    let wire: Vec<u8> = frames.iter().flat_map(|f| f.to_wire()).collect();

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();
    for chunk in wire.chunks(5) {
        buf.extend_from_slice(chunk);
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
    }
    assert_eq!(decoded, frames);
    assert_eq!(codec.dropped(), 0);
}

#[test]
fn test_codec_resynchronises_after_garbage() {
    let good = encode(0x0C, 0x03, &[0x02, 0x00, 0x07]);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"\x00\xFFnoise\r\n:0C03ZZ\r\n:0C0300");
    buf.extend_from_slice(&good.to_wire());

    let mut codec = FrameCodec::new();
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(good));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(codec.dropped(), 2);
}

#[test]
fn test_unterminated_line_is_capped() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&[b'A'; 600][..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert!(buf.is_empty());

    let frame = encode(0x0C, 0x05, &[0x00, 0x05, 0xFF, 0x00]);
    buf.extend_from_slice(&frame.to_wire());
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
}

#[test]
fn test_encoder_writes_wire_format() {
    let mut codec = FrameCodec::new();
    let mut dst = BytesMut::new();
    let frame = Request::WriteSingleCoil { address: 0x0905, on: true }.to_frame(0x01);
    codec.encode(&frame, &mut dst).unwrap();
    assert_eq!(&dst[..], b":01050905FF00ED\r\n");
}

#[test]
fn test_codec_agrees_with_simulator_encoding() {
    for frame in sample_frames() {
        let mut raw = vec![frame.address, frame.function];
        raw.extend_from_slice(&frame.payload);

        let oracle = simulator::encode_line(&raw);
        assert_eq!(String::from_utf8(frame.to_wire()).unwrap(), oracle);
        assert_eq!(lrc(&raw), simulator::checksum(&raw));
        assert_eq!(simulator::decode_line(&oracle), Some(raw));
    }
}

#[test]
fn test_responses_decode_from_simulator_lines() {
    let line = simulator::encode_line(&[0x0C, 0x03, 0x02, 0x00, 0x06]);
    let frame = decode(line.as_bytes()).unwrap();
    assert_eq!(Response::from_frame(&frame), Ok(Response::Registers(vec![6])));

    let line = simulator::encode_line(&[0x0C, 0x05, 0x01, 0x2F, 0xFF, 0x00]);
    let frame = decode(line.as_bytes()).unwrap();
    assert_eq!(
        Response::from_frame(&frame),
        Ok(Response::WriteAck { address: 0x012F, value: 0xFF00 })
    );
}
