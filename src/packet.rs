//! The closed family of packet bodies and their wire codecs.
//!
//! Each variant owns only its body encoding; the shared header lives in
//! [`crate::packet_header`]. Dispatch happens on the header's type tag, so
//! adding a variant means extending [`PacketType`] and the two `match`
//! expressions here - the compiler checks exhaustiveness.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::packet_header::{
    patch_checksum, DecodeError, PacketHeader, PacketType, HEADER_LEN, MAX_FRAME_LEN,
};

/// Liveness probe. The ping value is echoed back by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub ping: u32,
}

/// Capability and screen metadata a client announces on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: u32,
    pub protocol_version: u32,
    pub screen_width: u16,
    pub screen_height: u16,
    pub game_id: u8,
}

/// Capacity and version advertisement sent in response to a registration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerInfo {
    pub server_id: u32,
    pub protocol_version: u32,
    pub model_version: f32,
    pub max_clients: u8,
    pub max_fps: u16,
    pub status: u8,
}

/// One captured image plus its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameData {
    pub frame_id: u32,
    pub timestamp: u64,
    pub width: u16,
    pub height: u16,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

/// A single detected bounding box, coordinates normalized to 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub class_id: u16,
    pub track_id: u32,
    pub timestamp: u64,
}

const DETECTION_LEN: usize = 4 * 5 + 2 + 4 + 8;

/// The detections produced for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub frame_id: u32,
    pub timestamp: u64,
    pub detections: Vec<Detection>,
}

/// An error report: numeric code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: u8,
    pub message: String,
}

/// A control command with an opaque sub-payload keyed by the command byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Acknowledgement of a reliable frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub acked_sequence: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Heartbeat(Heartbeat),
    ClientInfo(ClientInfo),
    ServerInfo(ServerInfo),
    FrameData(FrameData),
    DetectionResult(DetectionResult),
    Error(ErrorMessage),
    Command(Command),
    Ack(Ack),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Heartbeat(_) => PacketType::Heartbeat,
            Packet::ClientInfo(_) => PacketType::ClientInfo,
            Packet::ServerInfo(_) => PacketType::ServerInfo,
            Packet::FrameData(_) => PacketType::FrameData,
            Packet::DetectionResult(_) => PacketType::DetectionResult,
            Packet::Error(_) => PacketType::Error,
            Packet::Command(_) => PacketType::Command,
            Packet::Ack(_) => PacketType::Ack,
        }
    }

    /// Serializes this packet into a complete frame. The header's length and
    /// checksum fields are patched in after the body is written.
    pub fn encode(&self, sequence: u32, timestamp_ms: u64) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        PacketHeader::new(self.packet_type(), 0, sequence, timestamp_ms).ser(&mut buf);
        self.ser_body(&mut buf);

        let body_len = buf.len() - HEADER_LEN;
        if buf.len() > MAX_FRAME_LEN {
            bail!(
                "{:?} body of {} bytes exceeds the maximum frame size of {} bytes",
                self.packet_type(),
                body_len,
                MAX_FRAME_LEN
            );
        }
        buf[6..8].copy_from_slice(&(body_len as u16).to_be_bytes());
        patch_checksum(&mut buf);
        Ok(buf)
    }

    /// Validates `frame` and decodes its body. `frame` must be exactly one
    /// frame - trailing bytes are a length mismatch here (the receive loop
    /// slices multi-frame datagrams before calling this).
    pub fn decode(frame: &[u8]) -> Result<(PacketHeader, Packet), DecodeError> {
        let header = PacketHeader::validate_frame(frame)?;
        if frame.len() != header.frame_len() {
            return Err(DecodeError::LengthMismatch {
                declared: header.length,
                actual: frame.len() - HEADER_LEN,
            });
        }
        let packet = Self::decode_body(header.packet_type, &frame[HEADER_LEN..])?;
        Ok((header, packet))
    }

    fn ser_body(&self, buf: &mut impl BufMut) {
        match self {
            Packet::Heartbeat(p) => {
                buf.put_u32(p.ping);
            }
            Packet::ClientInfo(p) => {
                buf.put_u32(p.client_id);
                buf.put_u32(p.protocol_version);
                buf.put_u16(p.screen_width);
                buf.put_u16(p.screen_height);
                buf.put_u8(p.game_id);
            }
            Packet::ServerInfo(p) => {
                buf.put_u32(p.server_id);
                buf.put_u32(p.protocol_version);
                buf.put_f32(p.model_version);
                buf.put_u8(p.max_clients);
                buf.put_u16(p.max_fps);
                buf.put_u8(p.status);
            }
            Packet::FrameData(p) => {
                buf.put_u32(p.frame_id);
                buf.put_u64(p.timestamp);
                buf.put_u16(p.width);
                buf.put_u16(p.height);
                buf.put_u8(p.keyframe as u8);
                buf.put_slice(&p.data);
            }
            Packet::DetectionResult(p) => {
                buf.put_u32(p.frame_id);
                buf.put_u64(p.timestamp);
                buf.put_u16(p.detections.len() as u16);
                for d in &p.detections {
                    buf.put_f32(d.x);
                    buf.put_f32(d.y);
                    buf.put_f32(d.width);
                    buf.put_f32(d.height);
                    buf.put_f32(d.confidence);
                    buf.put_u16(d.class_id);
                    buf.put_u32(d.track_id);
                    buf.put_u64(d.timestamp);
                }
            }
            Packet::Error(p) => {
                buf.put_u8(p.code);
                buf.put_slice(p.message.as_bytes());
            }
            Packet::Command(p) => {
                buf.put_u8(p.command);
                buf.put_slice(&p.payload);
            }
            Packet::Ack(p) => {
                buf.put_u32(p.acked_sequence);
            }
        }
    }

    pub(crate) fn decode_body(packet_type: PacketType, body: &[u8]) -> Result<Packet, DecodeError> {
        let malformed = |detail| DecodeError::MalformedBody(packet_type, detail);
        let mut buf = body;

        let packet = match packet_type {
            PacketType::Heartbeat => {
                if body.len() != 4 {
                    return Err(malformed("expected exactly 4 bytes"));
                }
                Packet::Heartbeat(Heartbeat { ping: buf.get_u32() })
            }
            PacketType::ClientInfo => {
                if body.len() != 13 {
                    return Err(malformed("expected exactly 13 bytes"));
                }
                Packet::ClientInfo(ClientInfo {
                    client_id: buf.get_u32(),
                    protocol_version: buf.get_u32(),
                    screen_width: buf.get_u16(),
                    screen_height: buf.get_u16(),
                    game_id: buf.get_u8(),
                })
            }
            PacketType::ServerInfo => {
                if body.len() != 16 {
                    return Err(malformed("expected exactly 16 bytes"));
                }
                Packet::ServerInfo(ServerInfo {
                    server_id: buf.get_u32(),
                    protocol_version: buf.get_u32(),
                    model_version: buf.get_f32(),
                    max_clients: buf.get_u8(),
                    max_fps: buf.get_u16(),
                    status: buf.get_u8(),
                })
            }
            PacketType::FrameData => {
                if body.len() < 17 {
                    return Err(malformed("truncated fixed part"));
                }
                Packet::FrameData(FrameData {
                    frame_id: buf.get_u32(),
                    timestamp: buf.get_u64(),
                    width: buf.get_u16(),
                    height: buf.get_u16(),
                    keyframe: buf.get_u8() != 0,
                    data: buf.to_vec(),
                })
            }
            PacketType::DetectionResult => {
                if body.len() < 14 {
                    return Err(malformed("truncated fixed part"));
                }
                let frame_id = buf.get_u32();
                let timestamp = buf.get_u64();
                let count = buf.get_u16() as usize;
                if buf.remaining() != count * DETECTION_LEN {
                    return Err(malformed("detection count disagrees with body length"));
                }
                let mut detections = Vec::with_capacity(count);
                for _ in 0..count {
                    detections.push(Detection {
                        x: buf.get_f32(),
                        y: buf.get_f32(),
                        width: buf.get_f32(),
                        height: buf.get_f32(),
                        confidence: buf.get_f32(),
                        class_id: buf.get_u16(),
                        track_id: buf.get_u32(),
                        timestamp: buf.get_u64(),
                    });
                }
                Packet::DetectionResult(DetectionResult {
                    frame_id,
                    timestamp,
                    detections,
                })
            }
            PacketType::Error => {
                if body.is_empty() {
                    return Err(malformed("missing error code"));
                }
                let code = buf.get_u8();
                let message = std::str::from_utf8(buf)
                    .map_err(|_| malformed("message is not valid UTF-8"))?
                    .to_owned();
                Packet::Error(ErrorMessage { code, message })
            }
            PacketType::Command => {
                if body.is_empty() {
                    return Err(malformed("missing command byte"));
                }
                Packet::Command(Command {
                    command: buf.get_u8(),
                    payload: buf.to_vec(),
                })
            }
            PacketType::Ack => {
                if body.len() != 4 {
                    return Err(malformed("expected exactly 4 bytes"));
                }
                Packet::Ack(Ack { acked_sequence: buf.get_u32() })
            }
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::packet_header::patch_checksum;

    use super::*;

    fn sample_detection(track_id: u32) -> Detection {
        Detection {
            x: 0.25,
            y: 0.5,
            width: 0.1,
            height: 0.2,
            confidence: 0.93,
            class_id: 2,
            track_id,
            timestamp: 1700000000123,
        }
    }

    #[rstest]
    #[case::heartbeat(Packet::Heartbeat(Heartbeat { ping: 42 }))]
    #[case::client_info(Packet::ClientInfo(ClientInfo {
        client_id: 0,
        protocol_version: 1,
        screen_width: 1920,
        screen_height: 1080,
        game_id: 1,
    }))]
    #[case::server_info(Packet::ServerInfo(ServerInfo {
        server_id: 7,
        protocol_version: 1,
        model_version: 2.5,
        max_clients: 10,
        max_fps: 60,
        status: 0,
    }))]
    #[case::frame_data(Packet::FrameData(FrameData {
        frame_id: 7,
        timestamp: 1700000000000,
        width: 416,
        height: 416,
        keyframe: true,
        data: vec![0xab; 100],
    }))]
    #[case::frame_data_empty(Packet::FrameData(FrameData {
        frame_id: 8,
        timestamp: 1,
        width: 0,
        height: 0,
        keyframe: false,
        data: Vec::new(),
    }))]
    #[case::detections(Packet::DetectionResult(DetectionResult {
        frame_id: 7,
        timestamp: 1700000000456,
        detections: vec![sample_detection(1), sample_detection(2)],
    }))]
    #[case::detections_empty(Packet::DetectionResult(DetectionResult {
        frame_id: 9,
        timestamp: 3,
        detections: Vec::new(),
    }))]
    #[case::error(Packet::Error(ErrorMessage { code: 2, message: "server full".to_owned() }))]
    #[case::error_empty_message(Packet::Error(ErrorMessage { code: 6, message: String::new() }))]
    #[case::command(Packet::Command(Command { command: 5, payload: vec![1, 2, 3] }))]
    #[case::ack(Packet::Ack(Ack { acked_sequence: 0xfefe_fefe }))]
    fn test_roundtrip(#[case] packet: Packet) {
        let frame = packet.encode(17, 1700000000789).unwrap();
        let (header, decoded) = Packet::decode(&frame).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(header.sequence, 17);
        assert_eq!(header.timestamp_ms, 1700000000789);
        assert_eq!(header.packet_type, packet.packet_type());
        assert_eq!(header.length as usize, frame.len() - HEADER_LEN);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = Packet::Heartbeat(Heartbeat { ping: 1 }).encode(0, 0).unwrap().to_vec();
        frame.push(0xff);
        assert!(matches!(
            Packet::decode(&frame),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    /// A header whose declared length disagrees with the body must be
    /// rejected even when the checksum is freshly computed over the
    /// tampered frame.
    #[test]
    fn test_declared_length_disagreement() {
        let mut frame = Packet::Heartbeat(Heartbeat { ping: 5 }).encode(0, 0).unwrap().to_vec();
        frame[6..8].copy_from_slice(&3u16.to_be_bytes());
        patch_checksum(&mut frame);
        assert!(matches!(
            Packet::decode(&frame),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[rstest]
    #[case::heartbeat_short(PacketType::Heartbeat, vec![0, 0])]
    #[case::heartbeat_long(PacketType::Heartbeat, vec![0; 5])]
    #[case::client_info_short(PacketType::ClientInfo, vec![0; 12])]
    #[case::server_info_short(PacketType::ServerInfo, vec![0; 15])]
    #[case::frame_data_short(PacketType::FrameData, vec![0; 16])]
    #[case::detections_short(PacketType::DetectionResult, vec![0; 13])]
    #[case::error_empty(PacketType::Error, vec![])]
    #[case::command_empty(PacketType::Command, vec![])]
    #[case::ack_short(PacketType::Ack, vec![0, 0, 0])]
    fn test_malformed_bodies(#[case] packet_type: PacketType, #[case] body: Vec<u8>) {
        assert!(matches!(
            Packet::decode_body(packet_type, &body),
            Err(DecodeError::MalformedBody(t, _)) if t == packet_type
        ));
    }

    #[test]
    fn test_detection_count_mismatch() {
        let packet = Packet::DetectionResult(DetectionResult {
            frame_id: 1,
            timestamp: 2,
            detections: vec![sample_detection(1)],
        });
        let frame = packet.encode(0, 0).unwrap();
        // claim two detections while carrying one
        let mut body = frame[HEADER_LEN..].to_vec();
        body[12..14].copy_from_slice(&2u16.to_be_bytes());
        assert!(matches!(
            Packet::decode_body(PacketType::DetectionResult, &body),
            Err(DecodeError::MalformedBody(PacketType::DetectionResult, _))
        ));
    }

    #[test]
    fn test_error_message_invalid_utf8() {
        let body = vec![1, 0xff, 0xfe];
        assert!(matches!(
            Packet::decode_body(PacketType::Error, &body),
            Err(DecodeError::MalformedBody(PacketType::Error, _))
        ));
    }

    #[test]
    fn test_oversized_body_rejected_at_encode() {
        let packet = Packet::FrameData(FrameData {
            frame_id: 1,
            timestamp: 2,
            width: 1920,
            height: 1080,
            keyframe: true,
            data: vec![0; MAX_FRAME_LEN],
        });
        assert!(packet.encode(0, 0).is_err());
    }
}
