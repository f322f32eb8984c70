use bytes::{Buf, BufMut};
use crc::{Crc, CRC_16_IBM_3740};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Magic constant at the start of every frame.
pub const MAGIC: u32 = 0x5954_4c5a;

/// The single wire protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized header size. The header has a fixed layout, so this is a
/// compile-time constant and length-prefixing is exact.
pub const HEADER_LEN: usize = 22;

/// Upper bound for a whole frame (header plus body) on the wire.
pub const MAX_FRAME_LEN: usize = 65536;

const CHECKSUM_OFFSET: usize = 20;
const SEQUENCE_OFFSET: usize = 8;

/// CRC-16/CCITT (poly 0x1021, init 0xFFFF), computed over the whole frame
/// with the checksum field treated as zero.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Type tag of a frame. The set is closed so the codec stays exhaustively
/// checkable - an unknown tag on the wire is a decode error, not a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Heartbeat = 0,
    ClientInfo = 1,
    ServerInfo = 2,
    FrameData = 3,
    DetectionResult = 4,
    Error = 5,
    Command = 6,
    Ack = 7,
}

/// Why a byte sequence was rejected at the codec boundary. Frames failing
/// any of these checks are not packets - they are discarded without touching
/// caller state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame of {0} bytes is shorter than the 22 byte header")]
    TooShort(usize),
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("declared body length {declared} does not match the {actual} available bytes")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("checksum mismatch: frame carries {in_frame:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { in_frame: u16, computed: u16 },
    #[error("unknown packet type tag {0}")]
    UnknownPacketType(u8),
    #[error("malformed {0:?} body: {1}")]
    MalformedBody(PacketType, &'static str),
}

/// The fixed 22-byte frame header. All integers are big-endian.
///
/// ```ascii
///  0: magic (u32)
///  4: version (u8)
///  5: type (u8)
///  6: body length (u16)
///  8: sequence (u32) - 0 means fire-and-forget
/// 12: timestamp (u64, millis since epoch)
/// 20: checksum (u16, CRC-16/CCITT with this field zeroed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub length: u16,
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub checksum: u16,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, length: u16, sequence: u32, timestamp_ms: u64) -> PacketHeader {
        PacketHeader {
            packet_type,
            length,
            sequence,
            timestamp_ms,
            checksum: 0,
        }
    }

    /// Total frame length implied by this header.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.packet_type.into());
        buf.put_u16(self.length);
        buf.put_u32(self.sequence);
        buf.put_u64(self.timestamp_ms);
        buf.put_u16(self.checksum);
    }

    /// Validates the frame at the start of `buf` and returns its header.
    ///
    /// Checks are applied in order: minimum size, magic, version, declared
    /// length against the available bytes, checksum over the frame slice,
    /// and finally the type tag. `buf` may extend past the frame - datagrams
    /// produced by the aggregation path carry several consecutive frames.
    /// Use [`crate::packet::Packet::decode`] when trailing bytes must be
    /// rejected.
    pub fn validate_frame(buf: &[u8]) -> Result<PacketHeader, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(buf.len()));
        }

        let mut header = &buf[..HEADER_LEN];
        let magic = header.get_u32();
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let version = header.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let type_tag = header.get_u8();
        let length = header.get_u16();
        let sequence = header.get_u32();
        let timestamp_ms = header.get_u64();
        let checksum = header.get_u16();

        let frame_len = HEADER_LEN + length as usize;
        if buf.len() < frame_len {
            return Err(DecodeError::LengthMismatch {
                declared: length,
                actual: buf.len() - HEADER_LEN,
            });
        }

        let computed = checksum_of(&buf[..frame_len]);
        if computed != checksum {
            return Err(DecodeError::ChecksumMismatch {
                in_frame: checksum,
                computed,
            });
        }

        let packet_type = PacketType::try_from(type_tag)
            .map_err(|_| DecodeError::UnknownPacketType(type_tag))?;

        Ok(PacketHeader {
            packet_type,
            length,
            sequence,
            timestamp_ms,
            checksum,
        })
    }

    /// Rewrites the sequence field of an already-encoded frame and brings the
    /// checksum back in sync. The transport assigns reliable sequence numbers
    /// at send time, after the caller has serialized the frame.
    pub fn patch_sequence(frame: &mut [u8], sequence: u32) -> Result<(), DecodeError> {
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(frame.len()));
        }
        frame[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 4].copy_from_slice(&sequence.to_be_bytes());
        patch_checksum(frame);
        Ok(())
    }
}

/// Checksum over a frame, with the checksum field zeroed during the pass.
pub fn checksum_of(frame: &[u8]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&frame[..CHECKSUM_OFFSET]);
    digest.update(&[0, 0]);
    if frame.len() > HEADER_LEN {
        digest.update(&frame[HEADER_LEN..]);
    }
    digest.finalize()
}

/// Computes the checksum of `frame` and writes it into the checksum field.
pub fn patch_checksum(frame: &mut [u8]) {
    let checksum = checksum_of(frame);
    frame[CHECKSUM_OFFSET..HEADER_LEN].copy_from_slice(&checksum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    fn valid_frame(packet_type: PacketType, body: &[u8], sequence: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        PacketHeader::new(packet_type, body.len() as u16, sequence, 1234567).ser(&mut buf);
        buf.extend_from_slice(body);
        let mut frame = buf.to_vec();
        patch_checksum(&mut frame);
        frame
    }

    #[rstest]
    #[case::heartbeat(PacketType::Heartbeat, &[0u8, 0, 0, 42][..], 0)]
    #[case::ack(PacketType::Ack, &[0u8, 0, 0, 7][..], 0)]
    #[case::empty_body(PacketType::Command, &[][..], 99)]
    #[case::reliable(PacketType::FrameData, &[1u8, 2, 3, 4, 5][..], 0xfffffffe)]
    fn test_validate_roundtrip(#[case] packet_type: PacketType, #[case] body: &[u8], #[case] sequence: u32) {
        let frame = valid_frame(packet_type, body, sequence);
        let header = PacketHeader::validate_frame(&frame).unwrap();
        assert_eq!(header.packet_type, packet_type);
        assert_eq!(header.length as usize, body.len());
        assert_eq!(header.sequence, sequence);
        assert_eq!(header.timestamp_ms, 1234567);
        assert_eq!(header.frame_len(), HEADER_LEN + body.len());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_byte(1)]
    #[case::one_short(HEADER_LEN - 1)]
    fn test_too_short(#[case] len: usize) {
        let frame = valid_frame(PacketType::Heartbeat, &[0, 0, 0, 1], 0);
        assert_eq!(
            PacketHeader::validate_frame(&frame[..len]),
            Err(DecodeError::TooShort(len))
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut frame = valid_frame(PacketType::Heartbeat, &[0, 0, 0, 1], 0);
        frame[0] = 0x00;
        assert!(matches!(
            PacketHeader::validate_frame(&frame),
            Err(DecodeError::BadMagic(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut frame = valid_frame(PacketType::Heartbeat, &[0, 0, 0, 1], 0);
        frame[4] = PROTOCOL_VERSION + 1;
        patch_checksum(&mut frame);
        assert_eq!(
            PacketHeader::validate_frame(&frame),
            Err(DecodeError::UnsupportedVersion(PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn test_declared_length_exceeding_frame() {
        let mut frame = valid_frame(PacketType::Heartbeat, &[0, 0, 0, 1], 0);
        frame[6..8].copy_from_slice(&100u16.to_be_bytes());
        patch_checksum(&mut frame);
        assert_eq!(
            PacketHeader::validate_frame(&frame),
            Err(DecodeError::LengthMismatch { declared: 100, actual: 4 })
        );
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut frame = valid_frame(PacketType::Heartbeat, &[0, 0, 0, 1], 0);
        frame[5] = 200;
        patch_checksum(&mut frame);
        assert_eq!(
            PacketHeader::validate_frame(&frame),
            Err(DecodeError::UnknownPacketType(200))
        );
    }

    /// Flipping any single bit of a valid frame - inside or outside the
    /// checksum field - must make validation fail. CRC-16 detects all
    /// single-bit errors, so this holds without exceptions.
    #[test]
    fn test_single_bit_flip_sensitivity() {
        let frame = valid_frame(PacketType::DetectionResult, &[9, 8, 7, 6, 5, 4], 17);
        for byte_idx in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte_idx] ^= 1 << bit;
                assert!(
                    PacketHeader::validate_frame(&corrupted).is_err(),
                    "flip of bit {} in byte {} went undetected",
                    bit,
                    byte_idx
                );
            }
        }
    }

    #[test]
    fn test_patch_sequence_keeps_frame_valid() {
        let mut frame = valid_frame(PacketType::FrameData, &[1, 2, 3], 0);
        PacketHeader::patch_sequence(&mut frame, 0xdead_beef).unwrap();
        let header = PacketHeader::validate_frame(&frame).unwrap();
        assert_eq!(header.sequence, 0xdead_beef);
    }

    #[test]
    fn test_patch_sequence_on_runt_frame() {
        let mut frame = vec![0u8; 10];
        assert_eq!(
            PacketHeader::patch_sequence(&mut frame, 1),
            Err(DecodeError::TooShort(10))
        );
    }

    #[rstest]
    #[case::empty_body(&[][..])]
    #[case::small_body(&[1, 2, 3][..])]
    fn test_checksum_is_stable(#[case] body: &[u8]) {
        let frame = valid_frame(PacketType::Command, body, 3);
        assert_eq!(checksum_of(&frame), u16::from_be_bytes([frame[20], frame[21]]));
    }
}
