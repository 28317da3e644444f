use crate::WireError;
use bitflags::bitflags;

/// Protocol magic, "WP" little-endian.
pub const MAGIC: u16 = 0x5057;
/// Current protocol revision. Older revisions are rejected.
pub const VERSION: u8 = 2;
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 20;
/// Hard ceiling on payload size; larger messages are a validation error.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u16 {
        /// Payload references zero-copy transfer regions.
        const HAS_TRANSFER = 0x01;
        /// Payload is compressed.
        const COMPRESSED = 0x02;
        /// Payload is encrypted.
        const ENCRYPTED = 0x04;
        /// Last message of a multi-part exchange.
        const FINAL = 0x08;
        /// Receiver must acknowledge.
        const ACK_REQUIRED = 0x10;
    }
}

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    TaskRequest = 1,
    TaskResponse = 2,
    TaskError = 3,
    Event = 4,
    HeartbeatReq = 5,
    HeartbeatRes = 6,
    CleanupReq = 7,
    CleanupRes = 8,
    Terminate = 9,
    Batch = 10,
    StreamChunk = 11,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => Self::TaskRequest,
            2 => Self::TaskResponse,
            3 => Self::TaskError,
            4 => Self::Event,
            5 => Self::HeartbeatReq,
            6 => Self::HeartbeatRes,
            7 => Self::CleanupReq,
            8 => Self::CleanupRes,
            9 => Self::Terminate,
            10 => Self::Batch,
            11 => Self::StreamChunk,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// Message priority class carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl TryFrom<u8> for Priority {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            3 => Self::Critical,
            other => return Err(WireError::UnknownPriority(other)),
        })
    }
}

/// The fixed 20-byte little-endian message header.
///
/// | offset | size | field          |
/// |-------:|-----:|----------------|
/// |      0 |    2 | magic          |
/// |      2 |    1 | version        |
/// |      3 |    1 | type           |
/// |      4 |    2 | flags          |
/// |      6 |    4 | id             |
/// |     10 |    4 | payload_length |
/// |     14 |    4 | sequence       |
/// |     18 |    1 | priority       |
/// |     19 |    1 | reserved (0)   |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageType,
    pub flags: FrameFlags,
    pub id: u32,
    pub payload_length: u32,
    pub sequence: u32,
    pub priority: Priority,
}

impl FrameHeader {
    /// Serializes the header into `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(VERSION);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.payload_length.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.push(self.priority as u8);
        buf.push(0);
    }

    /// Parses and validates a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != MAGIC {
            return Err(WireError::BadMagic {
                found: magic,
                expected: MAGIC,
            });
        }
        let version = bytes[2];
        if version != VERSION {
            return Err(WireError::UnsupportedVersion {
                found: version,
                expected: VERSION,
            });
        }

        let kind = MessageType::try_from(bytes[3])?;
        let flags = FrameFlags::from_bits_truncate(u16::from_le_bytes([bytes[4], bytes[5]]));
        let id = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let payload_length = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        if payload_length as usize > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload_length as usize));
        }
        let sequence = u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]);
        let priority = Priority::try_from(bytes[18])?;

        Ok(Self {
            kind,
            flags,
            id,
            payload_length,
            sequence,
            priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader {
            kind: MessageType::TaskRequest,
            flags: FrameFlags::FINAL | FrameFlags::ACK_REQUIRED,
            id: 0xDEAD_BEEF,
            payload_length: 128,
            sequence: 7,
            priority: Priority::High,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample();
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(FrameHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn layout_is_bit_exact() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        assert_eq!(&buf[0..2], &[0x57, 0x50]); // "WP" little-endian
        assert_eq!(buf[2], 2); // version
        assert_eq!(buf[3], 1); // TaskRequest
        assert_eq!(&buf[4..6], &[0x18, 0x00]); // FINAL | ACK_REQUIRED
        assert_eq!(&buf[6..10], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&buf[10..14], &128u32.to_le_bytes());
        assert_eq!(&buf[14..18], &7u32.to_le_bytes());
        assert_eq!(buf[18], 2); // high priority
        assert_eq!(buf[19], 0); // reserved
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        buf[0] = 0x00;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(WireError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_older_version() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        buf[2] = 1;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(WireError::UnsupportedVersion { found: 1, .. })
        ));
    }

    #[test]
    fn rejects_short_buffer() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        assert!(matches!(
            FrameHeader::decode(&buf[..10]),
            Err(WireError::Truncated { .. })
        ));
    }
}
