//! Core transport stream types and constants.

use crate::error::{Result, TivoError};

/// Size of a transport stream packet in bytes.
pub const TS_PACKET_SIZE: usize = 188;
/// Size of the fixed transport stream header in bytes.
pub const TS_HEADER_SIZE: usize = 4;
/// Transport stream sync byte.
pub const TS_SYNC_BYTE: u8 = 0x47;
/// PID of the Program Association Table.
pub const PID_PAT: u16 = 0x0000;
/// Null packets, passed through untouched.
pub const PID_NULL: u16 = 0x1fff;

/// Parsed fields of the fixed 4-byte transport stream header.
#[derive(Debug, Clone)]
pub struct TsHeader {
    /// Transport error indicator.
    pub transport_error: bool,
    /// Payload unit start indicator: a PES packet or PSI section begins in
    /// this packet's payload.
    pub payload_unit_start: bool,
    /// Packet identifier (13 bits).
    pub pid: u16,
    /// Transport scrambling control (2 bits); non-zero means scrambled.
    pub scrambling_control: u8,
    /// An adaptation field precedes the payload.
    pub adaptation_field_exists: bool,
    /// Payload bytes are present.
    pub contains_payload: bool,
    /// Continuity counter (4 bits).
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parses a packet header. The caller guarantees sync alignment; a
    /// missing sync byte here means the realign pass failed and is an error.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TS_HEADER_SIZE {
            return Err(TivoError::UnexpectedEof("ts packet too short".into()));
        }
        if data[0] != TS_SYNC_BYTE {
            return Err(TivoError::MalformedHeader(format!(
                "sync byte {:#04x} is not 0x47",
                data[0]
            )));
        }
        Ok(Self {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            pid: (((data[1] & 0x1f) as u16) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_exists: data[3] & 0x20 != 0,
            contains_payload: data[3] & 0x10 != 0,
            continuity_counter: data[3] & 0x0f,
        })
    }
}

/// Coarse elementary stream classes, keyed from the PMT stream-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Video elementary streams.
    Video,
    /// Audio elementary streams.
    Audio,
    /// Private data streams; key packets travel on these.
    PrivateData,
    /// Anything else registered in the PMT.
    Other,
}

/// Maps a PMT stream-type byte onto its class.
pub fn classify_stream_type(stream_type: u8) -> StreamClass {
    match stream_type {
        // MPEG-1/2, MPEG-4, H.264, OpenCable and VC-1 video
        0x01 | 0x02 | 0x10 | 0x1b | 0x80 | 0xea => StreamClass::Video,
        // MPEG-1/2, AAC, LATM AAC, AC-3 and DTS audio
        0x03 | 0x04 | 0x0f | 0x11 | 0x81 | 0x8a => StreamClass::Audio,
        0x08 | 0x97 => StreamClass::PrivateData,
        _ => StreamClass::Other,
    }
}

/// Key material carried by a key packet: a block number, the crypted word,
/// a 4-byte salt and the 16-byte per-stream key, all big-endian.
#[derive(Debug, Clone)]
pub struct KeyPayload {
    /// Keystream block counter to resume from.
    pub block_no: u32,
    /// Whether the following payloads are actually encrypted.
    pub crypted: u32,
    /// Per-stream salt.
    pub salt: [u8; 4],
    /// Per-stream Turing key.
    pub key: [u8; 16],
}

/// Wire size of the key material.
pub const KEY_PAYLOAD_LEN: usize = 28;

impl KeyPayload {
    /// Parses the key material from the head of a private payload, or
    /// `None` when too short.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < KEY_PAYLOAD_LEN {
            return None;
        }
        let mut salt = [0u8; 4];
        salt.copy_from_slice(&data[8..12]);
        let mut key = [0u8; 16];
        key.copy_from_slice(&data[12..28]);
        Some(Self {
            block_no: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            crypted: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            salt,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_fields() {
        let data = [0x47, 0x40, 0x21, 0x93];
        let header = TsHeader::parse(&data).unwrap();
        assert!(header.payload_unit_start);
        assert!(!header.transport_error);
        assert_eq!(header.pid, 0x21);
        assert_eq!(header.scrambling_control, 0x02);
        assert!(!header.adaptation_field_exists);
        assert!(header.contains_payload);
        assert_eq!(header.continuity_counter, 3);
    }

    #[test]
    fn rejects_wrong_sync_byte() {
        assert!(matches!(
            TsHeader::parse(&[0x48, 0, 0, 0]),
            Err(TivoError::MalformedHeader(_))
        ));
    }

    #[test]
    fn stream_type_classes() {
        assert_eq!(classify_stream_type(0x02), StreamClass::Video);
        assert_eq!(classify_stream_type(0x1b), StreamClass::Video);
        assert_eq!(classify_stream_type(0x0f), StreamClass::Audio);
        assert_eq!(classify_stream_type(0x81), StreamClass::Audio);
        assert_eq!(classify_stream_type(0x97), StreamClass::PrivateData);
        assert_eq!(classify_stream_type(0x42), StreamClass::Other);
    }

    #[test]
    fn key_payload_roundtrip() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0102_0304u32.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        data.extend_from_slice(&[0x5a; 16]);

        let key = KeyPayload::parse(&data).unwrap();
        assert_eq!(key.block_no, 0x0102_0304);
        assert_eq!(key.crypted, 1);
        assert_eq!(key.salt, [0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(key.key, [0x5a; 16]);

        assert!(KeyPayload::parse(&data[..27]).is_none());
    }
}
