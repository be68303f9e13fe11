//! Packet structure and handling.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ProtocolError, Result};

use super::{HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Command identifiers understood by the NetDimm firmware.
///
/// Ids 0x0B, 0x1F, 0xF0 and 0xF1 exist in some firmware but their semantics are not
/// documented, so they are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketId {
    /// No-op sent right after connecting.
    Startup = 0x01,
    /// Upload chunk. Download responses reuse this id.
    Upload = 0x04,
    /// Download request.
    Download = 0x05,
    /// Masked read-modify-write of the host mode byte.
    HostMode = 0x07,
    /// Masked read-modify-write of the DIMM mode byte.
    DimmMode = 0x08,
    /// Restart the target.
    Restart = 0x0A,
    /// Peek a byte/short/long. Control reads are answered with this id too.
    Peek = 0x10,
    /// Poke a byte/short/long.
    Poke = 0x11,
    /// Read the host BIOS control word.
    ControlRead = 0x16,
    /// Set the run time limit in minutes.
    SetTimeLimit = 0x17,
    /// Get firmware info.
    GetInfo = 0x18,
    /// Stamp the current image crc/length.
    SetInfo = 0x19,
    /// Set the transfer encryption key.
    SetKey = 0x7F,
}

impl PacketId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Startup),
            0x04 => Some(Self::Upload),
            0x05 => Some(Self::Download),
            0x07 => Some(Self::HostMode),
            0x08 => Some(Self::DimmMode),
            0x0A => Some(Self::Restart),
            0x10 => Some(Self::Peek),
            0x11 => Some(Self::Poke),
            0x16 => Some(Self::ControlRead),
            0x17 => Some(Self::SetTimeLimit),
            0x18 => Some(Self::GetInfo),
            0x19 => Some(Self::SetInfo),
            0x7F => Some(Self::SetKey),
            _ => None,
        }
    }
}

impl From<PacketId> for u8 {
    fn from(id: PacketId) -> Self {
        id as u8
    }
}

/// A single framed protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet id. Kept raw so unknown responses can still be reported.
    pub id: u8,
    /// Flow-control flags. Bit 0 marks the last chunk of a sequence.
    pub flags: u8,
    /// Packet payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet.
    pub fn new(id: PacketId, flags: u8, payload: Vec<u8>) -> Result<Self> {
        Self::raw(id.into(), flags, payload)
    }

    /// Create a packet from a raw id.
    pub fn raw(id: u8, flags: u8, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        Ok(Self { id, flags, payload })
    }

    /// Create a packet with no payload.
    pub fn empty(id: PacketId) -> Self {
        Self {
            id: id.into(),
            flags: 0,
            payload: Vec::new(),
        }
    }

    /// Payload length as carried in the header.
    pub fn length(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Check whether the last-chunk flag is set.
    pub fn is_last_chunk(&self) -> bool {
        self.flags & super::FLAG_LAST_CHUNK != 0
    }

    /// Pack the header word.
    pub fn header_word(&self) -> u32 {
        (u32::from(self.id) << 24) | (u32::from(self.flags) << 16) | u32::from(self.length())
    }

    /// Split a header word into `(id, flags, length)`.
    pub fn parse_header(word: u32) -> (u8, u8, usize) {
        (
            ((word >> 24) & 0xFF) as u8,
            ((word >> 16) & 0xFF) as u8,
            (word & 0xFFFF) as usize,
        )
    }

    /// Encode packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + self.payload.len()];
        LittleEndian::write_u32(&mut buf[..HEADER_SIZE], self.header_word());
        buf[HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    /// Decode packet from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} bytes is shorter than a header",
                buf.len()
            ))
            .into());
        }

        let (id, flags, length) = Self::parse_header(LittleEndian::read_u32(&buf[..HEADER_SIZE]));
        let expected_len = HEADER_SIZE + length;
        if buf.len() < expected_len {
            return Err(ProtocolError::MalformedPacket(format!(
                "header announces {length} payload bytes, only {} present",
                buf.len() - HEADER_SIZE
            ))
            .into());
        }

        Ok(Self {
            id,
            flags,
            payload: buf[HEADER_SIZE..expected_len].to_vec(),
        })
    }

    /// Get total packet size.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
