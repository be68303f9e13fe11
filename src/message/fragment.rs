//! Message fragments and payload compression.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::{MAX_MESSAGE_DATA_LENGTH, MESSAGE_HEADER_LENGTH};
use crate::error::ValidationError;

/// Header carried at the front of every fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Message id, with the compressed flag in the top bit.
    pub msgid: u16,
    pub sequence: u16,
    /// Length of the whole (possibly compressed) payload.
    pub total_length: u16,
    /// Offset of this fragment's data in the payload.
    pub offset: u16,
}

impl FragmentHeader {
    pub fn encode(&self) -> [u8; MESSAGE_HEADER_LENGTH] {
        let mut buf = [0u8; MESSAGE_HEADER_LENGTH];
        LittleEndian::write_u16(&mut buf[0..2], self.msgid);
        LittleEndian::write_u16(&mut buf[2..4], self.sequence);
        LittleEndian::write_u16(&mut buf[4..6], self.total_length);
        LittleEndian::write_u16(&mut buf[6..8], self.offset);
        buf
    }

    /// Split a received packet into header and data.
    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8]), ValidationError> {
        if packet.len() < MESSAGE_HEADER_LENGTH {
            return Err(ValidationError::ShortFragment(packet.len()));
        }
        let header = Self {
            msgid: LittleEndian::read_u16(&packet[0..2]),
            sequence: LittleEndian::read_u16(&packet[2..4]),
            total_length: LittleEndian::read_u16(&packet[4..6]),
            offset: LittleEndian::read_u16(&packet[6..8]),
        };
        Ok((header, &packet[MESSAGE_HEADER_LENGTH..]))
    }
}

/// Split a payload into wire-ready fragments.
///
/// An empty payload still produces one header-only fragment. `payload` must be at most
/// 0xFFFF bytes.
pub fn split(msgid: u16, sequence: u16, payload: &[u8]) -> Vec<Vec<u8>> {
    let total_length = payload.len() as u16;
    if payload.is_empty() {
        let header = FragmentHeader {
            msgid,
            sequence,
            total_length: 0,
            offset: 0,
        };
        return vec![header.encode().to_vec()];
    }

    payload
        .chunks(MAX_MESSAGE_DATA_LENGTH)
        .enumerate()
        .map(|(index, chunk)| {
            let header = FragmentHeader {
                msgid,
                sequence,
                total_length,
                offset: (index * MAX_MESSAGE_DATA_LENGTH) as u16,
            };
            let mut fragment = Vec::with_capacity(MESSAGE_HEADER_LENGTH + chunk.len());
            fragment.extend_from_slice(&header.encode());
            fragment.extend_from_slice(chunk);
            fragment
        })
        .collect()
}

/// Compress a payload when it pays off.
///
/// The result is the uncompressed length as a little-endian u32 followed by the zlib
/// stream. Returns `None` unless that is strictly smaller than the input.
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;
    if compressed.len() + 4 >= data.len() {
        return None;
    }

    let mut out = Vec::with_capacity(compressed.len() + 4);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    Some(out)
}

/// Inverse of [`compress`]. The decompressed length must match the prefix.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ValidationError> {
    if data.len() < 4 {
        return Err(ValidationError::Decompress(format!(
            "{} bytes is too short for a length prefix",
            data.len()
        )));
    }

    let expected = LittleEndian::read_u32(&data[0..4]) as usize;
    let mut out = Vec::with_capacity(expected);
    ZlibDecoder::new(&data[4..])
        .read_to_end(&mut out)
        .map_err(|e| ValidationError::Decompress(e.to_string()))?;

    if out.len() != expected {
        return Err(ValidationError::DecompressedLength {
            expected,
            got: out.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FragmentHeader {
            msgid: 0x8123,
            sequence: 2,
            total_length: 0x0400,
            offset: 751,
        };
        let bytes = header.encode();
        assert_eq!(bytes, [0x23, 0x81, 0x02, 0x00, 0x00, 0x04, 0xEF, 0x02]);

        let mut packet = bytes.to_vec();
        packet.extend_from_slice(b"xyz");
        let (decoded, data) = FragmentHeader::decode(&packet).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(data, b"xyz");
    }

    #[test]
    fn test_short_fragment_rejected() {
        assert!(matches!(
            FragmentHeader::decode(&[1, 2, 3]),
            Err(ValidationError::ShortFragment(3))
        ));
    }

    #[test]
    fn test_split_sizes() {
        assert_eq!(split(1, 1, &[]).len(), 1);
        assert_eq!(split(1, 1, &[]).first().unwrap().len(), MESSAGE_HEADER_LENGTH);

        let payload = vec![7u8; MAX_MESSAGE_DATA_LENGTH * 2 + 1];
        let fragments = split(5, 9, &payload);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[2].len(), MESSAGE_HEADER_LENGTH + 1);

        let (last, _) = FragmentHeader::decode(&fragments[2]).unwrap();
        assert_eq!(last.offset as usize, MAX_MESSAGE_DATA_LENGTH * 2);
        assert_eq!(last.total_length as usize, payload.len());
        assert_eq!(last.sequence, 9);
    }

    #[test]
    fn test_compression_round_trip() {
        let data = b"hello hello hello hello hello hello hello hello".repeat(20);
        let packed = compress(&data).expect("repetitive data compresses");
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_left_alone() {
        assert!(compress(b"abc").is_none());
        assert!(compress(&[]).is_none());
    }

    #[test]
    fn test_decompress_length_mismatch() {
        let data = vec![0u8; 512];
        let mut packed = compress(&data).unwrap();
        packed[0] = packed[0].wrapping_add(1);
        assert!(matches!(
            decompress(&packed),
            Err(ValidationError::DecompressedLength { .. })
        ));
        assert!(decompress(&[1, 2]).is_err());
    }
}
