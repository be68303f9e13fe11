//! Packet encoding and decoding.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::ProtocolError;

/// Tokio codec for NetDimm packet framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDimmCodec;

impl NetDimmCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for NetDimmCodec {
    type Item = Packet;
    type Error = crate::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming it
        let word = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let (id, flags, length) = Packet::parse_header(word);
        let total_len = HEADER_SIZE + length;

        // Wait for complete packet
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).to_vec();

        Ok(Some(Packet { id, flags, payload }))
    }
}

impl Encoder<Packet> for NetDimmCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        dst.reserve(item.size());
        dst.put_u32_le(item.header_word());
        dst.put_slice(&item.payload);

        Ok(())
    }
}
