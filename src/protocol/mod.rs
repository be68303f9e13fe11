//! NetDimm wire protocol.
//!
//! Every request and response is a single little-endian header word followed by the
//! payload.
//!
//! ## Packet Format
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────────────┬─────────────┐
//! │ Id (8)       │ Flags (8)    │ Payload Length (16)         │ Payload ... │
//! └──────────────┴──────────────┴─────────────────────────────┴─────────────┘
//!   header word = (id << 24) | (flags << 16) | length, written little-endian
//! ```

mod codec;
mod packet;

pub use codec::NetDimmCodec;
pub use packet::{Packet, PacketId};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size a header can describe.
pub const MAX_PAYLOAD_SIZE: usize = 0xFFFF;

/// Flag bit 0: last chunk of an upload/download sequence.
pub const FLAG_LAST_CHUNK: u8 = 0x01;

/// Flag bit 7: set on every upload chunk.
pub const FLAG_UPLOAD: u8 = 0x80;

/// System-mirrored register holding the CRC status word.
pub const CRC_STATUS_ADDRESS: u32 = 0xFFFE_FFE0;

/// System register block controlling device-side CRC verification.
pub const CRC_CHECK_ADDRESS: u32 = 0xFFFE_FFF0;

/// Metadata block of the current image (crc, length, ..., crc over the block).
pub const GAME_INFO_ADDRESS: u32 = 0xFFFF_0000;

/// Size of the current image, inside the metadata block.
pub const GAME_SIZE_ADDRESS: u32 = 0xFFFF_0004;

/// Largest chunk moved by a single upload or download request.
pub const CHUNK_SIZE: usize = 0x8000;

/// Size of the `seq:u32, addr:u32, reserved:u16` prefix of upload/download chunks.
pub const CHUNK_HEADER_SIZE: usize = 10;
