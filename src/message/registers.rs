//! Mailbox registers and their checksums.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::Result;
use crate::transport::NetDimmLink;
use crate::types::PeekPokeWidth;

pub const DATA_REGISTER: u32 = 0xC0DE10;
pub const SEND_STATUS_REGISTER: u32 = 0xC0DE20;
pub const RECV_STATUS_REGISTER: u32 = 0xC0DE30;
pub const CONFIG_REGISTER: u32 = 0xC0DE40;
pub const SCRATCH1_REGISTER: u32 = 0xC0DE50;
pub const SCRATCH2_REGISTER: u32 = 0xC0DE60;

pub const SEND_STATUS_REGISTER_SEED: u32 = 3;
pub const RECV_STATUS_REGISTER_SEED: u32 = 7;
pub const CONFIG_REGISTER_SEED: u32 = 19;

pub const CONFIG_MESSAGE_EXISTS: u32 = 0x0000_0001;
pub const CONFIG_MESSAGE_HAS_ZLIB: u32 = 0x0000_0002;

/// Word-sized access to target memory.
#[async_trait]
pub trait RegisterAccess: Send {
    async fn read_register(&mut self, addr: u32) -> Result<u32>;

    async fn write_register(&mut self, addr: u32, value: u32) -> Result<()>;
}

#[async_trait]
impl<R: RegisterAccess + ?Sized> RegisterAccess for &mut R {
    async fn read_register(&mut self, addr: u32) -> Result<u32> {
        (**self).read_register(addr).await
    }

    async fn write_register(&mut self, addr: u32, value: u32) -> Result<()> {
        (**self).write_register(addr, value).await
    }
}

#[async_trait]
impl RegisterAccess for NetDimmLink {
    async fn read_register(&mut self, addr: u32) -> Result<u32> {
        self.peek(addr, PeekPokeWidth::Long).await
    }

    async fn write_register(&mut self, addr: u32, value: u32) -> Result<()> {
        self.poke(addr, PeekPokeWidth::Long, value).await
    }
}

fn byte_sum(word: u32, seed: u32) -> u32 {
    (word & 0xFF) + ((word >> 8) & 0xFF) + ((word >> 16) & 0xFF) + seed
}

/// Whether the top byte of `word` is the checksum of its low 24 bits.
pub fn checksum_valid(word: u32, seed: u32) -> bool {
    (word >> 24) & 0xFF == !byte_sum(word, seed) & 0xFF
}

/// Replace the top byte of `value` with the checksum of its low 24 bits.
pub fn checksum_stamp(value: u32, seed: u32) -> u32 {
    ((!byte_sum(value, seed) & 0xFF) << 24) | (value & 0x00FF_FFFF)
}

/// Packet length field of a status word.
pub(crate) fn status_length(word: u32) -> usize {
    ((word >> 12) & 0xFFF) as usize
}

/// Location field of a status word.
pub(crate) fn status_location(word: u32) -> usize {
    (word & 0xFFF) as usize
}

/// Poll a checksummed register until it holds a valid value.
///
/// All-zero and all-ones words mean the target has not written yet. Returns `None` once
/// `timeout` passes without a valid value.
pub(crate) async fn read_checked<R: RegisterAccess + ?Sized>(
    regs: &mut R,
    addr: u32,
    seed: u32,
    timeout: Duration,
) -> Result<Option<u32>> {
    let deadline = Instant::now() + timeout;
    loop {
        let word = regs.read_register(addr).await?;
        if word != 0 && word != 0xFFFF_FFFF && checksum_valid(word, seed) {
            return Ok(Some(word));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::task::yield_now().await;
    }
}

/// Write a register with its checksum stamped.
pub(crate) async fn write_stamped<R: RegisterAccess + ?Sized>(
    regs: &mut R,
    addr: u32,
    seed: u32,
    value: u32,
) -> Result<()> {
    regs.write_register(addr, checksum_stamp(value, seed)).await
}
