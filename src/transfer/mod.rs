//! Bulk image transfer.
//!
//! Whole images move in 0x8000 byte upload/download chunks. After an upload the device
//! is stamped with the length and CRC of the bytes as transmitted, so it can verify the
//! image itself on the next boot.

use tracing::{debug, info};

use crate::crypto::{ChunkCipher, KEY_SIZE, NO_ENCRYPTION_KEY};
use crate::error::{ProtocolError, Result};
use crate::protocol::{CHUNK_SIZE, CRC_CHECK_ADDRESS, GAME_INFO_ADDRESS};
use crate::transport::NetDimmLink;

/// Size of the image metadata block cleared before every upload.
const GAME_INFO_SIZE: usize = 32;

/// First sequence number used for image chunks. Sequence 1 is the metadata wipe.
const FIRST_IMAGE_SEQUENCE: u32 = 2;

/// Host mode that reboots the target into the "now loading" screen.
const HOST_MODE_NOW_LOADING: u8 = 1;

/// Options for [`NetDimmLink::send`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Encrypt chunks with this key. `None` uploads plaintext and sets the zero key.
    pub key: Option<[u8; KEY_SIZE]>,
    /// Ask the device to skip CRC verification of the new image.
    pub disable_crc_check: bool,
    /// Do not switch the target into the "now loading" screen first.
    pub disable_now_loading: bool,
}

/// Running CRC over image bytes, reporting the value the NetDimm stores and compares
/// against: the bitwise complement of the standard CRC32.
#[derive(Debug, Clone, Default)]
pub struct ImageCrc {
    hasher: crc32fast::Hasher,
}

impl ImageCrc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> u32 {
        !self.hasher.finalize()
    }
}

/// Device CRC of a whole image, computed chunk by chunk.
pub fn image_crc(data: &[u8]) -> u32 {
    let mut crc = ImageCrc::new();
    for chunk in data.chunks(CHUNK_SIZE) {
        crc.update(chunk);
    }
    crc.finish()
}

fn checked_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        ProtocolError::PayloadTooLarge {
            size: len,
            max: u32::MAX as usize,
        }
        .into()
    })
}

impl NetDimmLink {
    /// Upload a whole image and stamp its CRC.
    ///
    /// `progress` is called with `(sent, total)` once before anything is sent, before
    /// every chunk, and once more after the last one.
    pub async fn send<F>(&mut self, data: &[u8], options: &SendOptions, mut progress: F) -> Result<()>
    where
        F: FnMut(u64, u64) + Send,
    {
        let total = checked_len(data.len())?;
        let mut link = self.connect().await?;
        progress(0, u64::from(total));

        if !options.disable_now_loading {
            link.set_host_mode(HOST_MODE_NOW_LOADING).await?;
        }

        link.set_key_code(options.key.as_ref().unwrap_or(&NO_ENCRYPTION_KEY))
            .await?;

        if options.disable_crc_check {
            link.disable_crc_check().await?;
        } else {
            link.enable_crc_check().await?;
        }

        info!(
            addr = %link.addr(),
            size = total,
            encrypted = options.key.is_some(),
            "Uploading image"
        );
        link.upload_image(data, options.key.as_ref(), &mut progress)
            .await
    }

    async fn upload_image<F>(
        &mut self,
        data: &[u8],
        key: Option<&[u8; KEY_SIZE]>,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(u64, u64) + Send,
    {
        let total = checked_len(data.len())?;
        let cipher = key.map(ChunkCipher::new);

        // Clear the stamp so an interrupted upload is never mistaken for a valid image.
        self.upload(1, GAME_INFO_ADDRESS, &[0; GAME_INFO_SIZE], false)
            .await?;

        let mut crc = ImageCrc::new();
        let mut sequence = FIRST_IMAGE_SEQUENCE;
        let mut addr: u32 = 0;
        let mut buf = Vec::with_capacity(CHUNK_SIZE);

        for chunk in data.chunks(CHUNK_SIZE) {
            progress(u64::from(addr), u64::from(total));

            buf.clear();
            buf.extend_from_slice(chunk);
            if let Some(cipher) = &cipher {
                cipher.encrypt(&mut buf);
            }

            let len = chunk.len() as u32;
            let last = addr + len == total;
            self.upload(sequence, addr, &buf, last).await?;
            crc.update(&buf);

            addr += len;
            sequence += 1;
        }

        progress(u64::from(addr), u64::from(total));
        let crc = crc.finish();
        debug!(length = addr, crc = format_args!("{crc:#010x}"), "Stamping image information");
        self.set_information(crc, addr).await
    }

    async fn enable_crc_check(&mut self) -> Result<()> {
        self.upload(1, CRC_CHECK_ADDRESS, &[0; 16], true).await
    }

    async fn disable_crc_check(&mut self) -> Result<()> {
        let mut block = [0u8; 16];
        block[..8].fill(0xFF);
        self.upload(1, CRC_CHECK_ADDRESS, &block, true).await
    }

    /// Download the current image.
    ///
    /// Returns `None` when the device holds no image that passed (or skipped) its CRC
    /// check.
    pub async fn receive<F>(&mut self, mut progress: F) -> Result<Option<Vec<u8>>>
    where
        F: FnMut(u64, u64) + Send,
    {
        let mut link = self.connect().await?;
        let info = link.info().await?;

        if !info.game_crc_status.has_image() || info.current_game_size == 0 {
            debug!(
                addr = %link.addr(),
                status = %info.game_crc_status,
                size = info.current_game_size,
                "No image to receive"
            );
            return Ok(None);
        }

        let total = info.current_game_size;
        progress(0, u64::from(total));
        let data = link.read_memory(0, total, &mut progress).await?;
        Ok(Some(data))
    }

    /// Write raw data to DIMM memory at `offset`, without touching image metadata.
    pub async fn send_chunk(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let total = checked_len(data.len())?;
        let mut link = self.connect().await?;

        let mut sequence = 1;
        let mut addr: u32 = 0;
        for chunk in data.chunks(CHUNK_SIZE) {
            let len = chunk.len() as u32;
            let last = addr + len == total;
            link.upload(sequence, offset.wrapping_add(addr), chunk, last)
                .await?;
            addr += len;
            sequence += 1;
        }
        Ok(())
    }

    /// Read `length` bytes of DIMM memory starting at `offset`.
    pub async fn receive_chunk(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut link = self.connect().await?;
        link.read_memory(offset, length, &mut |_, _| {}).await
    }

    async fn read_memory<F>(&mut self, offset: u32, length: u32, progress: &mut F) -> Result<Vec<u8>>
    where
        F: FnMut(u64, u64) + Send,
    {
        let mut data = Vec::with_capacity(length as usize);
        let mut addr: u32 = 0;

        while addr < length {
            let amount = (length - addr).min(CHUNK_SIZE as u32);
            let chunk = self.download(offset.wrapping_add(addr), amount).await?;
            addr = addr.saturating_add(chunk.len() as u32);
            data.extend_from_slice(&chunk);
            progress(u64::from(addr), u64::from(length));
        }

        Ok(data)
    }

    /// Clear the current image's CRC and size so the next boot neither checks nor runs it.
    pub async fn wipe_current_game(&mut self) -> Result<()> {
        let mut link = self.connect().await?;
        link.upload(1, GAME_INFO_ADDRESS, &[0; GAME_INFO_SIZE], false)
            .await
    }
}
