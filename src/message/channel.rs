//! The register mailbox channel.

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::fragment::{compress, decompress, split};
use super::reassembly::Reassembler;
use super::registers::{
    read_checked, status_length, status_location, write_stamped, RegisterAccess,
    CONFIG_MESSAGE_EXISTS, CONFIG_MESSAGE_HAS_ZLIB, CONFIG_REGISTER, CONFIG_REGISTER_SEED,
    DATA_REGISTER, RECV_STATUS_REGISTER, RECV_STATUS_REGISTER_SEED, SCRATCH1_REGISTER,
    SCRATCH2_REGISTER, SEND_STATUS_REGISTER, SEND_STATUS_REGISTER_SEED,
};
use super::{
    Message, MessageConfig, SequenceCounter, COMPRESSED_FLAG, MAX_MESSAGE_LENGTH,
    MAX_PACKET_LENGTH,
};
use crate::error::{MessageError, Result, ValidationError};

/// Capabilities the target advertises in its config register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfig {
    pub message_protocol: bool,
    pub zlib: bool,
}

impl TargetConfig {
    pub fn from_word(word: u32) -> Self {
        Self {
            message_protocol: word & CONFIG_MESSAGE_EXISTS != 0,
            zlib: word & CONFIG_MESSAGE_HAS_ZLIB != 0,
        }
    }
}

/// Message channel over a register mailbox.
///
/// Owns its send sequence and receive reassembly state, so one channel per target can
/// run side by side without interfering.
pub struct MessageChannel<R> {
    regs: R,
    config: MessageConfig,
    send_sequence: SequenceCounter,
    reassembler: Reassembler,
}

impl<R: RegisterAccess> MessageChannel<R> {
    pub fn new(regs: R, config: MessageConfig) -> Self {
        let reassembler = Reassembler::new(config.stale_timeout);
        Self {
            regs,
            config,
            send_sequence: SequenceCounter::new(),
            reassembler,
        }
    }

    /// Access the underlying registers.
    pub fn registers(&mut self) -> &mut R {
        &mut self.regs
    }

    pub fn into_inner(self) -> R {
        self.regs
    }

    /// Sequence the next outgoing message will carry.
    pub fn next_send_sequence(&self) -> u16 {
        self.send_sequence.peek()
    }

    /// Read the target's capabilities. `None` if the register never validated.
    pub async fn read_config(&mut self) -> Result<Option<TargetConfig>> {
        let word = read_checked(
            &mut self.regs,
            CONFIG_REGISTER,
            CONFIG_REGISTER_SEED,
            self.config.read_timeout,
        )
        .await?;
        Ok(word.map(TargetConfig::from_word))
    }

    pub async fn read_scratch1(&mut self) -> Result<u32> {
        self.regs.read_register(SCRATCH1_REGISTER).await
    }

    pub async fn read_scratch2(&mut self) -> Result<u32> {
        self.regs.read_register(SCRATCH2_REGISTER).await
    }

    pub async fn write_scratch1(&mut self, value: u32) -> Result<()> {
        self.regs.write_register(SCRATCH1_REGISTER, value).await
    }

    pub async fn write_scratch2(&mut self, value: u32) -> Result<()> {
        self.regs.write_register(SCRATCH2_REGISTER, value).await
    }

    async fn read_recv_status(&mut self) -> Result<Option<u32>> {
        read_checked(
            &mut self.regs,
            RECV_STATUS_REGISTER,
            RECV_STATUS_REGISTER_SEED,
            self.config.read_timeout,
        )
        .await
    }

    async fn write_recv_status(&mut self, value: u32) -> Result<()> {
        write_stamped(
            &mut self.regs,
            RECV_STATUS_REGISTER,
            RECV_STATUS_REGISTER_SEED,
            value,
        )
        .await
    }

    async fn read_send_status(&mut self) -> Result<Option<u32>> {
        read_checked(
            &mut self.regs,
            SEND_STATUS_REGISTER,
            SEND_STATUS_REGISTER_SEED,
            self.config.read_timeout,
        )
        .await
    }

    async fn write_send_status(&mut self, value: u32) -> Result<()> {
        write_stamped(
            &mut self.regs,
            SEND_STATUS_REGISTER,
            SEND_STATUS_REGISTER_SEED,
            value,
        )
        .await
    }

    /// Send one packet to the target.
    ///
    /// Returns `false` if the target did not take it before the packet deadline. The
    /// target may rewind the transfer to any location, and is trusted on it.
    pub async fn send_packet(&mut self, data: &[u8]) -> Result<bool> {
        let length = data.len();
        if length > MAX_PACKET_LENGTH {
            return Err(ValidationError::PacketTooLong {
                size: length,
                max: MAX_PACKET_LENGTH,
            }
            .into());
        }

        let deadline = Instant::now() + self.config.packet_deadline;

        // Agree on the length. Any transfer of another length is cancelled first.
        let mut sent_length = false;
        loop {
            if Instant::now() > deadline {
                debug!(length, "Timed out negotiating packet send");
                return Ok(false);
            }
            let Some(status) = self.read_recv_status().await? else {
                return Ok(false);
            };

            let pending = status_length(status);
            if pending == 0 {
                self.write_recv_status(((length as u32) << 12) & 0xFF_F000)
                    .await?;
                sent_length = true;
            } else if !sent_length || pending != length {
                self.write_recv_status(0).await?;
                sent_length = false;
            } else {
                break;
            }
        }

        let mut location = 0;
        loop {
            while location < length {
                let mut word = ((location / 3 + 1) as u32) << 24;
                for shift in [16, 8, 0] {
                    if location < length {
                        word |= u32::from(data[location]) << shift;
                        location += 1;
                    }
                }
                self.regs.write_register(DATA_REGISTER, word).await?;
            }

            let Some(status) = self.read_recv_status().await? else {
                return Ok(false);
            };
            let pending = status_length(status);
            location = status_location(status);

            if pending == 0 && location == 0 {
                trace!(length, "Packet sent");
                return Ok(true);
            }
            if pending != length {
                return Err(MessageError::Desync(format!(
                    "target reports length {pending} while sending {length}"
                ))
                .into());
            }
            if Instant::now() > deadline {
                debug!(length, location, "Timed out sending packet data");
                return Ok(false);
            }
            trace!(location, "Target rewound packet");
        }
    }

    /// Receive one packet from the target, if it has one.
    pub async fn receive_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(status) = self.read_send_status().await? else {
            return Ok(None);
        };
        let length = status_length(status);
        if length == 0 {
            return Ok(None);
        }

        // A transfer interrupted earlier restarts from the beginning.
        if status_location(status) > 0 {
            self.write_send_status(0).await?;
        }

        let mut data: Vec<Option<u8>> = vec![None; length];
        let mut missing = length;
        let mut empty_reads = 0;
        let mut last_progress = Instant::now();

        while missing > 0 {
            let word = self.regs.read_register(DATA_REGISTER).await?;
            let index = (word >> 24) & 0xFF;

            if index == 0x00 || index == 0xFF {
                empty_reads += 1;
                if empty_reads > self.config.max_empty_reads {
                    // Ask the target to resume from the first hole.
                    let resume = data.iter().position(Option::is_none).unwrap_or(0);
                    trace!(resume, "Requesting resend");
                    self.write_send_status((resume & 0xFFF) as u32).await?;
                    empty_reads = 0;
                }
                if last_progress.elapsed() > self.config.read_timeout {
                    debug!(length, missing, "Gave up waiting for packet data");
                    return Ok(None);
                }
                tokio::task::yield_now().await;
                continue;
            }

            let base = (index as usize - 1) * 3;
            for (offset, shift) in [16u32, 8, 0].into_iter().enumerate() {
                let actual = base + offset;
                if actual < length && data[actual].is_none() {
                    data[actual] = Some(((word >> shift) & 0xFF) as u8);
                    missing -= 1;
                    last_progress = Instant::now();
                }
            }
        }

        self.write_send_status((length & 0xFFF) as u32).await?;
        Ok(Some(data.into_iter().flatten().collect()))
    }

    /// Send a message, returning the sequence number it used.
    ///
    /// A failed send still consumes its sequence number.
    pub async fn send_message(&mut self, message: &Message) -> Result<u16> {
        if message.data.len() > MAX_MESSAGE_LENGTH {
            return Err(ValidationError::MessageTooLong {
                size: message.data.len(),
                max: MAX_MESSAGE_LENGTH,
            }
            .into());
        }

        let target = self
            .read_config()
            .await?
            .ok_or(MessageError::ConfigUnavailable)?;
        if !target.message_protocol {
            return Err(MessageError::ProtocolNotRunning.into());
        }

        let mut msgid = message.id & !COMPRESSED_FLAG;
        let packed = if target.zlib {
            compress(&message.data)
        } else {
            None
        };
        let payload = match &packed {
            Some(packed) => {
                trace!(from = message.data.len(), to = packed.len(), "Compressed message");
                msgid |= COMPRESSED_FLAG;
                packed.as_slice()
            }
            None => message.data.as_slice(),
        };

        let sequence = self.send_sequence.take();
        let started = Instant::now();
        for fragment in split(msgid, sequence, payload) {
            if !self.send_packet(&fragment).await? {
                warn!(
                    sequence,
                    elapsed = ?started.elapsed(),
                    "Message fragment not accepted by target"
                );
                return Err(MessageError::SendFailed(sequence).into());
            }
        }

        debug!(
            id = format_args!("{:#06x}", message.id),
            sequence,
            length = message.data.len(),
            elapsed = ?started.elapsed(),
            "Sent message"
        );
        Ok(sequence)
    }

    /// Receive the next message in sequence, if one is ready.
    pub async fn receive_message(&mut self) -> Result<Option<Message>> {
        let Some(target) = self.read_config().await? else {
            return Ok(None);
        };
        if !target.message_protocol {
            return Err(MessageError::ProtocolNotRunning.into());
        }

        let raw = loop {
            if let Some(raw) = self.reassembler.poll_ready(Instant::now()) {
                break raw;
            }

            match self.receive_packet().await? {
                Some(packet) => self.reassembler.insert(&packet, Instant::now())?,
                None => {
                    if self.reassembler.resync_idle() {
                        continue;
                    }
                    return Ok(None);
                }
            }
        };

        let (id, data) = if raw.msgid & COMPRESSED_FLAG != 0 {
            (raw.msgid & !COMPRESSED_FLAG, decompress(&raw.payload)?)
        } else {
            (raw.msgid, raw.payload)
        };

        debug!(
            id = format_args!("{id:#06x}"),
            sequence = raw.sequence,
            length = data.len(),
            "Received message"
        );
        Ok(Some(Message { id, data }))
    }
}
