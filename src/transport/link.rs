//! Request/response link to a single NetDimm.

use std::net::{IpAddr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use super::LinkConfig;
use crate::error::{Error, ProtocolError, Result, TransportError, ValidationError};
use crate::protocol::{
    NetDimmCodec, Packet, PacketId, CHUNK_HEADER_SIZE, CRC_STATUS_ADDRESS, FLAG_LAST_CHUNK,
    FLAG_UPLOAD, GAME_SIZE_ADDRESS,
};
use crate::types::{CrcStatus, FirmwareVersion, NetDimmTarget, PeekPokeWidth, TransferInfo};

/// Minutes a rebooted target may run before the firmware takes over again.
pub const DEFAULT_TIME_LIMIT_MINUTES: u32 = 10;

/// Client for one NetDimm.
///
/// Every public operation runs inside [`NetDimmLink::connect`], so it either reuses an
/// already open connection or opens one for its own duration and closes it on every exit
/// path.
pub struct NetDimmLink {
    addr: SocketAddr,
    target: NetDimmTarget,
    version: FirmwareVersion,
    io_timeout: Duration,
    config: LinkConfig,
    conn: Option<Framed<TcpStream, NetDimmCodec>>,
    /// Size of a download request whose response stream was not fully drained.
    pending_download: Option<u32>,
}

impl std::fmt::Debug for NetDimmLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetDimmLink")
            .field("addr", &self.addr)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("io_timeout", &self.io_timeout)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl NetDimmLink {
    /// Create a link. No I/O happens until the first request.
    pub fn new(ip: IpAddr, target: NetDimmTarget, config: LinkConfig) -> Self {
        Self {
            addr: SocketAddr::new(ip, config.port),
            target,
            version: FirmwareVersion::Unknown,
            io_timeout: config.io_timeout_for(target),
            config,
            conn: None,
            pending_download: None,
        }
    }

    /// Seed the firmware version when it is known in advance.
    pub fn with_version(mut self, version: FirmwareVersion) -> Self {
        self.version = version;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn target(&self) -> NetDimmTarget {
        self.target
    }

    /// Firmware version reported by the most recent [`NetDimmLink::info`].
    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Enter a connection scope.
    ///
    /// If a connection is already open this is a no-op and the scope leaves it open.
    /// Otherwise a connection is opened, and closed again when the returned scope drops.
    pub async fn connect(&mut self) -> Result<ConnectionScope<'_>> {
        let owned = if self.conn.is_some() {
            false
        } else {
            self.establish().await?;
            true
        };
        Ok(ConnectionScope { link: self, owned })
    }

    /// Open a connection that outlives individual operations until [`NetDimmLink::close`].
    pub async fn open(&mut self) -> Result<()> {
        if self.conn.is_none() {
            self.establish().await?;
        }
        Ok(())
    }

    /// Close the connection, if any.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(addr = %self.addr, "Closed NetDimm connection");
        }
        self.pending_download = None;
    }

    async fn establish(&mut self) -> Result<()> {
        let addr = self.addr;
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(|e| Error::ConnectionFailed {
                addr,
                reason: e.to_string(),
            })?;

        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        self.conn = Some(Framed::new(stream, NetDimmCodec::new()));
        self.pending_download = None;

        // A NOP the firmware accepts silently. Anything else listening on the port is
        // likely to drop the connection here.
        if let Err(e) = self.send_packet(Packet::empty(PacketId::Startup)).await {
            self.close();
            return Err(e);
        }

        debug!(%addr, timeout = ?self.io_timeout, "Connected to NetDimm");
        Ok(())
    }

    /// Get firmware info, CRC status, image size and control word.
    pub async fn info(&mut self) -> Result<TransferInfo> {
        let mut link = self.connect().await?;
        let info = link.get_information().await?;
        link.version = info.firmware_version;
        Ok(info)
    }

    /// Read a single byte/short/long from target memory.
    pub async fn peek(&mut self, addr: u32, width: PeekPokeWidth) -> Result<u32> {
        width.validate(addr)?;
        let mut link = self.connect().await?;
        link.host_peek(addr, width).await
    }

    /// Write a single byte/short/long to target memory.
    pub async fn poke(&mut self, addr: u32, width: PeekPokeWidth, value: u32) -> Result<()> {
        width.validate(addr)?;
        let mut link = self.connect().await?;
        link.host_poke(addr, width, value).await
    }

    /// Restart the target into the loaded image and bound how long it may run.
    pub async fn reboot(&mut self) -> Result<()> {
        let mut link = self.connect().await?;
        link.send_packet(Packet::empty(PacketId::Restart)).await?;
        link.send_time_limit(DEFAULT_TIME_LIMIT_MINUTES).await
    }

    /// Set the run time limit in minutes.
    pub async fn set_time_limit(&mut self, minutes: u32) -> Result<()> {
        let mut link = self.connect().await?;
        link.send_time_limit(minutes).await
    }

    /// Read the BIOS control word of the host board.
    pub async fn control_read(&mut self) -> Result<u32> {
        let mut link = self.connect().await?;
        link.host_control_read().await
    }

    /// Current host mode. 1 means "now loading" was requested, 2 means the screen shows
    /// it without a transfer, 10 and 20 mean a transfer is under way.
    pub async fn host_mode(&mut self) -> Result<u8> {
        self.exchange_mode(PacketId::HostMode, "host mode", 0xFF, 0).await
    }

    /// Set host mode bits, returning the resulting mode.
    pub async fn set_host_mode(&mut self, mode: u8) -> Result<u8> {
        self.exchange_mode(PacketId::HostMode, "host mode", 0, mode).await
    }

    pub async fn dimm_mode(&mut self) -> Result<u8> {
        self.exchange_mode(PacketId::DimmMode, "dimm mode", 0xFF, 0).await
    }

    /// Set DIMM mode bits, returning the resulting mode. The value persists across
    /// power cycles with no observable effect.
    pub async fn set_dimm_mode(&mut self, mode: u8) -> Result<u8> {
        self.exchange_mode(PacketId::DimmMode, "dimm mode", 0, mode).await
    }

    /// Masked read-modify-write: the device computes `(old & mask) | set` and answers
    /// with the result.
    async fn exchange_mode(
        &mut self,
        id: PacketId,
        request: &'static str,
        mask: u8,
        set: u8,
    ) -> Result<u8> {
        let mut link = self.connect().await?;
        let word = (u32::from(mask) << 8) | u32::from(set);
        link.send_packet(Packet::new(id, 0, word.to_le_bytes().to_vec())?)
            .await?;

        let response = link.recv_response(request, id.into(), 4).await?;
        Ok((LittleEndian::read_u32(&response.payload) & 0xFF) as u8)
    }

    /// Receive the response to `request` and check its id and length. A mismatch drops
    /// the connection, the stream position is no longer known.
    async fn recv_response(
        &mut self,
        request: &'static str,
        expected_id: u8,
        expected_len: usize,
    ) -> Result<Packet> {
        let response = self.recv_packet().await?;
        if let Err(e) = check_response(&response, request, expected_id, expected_len) {
            if e.should_reconnect() {
                self.close();
            }
            return Err(e);
        }
        Ok(response)
    }

    async fn get_information(&mut self) -> Result<TransferInfo> {
        self.send_packet(Packet::empty(PacketId::GetInfo)).await?;

        let response = self.recv_response("get info", PacketId::GetInfo.into(), 12).await?;

        let payload = &response.payload;
        // payload[0..2] is constant 0xC on every observed firmware and unused.
        let version = LittleEndian::read_u16(&payload[2..4]);
        let game_memory = LittleEndian::read_u16(&payload[4..6]);
        let dimm_memory = LittleEndian::read_u16(&payload[6..8]);
        let crc = LittleEndian::read_u32(&payload[8..12]);

        // Status and size are separate reads, the firmware has no atomic view of them.
        let mut crc_status = CrcStatus::from_wire(self.download_word(CRC_STATUS_ADDRESS).await?);
        let game_size = self.download_word(GAME_SIZE_ADDRESS).await?;
        if game_size == 0 && crc == 0 && crc_status == CrcStatus::Valid {
            // Stamped by an earlier transfer that was then interrupted.
            crc_status = CrcStatus::Invalid;
        }

        let control_address = self.host_control_read().await?;

        Ok(TransferInfo {
            current_game_crc: crc,
            current_game_size: game_size,
            game_crc_status: crc_status,
            memory_size: u32::from(dimm_memory),
            firmware_version: FirmwareVersion::from_wire(version),
            available_game_memory: u32::from(game_memory) << 20,
            control_address,
        })
    }

    async fn host_peek(&mut self, addr: u32, width: PeekPokeWidth) -> Result<u32> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[0..4], addr);
        LittleEndian::write_u32(&mut payload[4..8], width.wire());
        self.send_packet(Packet::new(PacketId::Peek, 0, payload.to_vec())?)
            .await?;

        let response = self.recv_response("peek", PacketId::Peek.into(), 8).await?;
        Ok(LittleEndian::read_u32(&response.payload[4..8]))
    }

    async fn host_poke(&mut self, addr: u32, width: PeekPokeWidth, value: u32) -> Result<()> {
        let mut payload = [0u8; 12];
        LittleEndian::write_u32(&mut payload[0..4], addr);
        LittleEndian::write_u32(&mut payload[4..8], width.wire());
        LittleEndian::write_u32(&mut payload[8..12], value);
        self.send_packet(Packet::new(PacketId::Poke, 0, payload.to_vec())?)
            .await
    }

    async fn host_control_read(&mut self) -> Result<u32> {
        self.send_packet(Packet::empty(PacketId::ControlRead)).await?;

        // Answered with the peek id.
        let response = self.recv_response("control read", PacketId::Peek.into(), 8).await?;
        Ok(LittleEndian::read_u32(&response.payload[4..8]))
    }

    async fn send_time_limit(&mut self, minutes: u32) -> Result<()> {
        self.send_packet(Packet::new(
            PacketId::SetTimeLimit,
            0,
            minutes.to_le_bytes().to_vec(),
        )?)
        .await
    }

    /// Set the transfer key. All zeroes disables decryption on the device.
    pub(crate) async fn set_key_code(&mut self, key: &[u8]) -> Result<()> {
        if key.len() != 8 {
            return Err(ValidationError::InvalidKeyLength(key.len()).into());
        }
        self.send_packet(Packet::new(PacketId::SetKey, 0, key.to_vec())?)
            .await
    }

    /// Stamp the current image crc and length.
    pub(crate) async fn set_information(&mut self, crc: u32, length: u32) -> Result<()> {
        let mut payload = [0u8; 12];
        LittleEndian::write_u32(&mut payload[0..4], crc);
        LittleEndian::write_u32(&mut payload[4..8], length);
        self.send_packet(Packet::new(PacketId::SetInfo, 0, payload.to_vec())?)
            .await
    }

    /// Upload one chunk to DIMM or system memory.
    pub(crate) async fn upload(
        &mut self,
        sequence: u32,
        addr: u32,
        data: &[u8],
        last_chunk: bool,
    ) -> Result<()> {
        let mut payload = vec![0u8; CHUNK_HEADER_SIZE + data.len()];
        LittleEndian::write_u32(&mut payload[0..4], sequence);
        LittleEndian::write_u32(&mut payload[4..8], addr);
        // payload[8..10] is reserved and ignored by the firmware
        payload[CHUNK_HEADER_SIZE..].copy_from_slice(data);

        let flags = if last_chunk {
            FLAG_UPLOAD | FLAG_LAST_CHUNK
        } else {
            FLAG_UPLOAD
        };
        self.send_packet(Packet::new(PacketId::Upload, flags, payload)?)
            .await
    }

    /// Download `size` bytes starting at `addr`. The firmware splits large reads into
    /// several responses and flags the final one.
    pub(crate) async fn download(&mut self, addr: u32, size: u32) -> Result<Vec<u8>> {
        if let Some(pending) = self.pending_download.take() {
            if pending != size {
                debug!(addr, pending, size, "Cancelling outstanding download");
                self.send_download_request(addr, 0).await?;
            }
        }

        self.send_download_request(addr, size).await?;
        self.pending_download = Some(size);

        let mut data = Vec::with_capacity(size as usize);
        loop {
            let chunk = self.recv_packet().await?;
            // The firmware reuses the upload id for download responses.
            if chunk.id != u8::from(PacketId::Upload) {
                return Err(ProtocolError::UnexpectedPacketId {
                    request: "download",
                    expected: PacketId::Upload.into(),
                    got: chunk.id,
                }
                .into());
            }
            if chunk.payload.len() <= CHUNK_HEADER_SIZE {
                return Err(ProtocolError::UnexpectedLength {
                    request: "download",
                    expected: CHUNK_HEADER_SIZE + 1,
                    got: chunk.payload.len(),
                }
                .into());
            }

            // The sequence always arrives in order, so only the data matters.
            data.extend_from_slice(&chunk.payload[CHUNK_HEADER_SIZE..]);
            if chunk.is_last_chunk() {
                break;
            }
        }

        self.pending_download = None;
        trace!(addr, size, received = data.len(), "Download complete");
        Ok(data)
    }

    async fn send_download_request(&mut self, addr: u32, size: u32) -> Result<()> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[0..4], addr);
        LittleEndian::write_u32(&mut payload[4..8], size);
        self.send_packet(Packet::new(PacketId::Download, 0, payload.to_vec())?)
            .await
    }

    async fn download_word(&mut self, addr: u32) -> Result<u32> {
        let data = self.download(addr, 4).await?;
        if data.len() != 4 {
            return Err(ProtocolError::UnexpectedLength {
                request: "download",
                expected: 4,
                got: data.len(),
            }
            .into());
        }
        Ok(LittleEndian::read_u32(&data))
    }

    /// Send one packet. A failed or timed out write drops the connection.
    pub(crate) async fn send_packet(&mut self, packet: Packet) -> Result<()> {
        let io_timeout = self.io_timeout;
        let conn = self.conn.as_mut().ok_or(Error::NotConnected)?;
        trace!(id = packet.id, flags = packet.flags, len = packet.payload.len(), "-> packet");

        let result = timeout(io_timeout, conn.send(packet)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.close();
                Err(TransportError::SendFailed(e.to_string()).into())
            }
            Err(_) => {
                self.close();
                Err(TransportError::SendFailed(format!("timed out after {io_timeout:?}")).into())
            }
        }
    }

    /// Receive one packet. A failed or timed out read drops the connection.
    pub(crate) async fn recv_packet(&mut self) -> Result<Packet> {
        let io_timeout = self.io_timeout;
        let conn = self.conn.as_mut().ok_or(Error::NotConnected)?;

        let result = timeout(io_timeout, conn.next()).await;
        match result {
            Ok(Some(Ok(packet))) => {
                trace!(id = packet.id, flags = packet.flags, len = packet.payload.len(), "<- packet");
                Ok(packet)
            }
            Ok(Some(Err(e))) => {
                self.close();
                Err(TransportError::ReceiveFailed(e.to_string()).into())
            }
            Ok(None) => {
                self.close();
                Err(Error::ConnectionClosed)
            }
            Err(_) => {
                self.close();
                Err(TransportError::ReceiveTimeout(io_timeout).into())
            }
        }
    }
}

/// Check a response against the expected id and payload length.
fn check_response(
    packet: &Packet,
    request: &'static str,
    expected_id: u8,
    expected_len: usize,
) -> Result<()> {
    if packet.id != expected_id {
        return Err(ProtocolError::UnexpectedPacketId {
            request,
            expected: expected_id,
            got: packet.id,
        }
        .into());
    }
    if packet.payload.len() != expected_len {
        return Err(ProtocolError::UnexpectedLength {
            request,
            expected: expected_len,
            got: packet.payload.len(),
        }
        .into());
    }
    Ok(())
}

/// A connection scope handed out by [`NetDimmLink::connect`].
///
/// Dereferences to the link. Closes the connection on drop only if this scope opened
/// it.
pub struct ConnectionScope<'a> {
    link: &'a mut NetDimmLink,
    owned: bool,
}

impl ConnectionScope<'_> {
    /// Whether this scope opened the connection it runs on.
    pub fn owns_connection(&self) -> bool {
        self.owned
    }
}

impl Deref for ConnectionScope<'_> {
    type Target = NetDimmLink;

    fn deref(&self) -> &Self::Target {
        self.link
    }
}

impl DerefMut for ConnectionScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.link
    }
}

impl Drop for ConnectionScope<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.link.close();
        }
    }
}
