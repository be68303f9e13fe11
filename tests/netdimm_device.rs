//! End-to-end tests against an in-process NetDimm.
//!
//! `FakeNetDimm` answers the wire protocol on a loopback port and keeps just enough
//! device state to check what the client put on the wire.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};
use tokio_util::codec::Framed;

use netboot::cabinet::{Cabinet, CabinetHost, CabinetState, GameSelection};
use netboot::crypto::ChunkCipher;
use netboot::error::{ProtocolError, TransportError};
use netboot::host::{Host, HostOptions, HostStatus, ImageSettings, LivenessProbe};
use netboot::protocol::{
    NetDimmCodec, Packet, PacketId, CHUNK_HEADER_SIZE, CHUNK_SIZE, CRC_CHECK_ADDRESS,
    CRC_STATUS_ADDRESS, GAME_INFO_ADDRESS, GAME_SIZE_ADDRESS,
};
use netboot::transfer::{image_crc, SendOptions};
use netboot::transport::{LinkConfig, NetDimmLink};
use netboot::{CrcStatus, Error, FirmwareVersion, NetDimmTarget, PeekPokeWidth};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const FIRMWARE_WORD: u16 = 0x0401;
const GAME_MEMORY_MIB: u16 = 512;
const DIMM_MEMORY_MIB: u16 = 512;
const CONTROL_WORD: u32 = 0x0000_8A00;

/// Download responses are split into pieces this large.
const DOWNLOAD_PIECE: usize = 0x1000;

// ============================================================================
// Fake device
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UploadRecord {
    sequence: u32,
    addr: u32,
    len: usize,
    last: bool,
}

#[derive(Debug)]
struct DeviceState {
    memory: Vec<u8>,
    crc_status: u32,
    game_crc: u32,
    game_size: u32,
    crc_check: Vec<u8>,
    key: Option<Vec<u8>>,
    host_mode: u8,
    dimm_mode: u8,
    time_limit: Option<u32>,
    restarts: u32,
    registers: HashMap<u32, u32>,
    uploads: Vec<UploadRecord>,
    connections: u32,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            memory: Vec::new(),
            // A freshly powered board with no image fails its check.
            crc_status: 3,
            game_crc: 0,
            game_size: 0,
            crc_check: Vec::new(),
            key: None,
            host_mode: 0,
            dimm_mode: 0,
            time_limit: None,
            restarts: 0,
            registers: HashMap::new(),
            uploads: Vec::new(),
            connections: 0,
        }
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        if self.memory.len() < end {
            self.memory.resize(end, 0);
        }
        self.memory[start..end].copy_from_slice(data);
    }

    fn read_memory(&self, addr: u32, size: usize) -> Vec<u8> {
        let start = addr as usize;
        (start..start + size)
            .map(|i| self.memory.get(i).copied().unwrap_or(0))
            .collect()
    }

    /// CRC status word after a restart.
    fn verify(&self) -> u32 {
        let size = self.game_size as usize;
        if self.crc_check.len() >= 8 && self.crc_check[..8].iter().all(|&b| b == 0xFF) {
            5
        } else if size == 0 || self.memory.len() < size {
            3
        } else if !crc32fast::hash(&self.memory[..size]) == self.game_crc {
            2
        } else {
            3
        }
    }

    fn handle(&mut self, packet: Packet) -> Vec<Packet> {
        let p = &packet.payload;
        match PacketId::from_u8(packet.id) {
            Some(PacketId::Upload) => {
                let sequence = LittleEndian::read_u32(&p[0..4]);
                let addr = LittleEndian::read_u32(&p[4..8]);
                let data = &p[CHUNK_HEADER_SIZE..];
                self.uploads.push(UploadRecord {
                    sequence,
                    addr,
                    len: data.len(),
                    last: packet.is_last_chunk(),
                });
                match addr {
                    GAME_INFO_ADDRESS => {
                        self.game_crc = 0;
                        self.game_size = 0;
                    }
                    CRC_CHECK_ADDRESS => self.crc_check = data.to_vec(),
                    _ => {
                        let data = data.to_vec();
                        self.write_memory(addr, &data);
                        self.crc_status = 1;
                    }
                }
                vec![]
            }
            Some(PacketId::Download) => {
                let addr = LittleEndian::read_u32(&p[0..4]);
                let size = LittleEndian::read_u32(&p[4..8]) as usize;
                if size == 0 {
                    return vec![];
                }
                let data = match addr {
                    CRC_STATUS_ADDRESS => self.crc_status.to_le_bytes().to_vec(),
                    GAME_SIZE_ADDRESS => self.game_size.to_le_bytes().to_vec(),
                    _ => self.read_memory(addr, size),
                };
                let count = data.chunks(DOWNLOAD_PIECE).count();
                data.chunks(DOWNLOAD_PIECE)
                    .enumerate()
                    .map(|(i, piece)| {
                        let mut payload = vec![0u8; CHUNK_HEADER_SIZE];
                        LittleEndian::write_u32(&mut payload[0..4], i as u32 + 1);
                        LittleEndian::write_u32(
                            &mut payload[4..8],
                            addr.wrapping_add((i * DOWNLOAD_PIECE) as u32),
                        );
                        payload.extend_from_slice(piece);
                        let flags = if i + 1 == count { 0x01 } else { 0 };
                        Packet::new(PacketId::Upload, flags, payload).unwrap()
                    })
                    .collect()
            }
            Some(id @ (PacketId::HostMode | PacketId::DimmMode)) => {
                let word = LittleEndian::read_u32(p);
                let mask = ((word >> 8) & 0xFF) as u8;
                let set = (word & 0xFF) as u8;
                let mode = if id == PacketId::HostMode {
                    &mut self.host_mode
                } else {
                    &mut self.dimm_mode
                };
                *mode = (*mode & mask) | set;
                vec![Packet::new(id, 0, u32::from(*mode).to_le_bytes().to_vec()).unwrap()]
            }
            Some(PacketId::Restart) => {
                self.restarts += 1;
                self.crc_status = self.verify();
                vec![]
            }
            Some(PacketId::Peek) => {
                let addr = LittleEndian::read_u32(&p[0..4]);
                let value = self.registers.get(&addr).copied().unwrap_or(0);
                vec![peek_response(value)]
            }
            Some(PacketId::Poke) => {
                let addr = LittleEndian::read_u32(&p[0..4]);
                let value = LittleEndian::read_u32(&p[8..12]);
                self.registers.insert(addr, value);
                vec![]
            }
            Some(PacketId::ControlRead) => vec![peek_response(CONTROL_WORD)],
            Some(PacketId::SetTimeLimit) => {
                self.time_limit = Some(LittleEndian::read_u32(p));
                vec![]
            }
            Some(PacketId::GetInfo) => {
                let mut payload = vec![0u8; 12];
                LittleEndian::write_u16(&mut payload[0..2], 0xC);
                LittleEndian::write_u16(&mut payload[2..4], FIRMWARE_WORD);
                LittleEndian::write_u16(&mut payload[4..6], GAME_MEMORY_MIB);
                LittleEndian::write_u16(&mut payload[6..8], DIMM_MEMORY_MIB);
                LittleEndian::write_u32(&mut payload[8..12], self.game_crc);
                vec![Packet::new(PacketId::GetInfo, 0, payload).unwrap()]
            }
            Some(PacketId::SetInfo) => {
                self.game_crc = LittleEndian::read_u32(&p[0..4]);
                self.game_size = LittleEndian::read_u32(&p[4..8]);
                vec![]
            }
            Some(PacketId::SetKey) => {
                self.key = Some(p.clone());
                vec![]
            }
            Some(PacketId::Startup) | None => vec![],
        }
    }
}

fn peek_response(value: u32) -> Packet {
    let mut payload = vec![0u8; 8];
    LittleEndian::write_u32(&mut payload[0..4], 1);
    LittleEndian::write_u32(&mut payload[4..8], value);
    Packet::new(PacketId::Peek, 0, payload).unwrap()
}

struct FakeNetDimm {
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
}

impl FakeNetDimm {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(DeviceState::new()));

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });

        Self { addr, state }
    }

    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            port: self.addr.port(),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Some(Duration::from_secs(2)),
        }
    }

    fn link(&self) -> NetDimmLink {
        NetDimmLink::new(LOCALHOST, NetDimmTarget::Naomi, self.link_config())
    }

    fn host_options(&self) -> HostOptions {
        HostOptions {
            link: self.link_config(),
            control_timeout: Duration::from_secs(2),
            liveness_debounce: 1,
            ..HostOptions::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<DeviceState>>) {
    state.lock().connections += 1;
    let mut framed = Framed::new(stream, NetDimmCodec::new());
    while let Some(Ok(packet)) = framed.next().await {
        let responses = state.lock().handle(packet);
        for response in responses {
            if framed.send(response).await.is_err() {
                return;
            }
        }
    }
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

fn write_image(dir: &Path, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join("game.bin");
    std::fs::write(&path, data).unwrap();
    path
}

// ============================================================================
// Info and Control
// ============================================================================

#[tokio::test]
async fn test_info_reports_device_state() {
    let device = FakeNetDimm::start().await;
    {
        let mut state = device.state();
        state.crc_status = 2;
        state.game_crc = 0x1234_5678;
        state.game_size = 0x100;
    }

    let mut link = device.link();
    let info = link.info().await.unwrap();

    assert_eq!(info.game_crc_status, CrcStatus::Valid);
    assert_eq!(info.current_game_crc, 0x1234_5678);
    assert_eq!(info.current_game_size, 0x100);
    assert_eq!(info.firmware_version, FirmwareVersion::V4_01);
    assert_eq!(info.memory_size, u32::from(DIMM_MEMORY_MIB));
    assert_eq!(info.available_game_memory, u32::from(GAME_MEMORY_MIB) << 20);
    assert_eq!(info.control_address, CONTROL_WORD);

    assert_eq!(link.version(), FirmwareVersion::V4_01);
    assert!(!link.is_connected(), "One-shot operations close their connection");
}

#[tokio::test]
async fn test_info_invalidates_interrupted_stamp() {
    let device = FakeNetDimm::start().await;
    device.state().crc_status = 2;

    let info = device.link().info().await.unwrap();
    assert_eq!(info.game_crc_status, CrcStatus::Invalid);
}

#[tokio::test]
async fn test_peek_poke() {
    let device = FakeNetDimm::start().await;
    let mut link = device.link();

    link.poke(0xC0DE50, PeekPokeWidth::Long, 0xDEAD_BEEF)
        .await
        .unwrap();
    let value = link.peek(0xC0DE50, PeekPokeWidth::Long).await.unwrap();
    assert_eq!(value, 0xDEAD_BEEF);
    assert_eq!(device.state().registers.get(&0xC0DE50), Some(&0xDEAD_BEEF));
}

#[tokio::test]
async fn test_open_connection_is_reused() {
    let device = FakeNetDimm::start().await;
    let mut link = device.link();

    link.open().await.unwrap();
    link.info().await.unwrap();
    link.peek(0xC0DE10, PeekPokeWidth::Long).await.unwrap();
    link.control_read().await.unwrap();
    assert!(link.is_connected());
    link.close();

    assert_eq!(device.state().connections, 1);

    link.info().await.unwrap();
    link.info().await.unwrap();
    assert_eq!(device.state().connections, 3);
}

#[tokio::test]
async fn test_mode_exchange() {
    let device = FakeNetDimm::start().await;
    let mut link = device.link();

    assert_eq!(link.set_host_mode(1).await.unwrap(), 1);
    assert_eq!(link.host_mode().await.unwrap(), 1);
    assert_eq!(link.set_dimm_mode(4).await.unwrap(), 4);
    assert_eq!(link.dimm_mode().await.unwrap(), 4);
    assert_eq!(device.state().host_mode, 1);
}

#[tokio::test]
async fn test_set_time_limit() {
    let device = FakeNetDimm::start().await;
    device.link().set_time_limit(30).await.unwrap();
    assert_eq!(device.state().time_limit, Some(30));
}

// ============================================================================
// Image Transfer
// ============================================================================

#[tokio::test]
async fn test_send_uploads_and_stamps_image() {
    let device = FakeNetDimm::start().await;
    let image = test_image(CHUNK_SIZE * 2 + 0x123);
    let total = image.len() as u64;

    let mut progress = Vec::new();
    device
        .link()
        .send(&image, &SendOptions::default(), |sent, total| {
            progress.push((sent, total));
        })
        .await
        .unwrap();

    let state = device.state();
    assert_eq!(state.host_mode, 1, "Now loading requested");
    assert_eq!(state.key.as_deref(), Some(&[0u8; 8][..]));
    assert_eq!(state.crc_check, vec![0u8; 16]);

    let expected = vec![
        UploadRecord { sequence: 1, addr: CRC_CHECK_ADDRESS, len: 16, last: true },
        UploadRecord { sequence: 1, addr: GAME_INFO_ADDRESS, len: 32, last: false },
        UploadRecord { sequence: 2, addr: 0, len: CHUNK_SIZE, last: false },
        UploadRecord { sequence: 3, addr: CHUNK_SIZE as u32, len: CHUNK_SIZE, last: false },
        UploadRecord { sequence: 4, addr: 2 * CHUNK_SIZE as u32, len: 0x123, last: true },
    ];
    assert_eq!(state.uploads, expected);

    assert_eq!(&state.memory[..image.len()], image.as_slice());
    assert_eq!(state.game_size, image.len() as u32);
    assert_eq!(state.game_crc, !crc32fast::hash(&image));

    assert_eq!(progress.first(), Some(&(0, total)));
    assert_eq!(progress.last(), Some(&(total, total)));
    assert_eq!(progress.len(), 5);
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[tokio::test]
async fn test_send_encrypted_without_crc_check() {
    let device = FakeNetDimm::start().await;
    let image = test_image(CHUNK_SIZE + 0x100);
    let key = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];

    let options = SendOptions {
        key: Some(key),
        disable_crc_check: true,
        disable_now_loading: true,
    };
    device
        .link()
        .send(&image, &options, |_, _| {})
        .await
        .unwrap();

    let state = device.state();
    assert_eq!(state.host_mode, 0);
    assert_eq!(state.key.as_deref(), Some(&key[..]));
    assert_eq!(&state.crc_check[..8], &[0xFF; 8]);
    assert_eq!(&state.crc_check[8..], &[0x00; 8]);

    let transmitted = state.memory[..image.len()].to_vec();
    assert_ne!(transmitted, image);
    // The stamp covers the bytes as transmitted.
    assert_eq!(state.game_crc, !crc32fast::hash(&transmitted));

    let cipher = ChunkCipher::new(&key);
    let mut decrypted = Vec::new();
    for chunk in transmitted.chunks(CHUNK_SIZE) {
        let mut chunk = chunk.to_vec();
        cipher.decrypt(&mut chunk);
        decrypted.extend_from_slice(&chunk);
    }
    assert_eq!(decrypted, image);
}

#[tokio::test]
async fn test_reboot_verifies_and_receive_reads_back() {
    let device = FakeNetDimm::start().await;
    let image = test_image(CHUNK_SIZE + 0x777);
    let mut link = device.link();

    link.send(&image, &SendOptions::default(), |_, _| {})
        .await
        .unwrap();
    link.reboot().await.unwrap();

    {
        let state = device.state();
        assert_eq!(state.restarts, 1);
        assert_eq!(state.time_limit, Some(10));
    }

    let info = link.info().await.unwrap();
    assert_eq!(info.game_crc_status, CrcStatus::Valid);
    assert_eq!(info.current_game_crc, image_crc(&image));

    let mut last = (0, 0);
    let received = link
        .receive(|sent, total| last = (sent, total))
        .await
        .unwrap();
    assert_eq!(received.as_deref(), Some(image.as_slice()));
    assert_eq!(last, (image.len() as u64, image.len() as u64));
}

#[tokio::test]
async fn test_receive_without_valid_image() {
    let device = FakeNetDimm::start().await;
    let received = device.link().receive(|_, _| {}).await.unwrap();
    assert!(received.is_none());
}

#[tokio::test]
async fn test_wipe_invalidates_current_game() {
    let device = FakeNetDimm::start().await;
    let image = test_image(0x400);
    let mut link = device.link();

    link.send(&image, &SendOptions::default(), |_, _| {})
        .await
        .unwrap();
    link.reboot().await.unwrap();
    assert_eq!(link.info().await.unwrap().game_crc_status, CrcStatus::Valid);

    link.wipe_current_game().await.unwrap();
    let info = link.info().await.unwrap();
    assert_eq!(info.current_game_size, 0);
    assert_eq!(info.current_game_crc, 0);
    assert_eq!(info.game_crc_status, CrcStatus::Invalid);
}

#[tokio::test]
async fn test_chunk_load_and_dump() {
    let device = FakeNetDimm::start().await;
    let data = test_image(CHUNK_SIZE + 0x1000);
    let mut link = device.link();

    link.send_chunk(0x1000, &data).await.unwrap();
    {
        let state = device.state();
        assert_eq!(
            state.uploads,
            vec![
                UploadRecord { sequence: 1, addr: 0x1000, len: CHUNK_SIZE, last: false },
                UploadRecord {
                    sequence: 2,
                    addr: 0x1000 + CHUNK_SIZE as u32,
                    len: 0x1000,
                    last: true,
                },
            ]
        );
        // Raw loads never touch the image stamp.
        assert_eq!(state.game_size, 0);
    }

    let dumped = link
        .receive_chunk(0x1000, data.len() as u32)
        .await
        .unwrap();
    assert_eq!(dumped, data);
}

// ============================================================================
// Error Handling
// ============================================================================

#[tokio::test]
async fn test_connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut link = NetDimmLink::new(
        LOCALHOST,
        NetDimmTarget::Naomi,
        LinkConfig {
            port,
            ..Default::default()
        },
    );

    let result = link.info().await;
    assert!(matches!(
        result,
        Err(Error::ConnectionFailed { .. } | Error::ConnectionTimeout)
    ));
    assert!(!link.is_connected());
}

#[tokio::test]
async fn test_unexpected_response_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Answers every request with a peek response.
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut framed = Framed::new(stream, NetDimmCodec::new());
            while let Some(Ok(packet)) = framed.next().await {
                if packet.id != u8::from(PacketId::Startup) {
                    let _ = framed.send(peek_response(0)).await;
                }
            }
        }
    });

    let mut link = NetDimmLink::new(
        LOCALHOST,
        NetDimmTarget::Naomi,
        LinkConfig {
            port,
            io_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        },
    );
    link.open().await.unwrap();
    assert!(link.is_connected());

    let err = link.info().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::UnexpectedPacketId { expected: 0x18, got: 0x10, .. })
    ));
    assert!(err.should_reconnect());
    assert!(!err.is_recoverable());
    // The stream is out of step, so even a persistent connection is dropped.
    assert!(!link.is_connected());
}

#[tokio::test]
async fn test_silent_device_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Reads everything, answers nothing.
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 256];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        }
    });

    let mut link = NetDimmLink::new(
        LOCALHOST,
        NetDimmTarget::Naomi,
        LinkConfig {
            port,
            io_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        },
    );
    let err = link.control_read().await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::ReceiveTimeout(_))));
    assert!(!link.is_connected());
}

// ============================================================================
// Host and Cabinet
// ============================================================================

struct AlwaysUp;

#[async_trait]
impl LivenessProbe for AlwaysUp {
    async fn probe(&self, _ip: IpAddr) -> bool {
        true
    }
}

async fn wait_for_status(host: &Host, wanted: HostStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while host.status() != wanted {
        assert!(Instant::now() < deadline, "host never reached {wanted}");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn run_until(cabinet: &Cabinet, wanted: CabinetState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while cabinet.tick().await != wanted {
        assert!(
            Instant::now() < deadline,
            "cabinet stuck in {} waiting for {wanted}",
            cabinet.state().0
        );
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_host_background_send() {
    let device = FakeNetDimm::start().await;
    let dir = tempfile::tempdir().unwrap();
    let image = test_image(CHUNK_SIZE * 3);
    let path = write_image(dir.path(), &image);

    let host = Host::new(LOCALHOST, device.host_options());
    host.send(&path, &[], &ImageSettings::new()).await.unwrap();
    wait_for_status(&host, HostStatus::Completed).await;
    assert!(host.progress().is_none());

    assert!(host.reboot().await.unwrap());
    let info = host.info().await.unwrap();
    assert_eq!(info.game_crc_status, CrcStatus::Valid);
    assert_eq!(
        info.current_game_crc,
        host.crc(&path, &[], &ImageSettings::new()).await.unwrap()
    );

    host.wipe().await;
    assert_eq!(device.state().game_size, 0);
}

#[tokio::test]
async fn test_cabinet_loads_and_verifies_game() {
    let device = FakeNetDimm::start().await;
    let dir = tempfile::tempdir().unwrap();
    let image = test_image(CHUNK_SIZE * 2 + 0x10);
    let path = write_image(dir.path(), &image);

    let host = Arc::new(Host::new(LOCALHOST, device.host_options()));
    host.start_liveness(Arc::new(AlwaysUp));
    let cabinet = Cabinet::new(
        LOCALHOST,
        "bench",
        NetDimmTarget::Naomi,
        FirmwareVersion::V4_01,
        Arc::clone(&host) as Arc<dyn CabinetHost>,
        GameSelection::new(&path),
    );

    run_until(&cabinet, CabinetState::WaitPowerOff).await;

    let state = device.state();
    assert_eq!(state.restarts, 1);
    assert_eq!(state.game_crc, image_crc(&image));
    assert_eq!(&state.memory[..image.len()], image.as_slice());
    drop(state);

    assert_eq!(cabinet.status().progress, 0);
    host.stop_liveness();
}

#[tokio::test]
async fn test_cabinet_skips_game_already_running() {
    let device = FakeNetDimm::start().await;
    let dir = tempfile::tempdir().unwrap();
    let image = test_image(0x2000);
    let path = write_image(dir.path(), &image);

    let mut link = device.link();
    link.send(&image, &SendOptions::default(), |_, _| {})
        .await
        .unwrap();
    link.reboot().await.unwrap();
    let uploads = device.state().uploads.len();

    let host = Arc::new(Host::new(LOCALHOST, device.host_options()));
    host.start_liveness(Arc::new(AlwaysUp));
    let cabinet = Cabinet::new(
        LOCALHOST,
        "bench",
        NetDimmTarget::Naomi,
        FirmwareVersion::V4_01,
        Arc::clone(&host) as Arc<dyn CabinetHost>,
        GameSelection::new(&path),
    );

    run_until(&cabinet, CabinetState::WaitPowerOff).await;
    assert_eq!(device.state().uploads.len(), uploads, "Nothing resent");
    assert_eq!(host.status(), HostStatus::Inactive);
}
