//! Cabinet supervision.
//!
//! A [`Cabinet`] keeps one physical machine loaded with a desired image. Each call to
//! [`Cabinet::tick`] performs at most one state transition, based on what the host
//! reports right now. Long-running work (the transfer itself) runs in the background
//! and is observed on later ticks.
//!
//! ```text
//!   STARTUP ─► WAIT_POWER_ON ─► SEND_GAME ─► CHECK_GAME ─► WAIT_POWER_OFF
//!                 ▲    │            │            │               │
//!                 │    └────────────┼────────────┴──► (running) ─┤
//!                 └─────────────────┴────────────────────────────┘
//! ```

mod manager;

pub use manager::{CabinetManager, CabinetStatus};

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CabinetConfig, Config};
use crate::error::Result;
use crate::host::{Host, HostOptions, HostStatus, ImageSettings, PingProbe};
use crate::types::{CrcStatus, FirmwareVersion, NetDimmTarget, TransferInfo};

/// The host operations a cabinet relies on.
#[async_trait]
pub trait CabinetHost: Send + Sync {
    fn alive(&self) -> bool;
    fn status(&self) -> HostStatus;
    fn progress(&self) -> Option<(u64, u64)>;

    async fn send(&self, filename: &Path, patches: &[PathBuf], settings: &ImageSettings)
        -> Result<()>;
    async fn reboot(&self) -> Result<bool>;
    async fn info(&self) -> Option<TransferInfo>;
    async fn crc(&self, filename: &Path, patches: &[PathBuf], settings: &ImageSettings)
        -> Result<u32>;

    /// Begin background reachability monitoring.
    fn start_monitoring(&self) {}

    fn stop_monitoring(&self) {}
}

#[async_trait]
impl CabinetHost for Host {
    fn alive(&self) -> bool {
        Host::alive(self)
    }

    fn status(&self) -> HostStatus {
        Host::status(self)
    }

    fn progress(&self) -> Option<(u64, u64)> {
        Host::progress(self)
    }

    async fn send(
        &self,
        filename: &Path,
        patches: &[PathBuf],
        settings: &ImageSettings,
    ) -> Result<()> {
        Host::send(self, filename, patches, settings).await
    }

    async fn reboot(&self) -> Result<bool> {
        Host::reboot(self).await
    }

    async fn info(&self) -> Option<TransferInfo> {
        Host::info(self).await
    }

    async fn crc(
        &self,
        filename: &Path,
        patches: &[PathBuf],
        settings: &ImageSettings,
    ) -> Result<u32> {
        Host::crc(self, filename, patches, settings).await
    }

    fn start_monitoring(&self) {
        self.start_liveness(Arc::new(PingProbe));
    }

    fn stop_monitoring(&self) {
        self.stop_liveness();
    }
}

/// Where a cabinet is in its load cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinetState {
    Startup,
    WaitPowerOn,
    SendGame,
    CheckGame,
    WaitPowerOff,
}

impl fmt::Display for CabinetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CabinetState::Startup => "startup",
            CabinetState::WaitPowerOn => "wait_power_on",
            CabinetState::SendGame => "send_game",
            CabinetState::CheckGame => "check_game",
            CabinetState::WaitPowerOff => "wait_power_off",
        };
        f.write_str(name)
    }
}

/// The image a cabinet should be running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameSelection {
    pub filename: Option<PathBuf>,
    pub patches: Vec<PathBuf>,
    pub settings: ImageSettings,
}

impl GameSelection {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    fn name(&self) -> String {
        self.filename
            .as_deref()
            .map_or_else(|| "nothing".to_string(), |f| f.display().to_string())
    }
}

struct Machine {
    state: CabinetState,
    progress: u8,
    /// Selection the machine last acted on.
    current: GameSelection,
    crc_cache: Option<(GameSelection, u32)>,
}

/// One machine kept loaded with a desired image.
pub struct Cabinet {
    ip: IpAddr,
    description: String,
    target: NetDimmTarget,
    version: FirmwareVersion,
    host: Arc<dyn CabinetHost>,
    selection: Mutex<GameSelection>,
    machine: tokio::sync::Mutex<Machine>,
    /// Published after every tick so readers never wait on a tick in progress.
    snapshot: Mutex<(CabinetState, u8)>,
}

impl fmt::Debug for Cabinet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cabinet")
            .field("ip", &self.ip)
            .field("description", &self.description)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Cabinet {
    pub fn new(
        ip: IpAddr,
        description: impl Into<String>,
        target: NetDimmTarget,
        version: FirmwareVersion,
        host: Arc<dyn CabinetHost>,
        selection: GameSelection,
    ) -> Self {
        Self::with_state(ip, description, target, version, host, selection, CabinetState::Startup)
    }

    fn with_state(
        ip: IpAddr,
        description: impl Into<String>,
        target: NetDimmTarget,
        version: FirmwareVersion,
        host: Arc<dyn CabinetHost>,
        selection: GameSelection,
        state: CabinetState,
    ) -> Self {
        Self {
            ip,
            description: description.into(),
            target,
            version,
            host,
            machine: tokio::sync::Mutex::new(Machine {
                state,
                progress: 0,
                current: selection.clone(),
                crc_cache: None,
            }),
            selection: Mutex::new(selection),
            snapshot: Mutex::new((state, 0)),
        }
    }

    /// Build a cabinet backed by a real [`Host`] from its configuration entry.
    pub async fn from_config(entry: &CabinetConfig, config: &Config) -> Result<Self> {
        let mut settings = ImageSettings::new();
        for (kind, path) in &entry.settings {
            let blob = tokio::fs::read(path).await.map_err(|e| {
                crate::Error::Config(format!(
                    "cannot read {kind:?} settings for {}: {}: {e}",
                    entry.ip,
                    path.display()
                ))
            })?;
            settings.insert(*kind, blob);
        }

        let options = HostOptions {
            target: entry.target,
            version: entry.version,
            time_hack: entry.time_hack,
            link: config.link.clone(),
            control_timeout: config.manager.control_timeout,
            liveness_debounce: config.manager.liveness_debounce,
        };
        let host = Arc::new(Host::new(entry.ip, options));

        Ok(Self::new(
            entry.ip,
            entry.description.clone(),
            entry.target,
            entry.version,
            host,
            GameSelection {
                filename: entry.filename.clone(),
                patches: entry.patches.clone(),
                settings,
            },
        ))
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn target(&self) -> NetDimmTarget {
        self.target
    }

    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    pub fn host(&self) -> &Arc<dyn CabinetHost> {
        &self.host
    }

    pub fn filename(&self) -> Option<PathBuf> {
        self.selection.lock().filename.clone()
    }

    /// Change the desired image. Takes effect on a later tick.
    pub fn set_filename(&self, filename: Option<PathBuf>) {
        self.selection.lock().filename = filename;
    }

    pub fn patches(&self) -> Vec<PathBuf> {
        self.selection.lock().patches.clone()
    }

    pub fn set_patches(&self, patches: Vec<PathBuf>) {
        self.selection.lock().patches = patches;
    }

    pub fn settings(&self) -> ImageSettings {
        self.selection.lock().settings.clone()
    }

    pub fn set_settings(&self, settings: ImageSettings) {
        self.selection.lock().settings = settings;
    }

    pub fn selection(&self) -> GameSelection {
        self.selection.lock().clone()
    }

    /// Current state and its progress (0-100, meaningful in `SendGame` only).
    pub fn state(&self) -> (CabinetState, u8) {
        *self.snapshot.lock()
    }

    pub fn status(&self) -> CabinetStatus {
        let (state, progress) = self.state();
        CabinetStatus {
            ip: self.ip,
            description: self.description.clone(),
            filename: self.filename(),
            state,
            progress,
        }
    }

    /// Advance the state machine by at most one transition.
    pub async fn tick(&self) -> CabinetState {
        let machine = self.machine.lock().await;
        self.advance(machine).await
    }

    /// Like [`tick`](Self::tick), but `None` without waiting if a tick is in progress.
    pub async fn try_tick(&self) -> Option<CabinetState> {
        let machine = self.machine.try_lock().ok()?;
        Some(self.advance(machine).await)
    }

    async fn advance(&self, mut machine: tokio::sync::MutexGuard<'_, Machine>) -> CabinetState {
        let desired = self.selection();
        let (state, progress) = self.step(&mut machine, desired).await;

        if state != machine.state {
            debug!(ip = %self.ip, from = %machine.state, to = %state, "Cabinet transition");
        }
        machine.state = state;
        machine.progress = progress;
        *self.snapshot.lock() = (state, progress);
        state
    }

    async fn step(&self, machine: &mut Machine, desired: GameSelection) -> (CabinetState, u8) {
        let ip = self.ip;
        match machine.state {
            CabinetState::Startup => {
                info!("Cabinet {} waiting for power on.", ip);
                (CabinetState::WaitPowerOn, 0)
            }

            CabinetState::WaitPowerOn => {
                if !self.host.alive() {
                    return (CabinetState::WaitPowerOn, 0);
                }
                machine.current = desired.clone();
                let Some(filename) = desired.filename.as_deref() else {
                    info!("Cabinet {} has no associated game, waiting for power off.", ip);
                    return (CabinetState::WaitPowerOff, 0);
                };
                let name = filename.display();

                if let Some(info) = self.host.info().await {
                    match info.game_crc_status {
                        CrcStatus::Valid => {
                            if self.expected_crc(machine, &desired).await
                                == Some(info.current_game_crc)
                            {
                                info!("Cabinet {} is already running game {}.", ip, name);
                                return (CabinetState::WaitPowerOff, 0);
                            }
                        }
                        CrcStatus::Checking => {
                            info!("Cabinet {} is already verifying game {}.", ip, name);
                            return (CabinetState::CheckGame, 0);
                        }
                        _ => {}
                    }
                }

                info!("Cabinet {} sending game {}.", ip, name);
                match self
                    .host
                    .send(filename, &desired.patches, &desired.settings)
                    .await
                {
                    Ok(()) => (CabinetState::SendGame, 0),
                    Err(e) => {
                        warn!(ip = %ip, error = %e, "Could not start transfer");
                        (CabinetState::WaitPowerOn, 0)
                    }
                }
            }

            CabinetState::SendGame => match self.host.status() {
                HostStatus::Transferring => {
                    let percent = self
                        .host
                        .progress()
                        .map_or(machine.progress, |(sent, total)| percent(sent, total));
                    (CabinetState::SendGame, percent)
                }
                HostStatus::Failed => {
                    info!("Cabinet {} failed to send game, waiting for power on.", ip);
                    (CabinetState::WaitPowerOn, 0)
                }
                HostStatus::Completed => {
                    info!(
                        "Cabinet {} succeeded sending game, rebooting and verifying game CRC.",
                        ip
                    );
                    match self.host.reboot().await {
                        Ok(true) => {}
                        Ok(false) => debug!(ip = %ip, "Reboot request was not acknowledged"),
                        Err(e) => warn!(ip = %ip, error = %e, "Reboot refused"),
                    }
                    (CabinetState::CheckGame, 0)
                }
                HostStatus::Inactive => {
                    warn!("Cabinet {} lost track of its transfer, waiting for power on.", ip);
                    (CabinetState::WaitPowerOn, 0)
                }
            },

            CabinetState::CheckGame => {
                if let Some(next) = self.power_or_game_changed(machine, &desired) {
                    return next;
                }
                let Some(info) = self.host.info().await else {
                    return (CabinetState::CheckGame, 0);
                };

                let name = desired.name();
                match info.game_crc_status {
                    CrcStatus::Checking => (CabinetState::CheckGame, 0),
                    CrcStatus::Valid => {
                        info!(
                            "Cabinet {} passed CRC verification for {}, waiting for power off.",
                            ip, name
                        );
                        (CabinetState::WaitPowerOff, 0)
                    }
                    CrcStatus::Disabled => {
                        info!(
                            "Cabinet {} had CRC verification disabled for {}, waiting for power on.",
                            ip, name
                        );
                        (CabinetState::WaitPowerOn, 0)
                    }
                    CrcStatus::Invalid | CrcStatus::BadMemory | CrcStatus::Unknown(_) => {
                        info!(
                            "Cabinet {} failed CRC verification for {}, waiting for power on.",
                            ip, name
                        );
                        (CabinetState::WaitPowerOn, 0)
                    }
                }
            }

            CabinetState::WaitPowerOff => self
                .power_or_game_changed(machine, &desired)
                .unwrap_or((CabinetState::WaitPowerOff, 0)),
        }
    }

    /// Shared exits of the two waiting-on-a-running-game states.
    fn power_or_game_changed(
        &self,
        machine: &mut Machine,
        desired: &GameSelection,
    ) -> Option<(CabinetState, u8)> {
        if !self.host.alive() {
            info!("Cabinet {} turned off, waiting for power on.", self.ip);
            return Some((CabinetState::WaitPowerOn, 0));
        }
        if machine.current != *desired {
            machine.current = desired.clone();
            if desired.filename.is_some() {
                info!(
                    "Cabinet {} changed game to {}, waiting for power on.",
                    self.ip,
                    desired.name()
                );
            } else {
                info!(
                    "Cabinet {} no longer has an associated game, waiting for power on.",
                    self.ip
                );
            }
            return Some((CabinetState::WaitPowerOn, 0));
        }
        None
    }

    /// CRC the selection should produce on the target, computed once per selection.
    async fn expected_crc(&self, machine: &mut Machine, selection: &GameSelection) -> Option<u32> {
        if let Some((cached, crc)) = &machine.crc_cache {
            if cached == selection {
                return Some(*crc);
            }
        }
        let filename = selection.filename.as_deref()?;
        match self
            .host
            .crc(filename, &selection.patches, &selection.settings)
            .await
        {
            Ok(crc) => {
                machine.crc_cache = Some((selection.clone(), crc));
                Some(crc)
            }
            Err(e) => {
                warn!(ip = %self.ip, file = %filename.display(), error = %e, "Cannot compute image CRC");
                None
            }
        }
    }
}

fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (u128::from(sent) * 100 / u128::from(total)).min(100) as u8
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::HostError;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scriptable stand-in for a host.
    #[derive(Default)]
    pub(crate) struct MockHost {
        pub alive: AtomicBool,
        pub status: Mutex<Option<HostStatus>>,
        pub progress: Mutex<Option<(u64, u64)>>,
        pub info: Mutex<Option<TransferInfo>>,
        pub crc: Mutex<Option<u32>>,
        pub sent: Mutex<Vec<(PathBuf, Vec<PathBuf>, ImageSettings)>>,
        pub reboots: AtomicU32,
        pub crc_requests: AtomicU32,
        /// Never answer info requests, like a target that accepts and then goes quiet.
        pub hang_info: AtomicBool,
    }

    impl MockHost {
        pub fn set_alive(&self, alive: bool) {
            self.alive.store(alive, Ordering::SeqCst);
        }

        pub fn set_info(&self, status: CrcStatus, crc: u32) {
            *self.info.lock() = Some(TransferInfo {
                current_game_crc: crc,
                current_game_size: 0x1000,
                game_crc_status: status,
                memory_size: 512,
                firmware_version: FirmwareVersion::V4_01,
                available_game_memory: 0x1FFF_0000,
                control_address: 0,
            });
        }
    }

    #[async_trait]
    impl CabinetHost for MockHost {
        fn alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn status(&self) -> HostStatus {
            self.status.lock().unwrap_or(HostStatus::Inactive)
        }

        fn progress(&self) -> Option<(u64, u64)> {
            *self.progress.lock()
        }

        async fn send(
            &self,
            filename: &Path,
            patches: &[PathBuf],
            settings: &ImageSettings,
        ) -> Result<()> {
            if self.status() == HostStatus::Transferring {
                return Err(HostError::TransferActive("mock".into()).into());
            }
            self.sent
                .lock()
                .push((filename.to_path_buf(), patches.to_vec(), settings.clone()));
            *self.status.lock() = Some(HostStatus::Transferring);
            Ok(())
        }

        async fn reboot(&self) -> Result<bool> {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn info(&self) -> Option<TransferInfo> {
            if self.hang_info.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.info.lock().clone()
        }

        async fn crc(
            &self,
            _filename: &Path,
            _patches: &[PathBuf],
            _settings: &ImageSettings,
        ) -> Result<u32> {
            self.crc_requests.fetch_add(1, Ordering::SeqCst);
            self.crc
                .lock()
                .ok_or_else(|| HostError::ImagePreparation("no image".into()).into())
        }
    }

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));

    fn cabinet(host: &Arc<MockHost>, filename: Option<&str>, state: CabinetState) -> Cabinet {
        let selection = GameSelection {
            filename: filename.map(PathBuf::from),
            ..GameSelection::default()
        };
        Cabinet::with_state(
            IP,
            "test cabinet",
            NetDimmTarget::Naomi,
            FirmwareVersion::V4_01,
            Arc::clone(host) as Arc<dyn CabinetHost>,
            selection,
            state,
        )
    }

    #[tokio::test]
    async fn test_startup_moves_to_wait_power_on() {
        let host = Arc::new(MockHost::default());
        let cab = cabinet(&host, None, CabinetState::Startup);
        assert_eq!(cab.state().0, CabinetState::Startup);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
    }

    #[tokio::test]
    async fn test_dead_host_stays_waiting() {
        let host = Arc::new(MockHost::default());
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
        assert!(host.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_alive_without_game_waits_power_off() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        let cab = cabinet(&host, None, CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOff);
        assert!(host.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_alive_sends_game() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::SendGame);

        let sent = host.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PathBuf::from("abc.bin"));
        assert!(sent[0].1.is_empty());
        assert!(sent[0].2.is_empty());
    }

    #[tokio::test]
    async fn test_already_running_matching_game() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        host.set_info(CrcStatus::Valid, 12_345_678);
        *host.crc.lock() = Some(12_345_678);

        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOff);
        assert!(host.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_already_verifying() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        host.set_info(CrcStatus::Checking, 12_345_678);
        *host.crc.lock() = Some(12_345_678);

        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::CheckGame);
        assert!(host.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bad_or_different_crc_sends() {
        for (status, crc) in [
            (CrcStatus::Invalid, 12_345_678),
            (CrcStatus::Valid, 23_456_789),
            (CrcStatus::Disabled, 12_345_678),
            (CrcStatus::Unknown(0x55), 12_345_678),
        ] {
            let host = Arc::new(MockHost::default());
            host.set_alive(true);
            host.set_info(status, crc);
            *host.crc.lock() = Some(12_345_678);

            let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOn);
            assert_eq!(cab.tick().await, CabinetState::SendGame, "{status:?}");
            assert_eq!(host.sent.lock().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unreadable_image_still_sends() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        host.set_info(CrcStatus::Valid, 1);

        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::SendGame);
    }

    #[tokio::test]
    async fn test_expected_crc_is_cached() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        host.set_info(CrcStatus::Valid, 7);
        *host.crc.lock() = Some(7);

        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOff);
        host.set_alive(false);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
        host.set_alive(true);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOff);
        assert_eq!(host.crc_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transfer_progress() {
        let host = Arc::new(MockHost::default());
        *host.status.lock() = Some(HostStatus::Transferring);
        *host.progress.lock() = Some((1, 2));

        let cab = cabinet(&host, Some("abc.bin"), CabinetState::SendGame);
        assert_eq!(cab.tick().await, CabinetState::SendGame);
        assert_eq!(cab.state(), (CabinetState::SendGame, 50));
    }

    #[tokio::test]
    async fn test_transfer_failed() {
        let host = Arc::new(MockHost::default());
        *host.status.lock() = Some(HostStatus::Failed);
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::SendGame);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
    }

    #[tokio::test]
    async fn test_transfer_completed_reboots() {
        let host = Arc::new(MockHost::default());
        *host.status.lock() = Some(HostStatus::Completed);
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::SendGame);
        assert_eq!(cab.tick().await, CabinetState::CheckGame);
        assert_eq!(host.reboots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checking_host_died() {
        let host = Arc::new(MockHost::default());
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::CheckGame);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
    }

    #[tokio::test]
    async fn test_checking_new_game() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::CheckGame);
        cab.set_filename(Some(PathBuf::from("xyz.bin")));
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
    }

    #[tokio::test]
    async fn test_checking_without_info_waits() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::CheckGame);
        assert_eq!(cab.tick().await, CabinetState::CheckGame);
    }

    #[tokio::test]
    async fn test_checking_crc_outcomes() {
        for (status, next) in [
            (CrcStatus::Valid, CabinetState::WaitPowerOff),
            (CrcStatus::Invalid, CabinetState::WaitPowerOn),
            (CrcStatus::BadMemory, CabinetState::WaitPowerOn),
            (CrcStatus::Checking, CabinetState::CheckGame),
            (CrcStatus::Disabled, CabinetState::WaitPowerOn),
        ] {
            let host = Arc::new(MockHost::default());
            host.set_alive(true);
            host.set_info(status, 12_345_678);
            let cab = cabinet(&host, Some("abc.bin"), CabinetState::CheckGame);
            assert_eq!(cab.tick().await, next, "{status:?}");
        }
    }

    #[tokio::test]
    async fn test_wait_power_off_exits() {
        let host = Arc::new(MockHost::default());
        host.set_alive(true);
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOff);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOff);

        cab.set_filename(Some(PathBuf::from("xyz.bin")));
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);

        let cab = cabinet(&host, Some("abc.bin"), CabinetState::WaitPowerOff);
        host.set_alive(false);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let host = Arc::new(MockHost::default());
        let cab = cabinet(&host, Some("abc.bin"), CabinetState::Startup);

        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOn);

        host.set_alive(true);
        assert_eq!(cab.tick().await, CabinetState::SendGame);

        *host.progress.lock() = Some((3, 4));
        assert_eq!(cab.tick().await, CabinetState::SendGame);
        assert_eq!(cab.state().1, 75);

        *host.status.lock() = Some(HostStatus::Completed);
        assert_eq!(cab.tick().await, CabinetState::CheckGame);
        assert_eq!(cab.state().1, 0);

        host.set_info(CrcStatus::Checking, 0);
        assert_eq!(cab.tick().await, CabinetState::CheckGame);
        host.set_info(CrcStatus::Valid, 0);
        assert_eq!(cab.tick().await, CabinetState::WaitPowerOff);

        let status = cab.status();
        assert_eq!(status.state, CabinetState::WaitPowerOff);
        assert_eq!(status.filename, Some(PathBuf::from("abc.bin")));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 2), 50);
        assert_eq!(percent(5, 4), 100);
        assert_eq!(percent(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CabinetState::WaitPowerOn.to_string(), "wait_power_on");
        assert_eq!(
            toml::Value::try_from(CabinetState::CheckGame).unwrap(),
            toml::Value::String("check_game".into())
        );
    }
}
