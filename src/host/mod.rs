//! One NetDimm target driven from the host side.
//!
//! A [`Host`] runs image transfers as background tasks that report over a channel,
//! keeps a debounced view of whether the target answers pings, and offers the short
//! control operations a supervisor needs (info, reboot, wipe) with a tight timeout.
//!
//! ```text
//!   send() ──spawn──► transfer task ──events──► status()/progress() drain
//!                         │
//!                         └── NetDimmLink (transfer timeout)
//!
//!   liveness task ──ping──► alive flag ──► time hack (set_time_limit)
//! ```

mod liveness;
mod patcher;

pub use liveness::{LivenessProbe, PingProbe};
pub use patcher::{load_image, ImagePatcher, ImageSettings, PassthroughPatcher, SettingsKind};

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{HostError, Result};
use crate::transfer::{image_crc, SendOptions};
use crate::transport::{LinkConfig, NetDimmLink};
use crate::types::{FirmwareVersion, NetDimmTarget, TransferInfo};

use liveness::LivenessMonitor;

/// Where a host's most recent transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Inactive,
    Transferring,
    Completed,
    Failed,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Inactive => write!(f, "inactive"),
            HostStatus::Transferring => write!(f, "transferring"),
            HostStatus::Completed => write!(f, "completed"),
            HostStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Events a transfer task reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { sent: u64, total: u64 },
    Completed,
    Failed(String),
}

/// How a [`Host`] reaches and treats its target.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub target: NetDimmTarget,
    pub version: FirmwareVersion,
    /// Keep resetting the target's run time limit while it answers pings.
    pub time_hack: bool,
    /// Connection settings for transfers.
    pub link: LinkConfig,
    /// I/O timeout for control operations (info, reboot, wipe, time hack).
    pub control_timeout: Duration,
    /// Agreeing probes needed before the alive flag flips.
    pub liveness_debounce: u32,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            target: NetDimmTarget::Naomi,
            version: FirmwareVersion::V4_01,
            time_hack: false,
            link: LinkConfig::default(),
            control_timeout: Duration::from_secs(5),
            liveness_debounce: 3,
        }
    }
}

impl HostOptions {
    pub(crate) fn transfer_link(&self, ip: IpAddr) -> NetDimmLink {
        NetDimmLink::new(ip, self.target, self.link.clone()).with_version(self.version)
    }

    pub(crate) fn control_link(&self, ip: IpAddr) -> NetDimmLink {
        let config = LinkConfig {
            io_timeout: Some(self.control_timeout),
            ..self.link.clone()
        };
        NetDimmLink::new(ip, self.target, config).with_version(self.version)
    }
}

struct RunningTransfer {
    /// Taken by `send` until the first event arrives.
    events: Option<mpsc::UnboundedReceiver<TransferEvent>>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TransferState {
    running: Option<RunningTransfer>,
    last_progress: Option<(u64, u64)>,
    last_status: Option<HostStatus>,
}

impl TransferState {
    fn apply(&mut self, ip: IpAddr, event: TransferEvent) {
        match event {
            TransferEvent::Progress { sent, total } => {
                self.last_progress = Some((sent, total));
            }
            TransferEvent::Completed => {
                info!("Host {} succeeded in sending image.", ip);
                self.finish(HostStatus::Completed);
            }
            TransferEvent::Failed(err) => {
                info!("Host {} failed to send image: {}.", ip, err);
                self.finish(HostStatus::Failed);
            }
        }
    }

    fn finish(&mut self, status: HostStatus) {
        self.last_status = Some(status);
        self.last_progress = None;
        self.running = None;
    }

    fn drain(&mut self, ip: IpAddr) {
        loop {
            let Some(events) = self.running.as_mut().and_then(|r| r.events.as_mut()) else {
                return;
            };
            let event = match events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    TransferEvent::Failed("transfer task exited without reporting".into())
                }
            };
            self.apply(ip, event);
        }
    }
}

pub(crate) struct Shared {
    pub(crate) alive: AtomicBool,
    transfer: Mutex<TransferState>,
}

impl Shared {
    /// Whether a transfer task is still running, drained or not.
    pub(crate) fn is_transferring(&self) -> bool {
        self.transfer
            .lock()
            .running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

/// A NetDimm target under supervision.
pub struct Host {
    ip: IpAddr,
    options: HostOptions,
    shared: Arc<Shared>,
    patcher: Arc<dyn ImagePatcher>,
    monitor: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("ip", &self.ip)
            .field("target", &self.options.target)
            .field("alive", &self.alive())
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(ip: IpAddr, options: HostOptions) -> Self {
        Self::with_patcher(ip, options, Arc::new(PassthroughPatcher))
    }

    pub fn with_patcher(ip: IpAddr, options: HostOptions, patcher: Arc<dyn ImagePatcher>) -> Self {
        Self {
            ip,
            options,
            shared: Arc::new(Shared {
                alive: AtomicBool::new(false),
                transfer: Mutex::new(TransferState::default()),
            }),
            patcher,
            monitor: Mutex::new(None),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// Whether the target currently answers pings.
    pub fn alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Start the background ping monitor. A running monitor is replaced.
    pub fn start_liveness(&self, probe: Arc<dyn LivenessProbe>) {
        let cancel = CancellationToken::new();
        let monitor = LivenessMonitor {
            ip: self.ip,
            options: self.options.clone(),
            shared: Arc::clone(&self.shared),
            probe,
            cancel: cancel.clone(),
        };
        if let Some(old) = self.monitor.lock().replace(cancel) {
            old.cancel();
        }
        tokio::spawn(monitor.run());
    }

    pub fn stop_liveness(&self) {
        if let Some(cancel) = self.monitor.lock().take() {
            cancel.cancel();
        }
    }

    /// Start sending an image in the background.
    ///
    /// Returns once the transfer task has reported its first event, so a transfer that
    /// fails immediately is already visible through [`Host::status`].
    pub async fn send(
        &self,
        filename: impl AsRef<Path>,
        patches: &[PathBuf],
        settings: &ImageSettings,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.transfer.lock();
            state.drain(self.ip);
            if state.running.is_some() {
                return Err(HostError::TransferActive(self.ip.to_string()).into());
            }

            let job = TransferJob {
                ip: self.ip,
                options: self.options.clone(),
                patcher: Arc::clone(&self.patcher),
                filename: filename.as_ref().to_path_buf(),
                patches: patches.to_vec(),
                settings: settings.clone(),
            };
            state.running = Some(RunningTransfer {
                events: None,
                handle: tokio::spawn(job.run(tx)),
            });
            state.last_progress = None;
            state.last_status = None;
        }
        info!("Host {} started sending image.", self.ip);

        let first = rx.recv().await;
        let mut state = self.shared.transfer.lock();
        if let Some(running) = state.running.as_mut() {
            running.events = Some(rx);
        }
        let event = first.unwrap_or_else(|| {
            TransferEvent::Failed(HostError::TransferVanished(self.ip.to_string()).to_string())
        });
        state.apply(self.ip, event);
        Ok(())
    }

    pub fn status(&self) -> HostStatus {
        let mut state = self.shared.transfer.lock();
        state.drain(self.ip);
        match (state.last_status, &state.running) {
            (Some(status), _) => status,
            (None, None) => HostStatus::Inactive,
            (None, Some(_)) => HostStatus::Transferring,
        }
    }

    /// `(sent, total)` of the active transfer, if one is running and has reported.
    pub fn progress(&self) -> Option<(u64, u64)> {
        let mut state = self.shared.transfer.lock();
        state.drain(self.ip);
        state.running.as_ref()?;
        state.last_progress
    }

    fn transferring(&self) -> bool {
        let mut state = self.shared.transfer.lock();
        state.drain(self.ip);
        state.running.is_some()
    }

    /// Reboot the target. `Ok(false)` if it could not be reached.
    pub async fn reboot(&self) -> Result<bool> {
        if self.transferring() {
            return Err(HostError::RebootDuringTransfer(self.ip.to_string()).into());
        }
        let mut link = self.options.control_link(self.ip);
        match link.reboot().await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(ip = %self.ip, error = %e, "Reboot failed");
                Ok(false)
            }
        }
    }

    /// Target info, or `None` mid-transfer or when unreachable.
    pub async fn info(&self) -> Option<TransferInfo> {
        if self.transferring() {
            return None;
        }
        let mut link = self.options.control_link(self.ip);
        match link.info().await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(ip = %self.ip, error = %e, "Info request failed");
                None
            }
        }
    }

    /// Invalidate the image on the target. Does nothing mid-transfer.
    pub async fn wipe(&self) {
        if self.transferring() {
            return;
        }
        let mut link = self.options.control_link(self.ip);
        if let Err(e) = link.wipe_current_game().await {
            debug!(ip = %self.ip, error = %e, "Wipe failed");
        }
    }

    /// CRC the target would report for this image once loaded.
    pub async fn crc(
        &self,
        filename: impl AsRef<Path>,
        patches: &[PathBuf],
        settings: &ImageSettings,
    ) -> Result<u32> {
        let image = load_image(
            self.patcher.as_ref(),
            filename.as_ref(),
            self.options.target,
            patches,
            settings,
        )
        .await?;
        // Images run to hundreds of MiB.
        tokio::task::spawn_blocking(move || image_crc(&image))
            .await
            .map_err(|e| HostError::ImagePreparation(format!("CRC task failed: {e}")).into())
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(cancel) = self.monitor.get_mut().take() {
            cancel.cancel();
        }
    }
}

struct TransferJob {
    ip: IpAddr,
    options: HostOptions,
    patcher: Arc<dyn ImagePatcher>,
    filename: PathBuf,
    patches: Vec<PathBuf>,
    settings: ImageSettings,
}

impl TransferJob {
    async fn run(self, tx: mpsc::UnboundedSender<TransferEvent>) {
        let result = self.transfer(&tx).await;
        let event = match result {
            Ok(()) => TransferEvent::Completed,
            Err(e) => TransferEvent::Failed(e.to_string()),
        };
        // The host may have been dropped; nobody is left to tell.
        let _ = tx.send(event);
    }

    async fn transfer(&self, tx: &mpsc::UnboundedSender<TransferEvent>) -> Result<()> {
        let image = load_image(
            self.patcher.as_ref(),
            &self.filename,
            self.options.target,
            &self.patches,
            &self.settings,
        )
        .await?;

        debug!(ip = %self.ip, file = %self.filename.display(), size = image.len(), "Image prepared");
        let mut link = self.options.transfer_link(self.ip);
        let progress = tx.clone();
        link.send(&image, &SendOptions::default(), move |sent, total| {
            let _ = progress.send(TransferEvent::Progress { sent, total });
        })
        .await
    }
}
