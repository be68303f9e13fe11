//! Out-of-band reachability monitoring.
//!
//! A target that is busy showing "now loading" may refuse protocol connections, so
//! liveness is judged by ICMP echo instead.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{HostOptions, Shared};
use crate::transport::NetDimmLink;

/// Interval between time hack refreshes.
const TIME_HACK_INTERVAL: Duration = Duration::from_secs(5);

/// Time limit, in minutes, the time hack keeps resetting.
const TIME_HACK_MINUTES: u32 = 10;

/// Probes whether a host answers on the network.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, ip: IpAddr) -> bool;
}

/// Probe with the system `ping`, one echo request and a one second wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProbe;

#[async_trait]
impl LivenessProbe for PingProbe {
    async fn probe(&self, ip: IpAddr) -> bool {
        let ip = ip.to_string();
        let mut cmd = Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", "1000", &ip]);
        } else {
            cmd.args(["-c1", "-W1", &ip]);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Debounced reachability tracking for one host.
#[derive(Debug, Clone, Default)]
pub(crate) struct Debouncer {
    threshold: u32,
    successes: u32,
    failures: u32,
}

impl Debouncer {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            ..Self::default()
        }
    }

    /// Record one probe. Returns the new verdict once enough probes agree.
    pub(crate) fn record(&mut self, up: bool) -> Option<bool> {
        if up {
            self.successes = self.successes.saturating_add(1);
            self.failures = 0;
            (self.successes >= self.threshold).then_some(true)
        } else {
            self.failures = self.failures.saturating_add(1);
            self.successes = 0;
            (self.failures >= self.threshold).then_some(false)
        }
    }

    /// Whether the host is confirmed up.
    pub(crate) fn settled_up(&self) -> bool {
        self.successes >= self.threshold
    }
}

pub(crate) struct LivenessMonitor {
    pub(crate) ip: IpAddr,
    pub(crate) options: HostOptions,
    pub(crate) shared: Arc<Shared>,
    pub(crate) probe: Arc<dyn LivenessProbe>,
    pub(crate) cancel: CancellationToken,
}

impl LivenessMonitor {
    pub(crate) async fn run(self) {
        let mut debounce = Debouncer::new(self.options.liveness_debounce);
        let mut last_time_hack = Instant::now();

        loop {
            // Pinging a host mid-transfer adds nothing and can slow it down.
            if !self.shared.is_transferring() {
                let up = self.probe.probe(self.ip).await;
                if let Some(verdict) = debounce.record(up) {
                    let was = self.shared.alive.swap(verdict, Ordering::SeqCst);
                    if was != verdict {
                        if verdict {
                            info!("Host {} started responding to ping, marking up.", self.ip);
                        } else {
                            info!("Host {} stopped responding to ping, marking down.", self.ip);
                        }
                    }
                }

                if up && self.options.time_hack && last_time_hack.elapsed() >= TIME_HACK_INTERVAL {
                    last_time_hack = Instant::now();
                    self.time_hack().await;
                }
            }

            let pause = if debounce.settled_up() {
                Duration::from_secs(2)
            } else {
                Duration::from_secs(1)
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }
        debug!(ip = %self.ip, "Liveness monitor stopped");
    }

    async fn time_hack(&self) {
        if self.shared.is_transferring() {
            return;
        }
        let mut link: NetDimmLink = self.options.control_link(self.ip);
        match link.set_time_limit(TIME_HACK_MINUTES).await {
            Ok(()) => info!("Host {} reset time limit with time hack.", self.ip),
            Err(e) => debug!(ip = %self.ip, error = %e, "Time hack failed"),
        }
    }
}
