//! Drives every cabinet forward from one background loop.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::{Cabinet, CabinetState};
use crate::config::Config;
use crate::error::{Error, Result};

/// Point-in-time view of one cabinet, for front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CabinetStatus {
    pub ip: IpAddr,
    pub description: String,
    pub filename: Option<PathBuf>,
    pub state: CabinetState,
    pub progress: u8,
}

type CabinetList = Arc<Mutex<Vec<Arc<Cabinet>>>>;

/// A collection of cabinets ticked on a fixed cadence.
///
/// The list lock is only held to copy or edit the list, never while a cabinet ticks,
/// so adding or removing cabinets never waits on network I/O.
pub struct CabinetManager {
    cabinets: CabinetList,
    tick_interval: Duration,
    runner: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CabinetManager {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            cabinets: Arc::new(Mutex::new(Vec::new())),
            tick_interval,
            runner: Mutex::new(None),
        }
    }

    /// Build a manager holding every cabinet in the configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let manager = Self::new(config.manager.tick_interval);
        for entry in &config.cabinets {
            let cabinet = Cabinet::from_config(entry, config).await?;
            manager.add(cabinet)?;
        }
        Ok(manager)
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Take ownership of a cabinet and start monitoring its host.
    pub fn add(&self, cabinet: Cabinet) -> Result<Arc<Cabinet>> {
        let mut cabinets = self.cabinets.lock();
        if cabinets.iter().any(|c| c.ip() == cabinet.ip()) {
            return Err(Error::DuplicateCabinet(cabinet.ip()));
        }

        let cabinet = Arc::new(cabinet);
        cabinet.host().start_monitoring();
        cabinets.push(Arc::clone(&cabinet));
        info!(ip = %cabinet.ip(), description = cabinet.description(), "Cabinet added");
        Ok(cabinet)
    }

    pub fn remove(&self, ip: IpAddr) -> Option<Arc<Cabinet>> {
        let removed = {
            let mut cabinets = self.cabinets.lock();
            let index = cabinets.iter().position(|c| c.ip() == ip)?;
            cabinets.remove(index)
        };
        removed.host().stop_monitoring();
        info!(%ip, "Cabinet removed");
        Some(removed)
    }

    pub fn cabinet(&self, ip: IpAddr) -> Option<Arc<Cabinet>> {
        self.cabinets.lock().iter().find(|c| c.ip() == ip).cloned()
    }

    pub fn cabinets(&self) -> Vec<Arc<Cabinet>> {
        self.cabinets.lock().clone()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cabinets.lock().iter().any(|c| c.ip() == ip)
    }

    pub fn len(&self) -> usize {
        self.cabinets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cabinets.lock().is_empty()
    }

    pub fn statuses(&self) -> Vec<CabinetStatus> {
        self.cabinets().iter().map(|c| c.status()).collect()
    }

    /// Tick every cabinet once, concurrently, and wait for all of them.
    pub async fn tick_once(&self) {
        tick_all(&self.cabinets).await;
    }

    /// Spawn the background tick loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut runner = self.runner.lock();
        if runner.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.cabinets),
            self.tick_interval,
            cancel.clone(),
        ));
        *runner = Some((cancel, handle));
        info!(interval = ?self.tick_interval, "Cabinet manager started");
    }

    /// Stop the tick loop. Ticks still in flight are abandoned.
    pub async fn stop(&self) {
        let runner = self.runner.lock().take();
        if let Some((cancel, handle)) = runner {
            cancel.cancel();
            let _ = handle.await;
            info!("Cabinet manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}

impl Drop for CabinetManager {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.runner.get_mut().take() {
            cancel.cancel();
        }
        for cabinet in self.cabinets.lock().iter() {
            cabinet.host().stop_monitoring();
        }
    }
}

async fn tick_all(cabinets: &CabinetList) {
    let snapshot = cabinets.lock().clone();
    join_all(snapshot.iter().map(|cabinet| cabinet.tick())).await;
}

async fn run_loop(cabinets: CabinetList, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ticks = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        // Each cabinet ticks on its own task so a slow device only delays itself.
        // One still busy from an earlier round is skipped.
        let snapshot = cabinets.lock().clone();
        for cabinet in snapshot {
            let cancel = cancel.clone();
            ticks.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    ticked = cabinet.try_tick() => {
                        if ticked.is_none() {
                            debug!(ip = %cabinet.ip(), "Cabinet still busy, skipping round");
                        }
                    }
                }
            });
        }
    }

    ticks.close();
    ticks.wait().await;
    debug!("Cabinet tick loop exited");
}
