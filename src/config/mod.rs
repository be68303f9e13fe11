//! Configuration management for netboot.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::host::SettingsKind;
use crate::message::MessageConfig;
use crate::transport::LinkConfig;
use crate::types::{FirmwareVersion, NetDimmTarget};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// NetDimm connection settings.
    #[serde(default)]
    pub link: LinkConfig,

    /// Message channel timing.
    #[serde(default)]
    pub message: MessageConfig,

    /// Cabinet supervision.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Cabinets to keep loaded.
    #[serde(default)]
    pub cabinets: Vec<CabinetConfig>,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.manager.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick interval must be non-zero".into()));
        }

        if self.manager.liveness_debounce == 0 {
            return Err(Error::InvalidConfig(
                "liveness debounce needs at least one probe".into(),
            ));
        }

        let mut seen = HashSet::new();
        for cabinet in &self.cabinets {
            if !seen.insert(cabinet.ip) {
                return Err(Error::InvalidConfig(format!(
                    "cabinet {} is configured more than once",
                    cabinet.ip
                )));
            }
            if cabinet.filename.is_none()
                && (!cabinet.patches.is_empty() || !cabinet.settings.is_empty())
            {
                return Err(Error::InvalidConfig(format!(
                    "cabinet {} has patches or settings but no image",
                    cabinet.ip
                )));
            }
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "netboot", "netboot").map_or_else(
            || PathBuf::from("netboot.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            cabinets: vec![
                CabinetConfig {
                    description: "Naomi upright".into(),
                    filename: Some(PathBuf::from("roms/naomi_game.bin")),
                    time_hack: true,
                    ..CabinetConfig::new(IpAddr::from([192, 168, 1, 10]))
                },
                CabinetConfig {
                    description: "Chihiro sit-down".into(),
                    target: NetDimmTarget::Chihiro,
                    version: FirmwareVersion::V3_17,
                    filename: Some(PathBuf::from("roms/chihiro_game.bin")),
                    ..CabinetConfig::new(IpAddr::from([192, 168, 1, 11]))
                },
            ],
            ..Default::default()
        }
    }
}

/// Cabinet supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Interval between state machine ticks.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Agreeing pings needed to mark a cabinet up or down.
    #[serde(default = "default_liveness_debounce")]
    pub liveness_debounce: u32,

    /// I/O timeout for info, reboot and wipe requests.
    #[serde(default = "default_control_timeout", with = "humantime_serde")]
    pub control_timeout: Duration,
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_liveness_debounce() -> u32 {
    3
}
fn default_control_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            liveness_debounce: default_liveness_debounce(),
            control_timeout: default_control_timeout(),
        }
    }
}

/// One cabinet to supervise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CabinetConfig {
    /// Address of the cabinet's NetDimm.
    pub ip: IpAddr,

    /// Free-form label.
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub target: NetDimmTarget,

    #[serde(default = "default_version")]
    pub version: FirmwareVersion,

    /// Image to keep loaded. Without one the cabinet is only watched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,

    /// Patch files applied to the image before sending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PathBuf>,

    /// Settings blobs applied to the image, by kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<SettingsKind, PathBuf>,

    /// Keep resetting the run time limit while the cabinet is up.
    #[serde(default)]
    pub time_hack: bool,
}

fn default_version() -> FirmwareVersion {
    FirmwareVersion::V4_01
}

impl CabinetConfig {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            description: String::new(),
            target: NetDimmTarget::default(),
            version: default_version(),
            filename: None,
            patches: Vec::new(),
            settings: BTreeMap::new(),
            time_hack: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(
                fmt::layer()
                    .with_ansi(config.color)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))
}
