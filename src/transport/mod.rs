//! Transport layer for netboot.
//!
//! One TCP connection to a NetDimm on port 10703, framed with [`NetDimmCodec`], with
//! strictly ordered request/response exchange.
//!
//! [`NetDimmCodec`]: crate::protocol::NetDimmCodec

mod link;

pub use link::{ConnectionScope, NetDimmLink};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NetDimmTarget;

/// Environment variable overriding the per-target read timeout, in whole seconds.
pub const TIMEOUT_ENV_VAR: &str = "NETDIMM_TIMEOUT_SECONDS";

/// Link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// NetDimm TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Read/write timeout. When unset the target's default applies, unless
    /// `NETDIMM_TIMEOUT_SECONDS` is set.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub io_timeout: Option<Duration>,
}

fn default_port() -> u16 {
    crate::DEFAULT_PORT
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            io_timeout: None,
        }
    }
}

impl LinkConfig {
    /// Resolve the read/write timeout for a target platform.
    pub fn io_timeout_for(&self, target: NetDimmTarget) -> Duration {
        if let Some(timeout) = self.io_timeout {
            return timeout;
        }
        std::env::var(TIMEOUT_ENV_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| target.default_timeout())
    }
}
