//! Core types used throughout netboot.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ValidationError};

/// Arcade platform a NetDimm is fitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetDimmTarget {
    #[default]
    Naomi,
    Chihiro,
    Triforce,
    Unknown,
}

impl NetDimmTarget {
    /// Default per-read timeout. Chihiro is reported to be very slow to answer, and
    /// Triforce is assumed to behave the same.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::Naomi | Self::Unknown => Duration::from_secs(15),
            Self::Chihiro | Self::Triforce => Duration::from_secs(40),
        }
    }
}

impl fmt::Display for NetDimmTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Naomi => write!(f, "naomi"),
            Self::Chihiro => write!(f, "chihiro"),
            Self::Triforce => write!(f, "triforce"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for NetDimmTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "naomi" => Ok(Self::Naomi),
            "chihiro" => Ok(Self::Chihiro),
            "triforce" => Ok(Self::Triforce),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::InvalidConfig(format!("unknown target platform {other}"))),
        }
    }
}

/// NetDimm firmware version. The value space is defined by the device, so anything
/// unrecognised decodes to [`FirmwareVersion::Unknown`] instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FirmwareVersion {
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "1.02")]
    V1_02,
    #[serde(rename = "2.03")]
    V2_03,
    #[serde(rename = "2.06")]
    V2_06,
    #[serde(rename = "2.13")]
    V2_13,
    #[serde(rename = "2.17")]
    V2_17,
    #[serde(rename = "3.01")]
    V3_01,
    #[serde(rename = "3.03")]
    V3_03,
    #[serde(rename = "3.12")]
    V3_12,
    #[serde(rename = "3.17")]
    V3_17,
    #[serde(rename = "4.01")]
    V4_01,
    #[serde(rename = "4.02")]
    V4_02,
}

impl FirmwareVersion {
    const KNOWN: [(&'static str, Self); 11] = [
        ("1.02", Self::V1_02),
        ("2.03", Self::V2_03),
        ("2.06", Self::V2_06),
        ("2.13", Self::V2_13),
        ("2.17", Self::V2_17),
        ("3.01", Self::V3_01),
        ("3.03", Self::V3_03),
        ("3.12", Self::V3_12),
        ("3.17", Self::V3_17),
        ("4.01", Self::V4_01),
        ("4.02", Self::V4_02),
    ];

    /// Decode the 16-bit version word from a get-info response. The high byte and the
    /// low byte are hex digit pairs, so 0x0317 reads as "3.17".
    pub fn from_wire(version: u16) -> Self {
        let text = format!("{:x}.{:02x}", version >> 8, version & 0xFF);
        text.parse().unwrap_or(Self::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        Self::KNOWN
            .iter()
            .find(|(_, v)| *v == self)
            .map_or("UNKNOWN", |(s, _)| s)
    }
}

impl FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::KNOWN
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, v)| *v)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown firmware version {s}")))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The firmware's verdict on the currently loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrcStatus {
    /// CRC has not started or is in progress ("NOW CHECKING...").
    Checking,
    /// CRC passed, the image boots or is running.
    Valid,
    /// CRC failed, the device waits for a new image.
    Invalid,
    /// DIMM memory is unusable.
    BadMemory,
    /// CRC verification was switched off for the last transfer.
    Disabled,
    /// A status word no known firmware reports.
    Unknown(u32),
}

impl CrcStatus {
    /// Map the status word read from the system register at 0xFFFEFFE0.
    pub fn from_wire(word: u32) -> Self {
        match word {
            0 | 1 => Self::Checking,
            2 => Self::Valid,
            3 => Self::Invalid,
            4 => Self::BadMemory,
            5 => Self::Disabled,
            other => Self::Unknown(other),
        }
    }

    /// Whether the device holds an image that can be read back.
    pub fn has_image(self) -> bool {
        matches!(self, Self::Valid | Self::Disabled)
    }
}

impl fmt::Display for CrcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checking => write!(f, "checking"),
            Self::Valid => write!(f, "valid"),
            Self::Invalid => write!(f, "invalid"),
            Self::BadMemory => write!(f, "bad memory"),
            Self::Disabled => write!(f, "disabled"),
            Self::Unknown(word) => write!(f, "unknown ({word:#x})"),
        }
    }
}

/// Width of a single peek/poke access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeekPokeWidth {
    Byte = 1,
    Short = 2,
    Long = 3,
}

impl PeekPokeWidth {
    /// Pick the width from an access size in bytes.
    pub fn from_size(size: u32) -> Result<Self, ValidationError> {
        match size {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Short),
            4 => Ok(Self::Long),
            other => Err(ValidationError::InvalidWidth(other)),
        }
    }

    /// Access size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Long => 4,
        }
    }

    /// Value sent in the `type` field of peek/poke requests.
    pub fn wire(self) -> u32 {
        self as u32
    }

    /// Mask a value to this width.
    pub fn mask(self, value: u32) -> u32 {
        match self {
            Self::Byte => value & 0xFF,
            Self::Short => value & 0xFFFF,
            Self::Long => value,
        }
    }

    /// Check that `addr` is naturally aligned for this width. Misaligned short/long
    /// accesses return bogus data on Naomi, so they are rejected before any I/O.
    pub fn validate(self, addr: u32) -> Result<(), ValidationError> {
        let misaligned = match self {
            Self::Byte => false,
            Self::Short => addr & 0x1 != 0,
            Self::Long => addr & 0x3 != 0,
        };
        if misaligned {
            return Err(ValidationError::MisalignedAddress {
                addr,
                width: self.name(),
            });
        }
        Ok(())
    }

    fn name(self) -> &'static str {
        match self {
            Self::Byte => "BYTE",
            Self::Short => "SHORT",
            Self::Long => "LONG",
        }
    }
}

/// Snapshot of device-reported state, produced by one info request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// CRC stamped with the current image.
    pub current_game_crc: u32,
    /// Size in bytes of the current image.
    pub current_game_size: u32,
    /// Firmware verdict on the current image.
    pub game_crc_status: CrcStatus,
    /// DIMM memory size in MiB.
    pub memory_size: u32,
    /// Firmware version.
    pub firmware_version: FirmwareVersion,
    /// Memory available for images, in bytes.
    pub available_game_memory: u32,
    /// BIOS control word of the host board.
    pub control_address: u32,
}
