//! Command line interface for netboot.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::transport::LinkConfig;
use crate::types::{FirmwareVersion, NetDimmTarget, PeekPokeWidth};
use crate::util::parse_u32;

/// netboot - NetDimm network boot client and cabinet supervisor
#[derive(Parser, Debug)]
#[command(
    name = "netboot",
    author,
    version,
    about = "Load and supervise games on Naomi, Chihiro and Triforce NetDimms",
    long_about = r#"
netboot talks to the NetDimm network boot adapter on tcp/10703:

  - Send, receive and verify game images
  - Peek, poke, dump and load raw DIMM memory
  - Print stdout/stderr of homebrew running on the target
  - Keep a fleet of cabinets loaded with the right game, unattended

QUICK START:
  Load a game:     netboot send 192.168.1.10 game.bin
  Keep it loaded:  netboot ensure 192.168.1.10 game.bin --time-hack
  Whole arcade:    netboot manage --config arcade.toml
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show firmware, memory and current game info
    Info(TargetArgs),

    /// Send a game image
    Send(SendArgs),

    /// Download the current game image
    Receive(ReceiveArgs),

    /// Read one value from target memory
    Peek(PeekArgs),

    /// Write one value to target memory
    Poke(PokeArgs),

    /// Dump a region of DIMM memory to a file
    Dump(DumpArgs),

    /// Load a file into DIMM memory at an offset
    Load(LoadArgs),

    /// Restart the target into the loaded game
    Reboot(TargetArgs),

    /// Set how long the loaded game may run
    SetTimeLimit(TimeLimitArgs),

    /// Invalidate the loaded game so it is not booted again
    Wipe(TargetArgs),

    /// Keep one cabinet loaded with a game
    Ensure(EnsureArgs),

    /// Supervise every cabinet in the configuration file
    Manage(ManageArgs),

    /// Print stdout/stderr messages from a program running on the target
    Stdio(StdioArgs),

    /// Show example configuration
    Config(ConfigArgs),
}

/// Arguments every target command takes
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// NetDimm IP address
    pub ip: IpAddr,

    /// Platform the NetDimm is fitted to
    #[arg(short, long, default_value = "naomi")]
    pub target: TargetPlatform,

    /// Firmware version, if known
    #[arg(long)]
    pub firmware: Option<String>,

    /// Per-read timeout in seconds (defaults per platform)
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl TargetArgs {
    pub fn platform(&self) -> NetDimmTarget {
        self.target.into()
    }

    pub fn firmware_version(&self) -> crate::Result<FirmwareVersion> {
        self.firmware
            .as_deref()
            .map_or(Ok(FirmwareVersion::V4_01), str::parse)
    }

    /// Link settings with command line overrides applied.
    pub fn link_config(&self, base: &LinkConfig) -> LinkConfig {
        LinkConfig {
            io_timeout: self.timeout.map(Duration::from_secs).or(base.io_timeout),
            ..base.clone()
        }
    }
}

/// Send command arguments
#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Image file to send
    pub image: PathBuf,

    /// DES key as 16 hex digits, for encrypted images
    #[arg(short, long)]
    pub key: Option<String>,

    /// Skip the CRC check on boot
    #[arg(long)]
    pub disable_crc: bool,

    /// Do not switch the target to its "now loading" screen
    #[arg(long)]
    pub disable_now_loading: bool,

    /// Do not reboot into the game afterwards
    #[arg(long)]
    pub no_reboot: bool,
}

/// Receive command arguments
#[derive(Args, Debug)]
pub struct ReceiveArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Output file
    pub output: PathBuf,
}

/// Peek command arguments
#[derive(Args, Debug)]
pub struct PeekArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Address, hex with 0x prefix or decimal
    #[arg(value_parser = parse_u32)]
    pub address: u32,

    /// Access width
    #[arg(short, long, default_value = "long")]
    pub width: AccessWidth,
}

/// Poke command arguments
#[derive(Args, Debug)]
pub struct PokeArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Address, hex with 0x prefix or decimal
    #[arg(value_parser = parse_u32)]
    pub address: u32,

    /// Value to write
    #[arg(value_parser = parse_u32)]
    pub value: u32,

    /// Access width
    #[arg(short, long, default_value = "long")]
    pub width: AccessWidth,
}

/// Dump command arguments
#[derive(Args, Debug)]
pub struct DumpArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// DIMM offset to start at
    #[arg(value_parser = parse_u32)]
    pub offset: u32,

    /// Number of bytes to read
    #[arg(value_parser = parse_u32)]
    pub length: u32,

    /// Output file; prints a hex dump when omitted
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Load command arguments
#[derive(Args, Debug)]
pub struct LoadArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// DIMM offset to write at
    #[arg(value_parser = parse_u32)]
    pub offset: u32,

    /// File to write
    pub file: PathBuf,
}

/// Set time limit command arguments
#[derive(Args, Debug)]
pub struct TimeLimitArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Minutes the game may run
    pub minutes: u32,
}

/// Ensure command arguments
#[derive(Args, Debug)]
pub struct EnsureArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Image file to keep loaded
    pub image: PathBuf,

    /// Keep resetting the time limit while the cabinet is up
    #[arg(long)]
    pub time_hack: bool,
}

/// Manage command arguments
#[derive(Args, Debug)]
pub struct ManageArgs {
    /// Seconds between status reports (0 disables them)
    #[arg(long, default_value = "10")]
    pub report_interval: u64,
}

/// Stdio command arguments
#[derive(Args, Debug)]
pub struct StdioArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Milliseconds to wait between polls when nothing arrives
    #[arg(long, default_value = "50")]
    pub poll_ms: u64,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Target platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetPlatform {
    Naomi,
    Chihiro,
    Triforce,
}

impl From<TargetPlatform> for NetDimmTarget {
    fn from(t: TargetPlatform) -> Self {
        match t {
            TargetPlatform::Naomi => Self::Naomi,
            TargetPlatform::Chihiro => Self::Chihiro,
            TargetPlatform::Triforce => Self::Triforce,
        }
    }
}

/// Peek/poke access width
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AccessWidth {
    Byte,
    Short,
    Long,
}

impl From<AccessWidth> for PeekPokeWidth {
    fn from(w: AccessWidth) -> Self {
        match w {
            AccessWidth::Byte => Self::Byte,
            AccessWidth::Short => Self::Short,
            AccessWidth::Long => Self::Long,
        }
    }
}
