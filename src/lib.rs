//! # netboot
//!
//! NetDimm network-boot client and unattended cabinet supervisor.
//!
//! A NetDimm is the network boot adapter fitted to Naomi, Chihiro and Triforce arcade
//! boards. This crate speaks its TCP protocol (image upload/download, info, peek/poke),
//! runs the register-mailbox message protocol used by homebrew running on the target,
//! and drives a fleet of cabinets toward "the desired image is loaded and verified"
//! without human intervention.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  CabinetManager (1 s tick loop)                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              Cabinet state machine (one per device)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Host (background transfer task + liveness poller)        │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │   BulkTransfer (chunks, CRC,   │  MessageChannel (register      │
//! │   DES chunk cipher)            │  mailbox, fragments, zlib)     │
//! ├────────────────────────────────┴────────────────────────────────┤
//! │         NetDimmLink (framed request/response, tcp/10703)        │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Register addresses read better unseparated
#![allow(clippy::cast_possible_truncation)]  // Wire fields are masked before narrowing
#![allow(clippy::cast_precision_loss)]       // Progress percentages
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::use_self)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::future_not_send)]
#![allow(clippy::match_same_arms)]

pub mod cabinet;
pub mod config;
pub mod crypto;
pub mod error;
pub mod host;
pub mod message;
pub mod protocol;
pub mod transfer;
pub mod transport;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// TCP port every NetDimm listens on.
pub const DEFAULT_PORT: u16 = 10703;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cabinet::{Cabinet, CabinetManager, CabinetState, GameSelection};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::host::{Host, HostOptions, HostStatus};
    pub use crate::message::{Message, MessageChannel};
    pub use crate::transfer::SendOptions;
    pub use crate::transport::{LinkConfig, NetDimmLink};
    pub use crate::types::*;
}
