//! # remsim-bridge
//!
//! Relays smart-card APDUs between a remote-SIM session and a cellular modem
//! over its AT-command channel, and drives the GPIO lines that route the
//! modem to the local or the remote SIM.
//!
//! The pieces, leaves first:
//!
//! - [`at`]: binary/hex transcoding and `AT+CSIM` framing
//! - [`channel`]: the modem file descriptor, with partial-write retry and bounded reads
//! - [`demux`]: classification of modem output into signal reports and APDU responses
//! - [`sim_path`]: per-modem SIM switch and reset over [`gpio`]
//! - [`monitor`]: periodic `AT+CSQ` polling
//! - [`stats`]: counters shared by all of the above
//! - [`bridge`]: the event loop tying them together, driven through a [`BridgeHandle`]

pub mod at;
pub mod bridge;
pub mod channel;
pub mod demux;
mod error;
pub mod gpio;
pub mod monitor;
pub mod session;
pub mod sim_path;
pub mod stats;

pub use bridge::{Bridge, BridgeConfig, BridgeHandle};
pub use error::BridgeError;
pub use session::{SessionEvent, SessionHandler, SlotStatus};
