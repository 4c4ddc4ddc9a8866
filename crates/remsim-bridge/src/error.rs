use std::path::PathBuf;

use thiserror::Error;

use crate::at::CodecError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("modem device {path} unavailable: {source}")]
    ChannelUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("modem channel not connected")]
    NotConnected,
    #[error("incomplete write to modem: {written} of {expected} bytes")]
    IncompleteWrite { written: usize, expected: usize },
    #[error("cannot encode APDU: {0}")]
    Encoding(#[source] CodecError),
    #[error("cannot decode modem response: {0}")]
    Decoding(#[source] CodecError),
    #[error("GPIO {pin} write failed: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("ATR too long: {len} bytes (max {max})")]
    AtrTooLong { len: usize, max: usize },
    #[error("no such modem: {0}")]
    NoSuchModem(remsim_common::models::ModemId),
    #[error("modem I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bridge stopped")]
    Stopped,
}
