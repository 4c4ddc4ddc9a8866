//! AT command codec.
//!
//! APDUs travel to the modem hex-encoded inside `AT+CSIM=<len>,"<HEX>"`
//! where `<len>` counts hex characters, not bytes. Responses come back as
//! `+CSIM: <len>,"<hex>"` and are decoded with [`decode`].

use thiserror::Error;

/// Largest APDU accepted by [`encode`]. Bounded by the modem's AT buffer.
pub const MAX_APDU_LEN: usize = 512;

/// Line terminator appended to every command written to the modem.
pub const LINE_END: &str = "\r\n";

/// Signal quality query.
pub const CSQ_COMMAND: &str = "AT+CSQ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("APDU of {len} bytes exceeds the {max}-byte limit")]
    TooLong { len: usize, max: usize },
    #[error("hex payload has odd length {0}")]
    OddLength(usize),
    #[error("invalid hex character {ch:?} at offset {index}")]
    InvalidHex { ch: char, index: usize },
    #[error("decoded payload of {len} bytes exceeds capacity {capacity}")]
    Capacity { len: usize, capacity: usize },
    #[error("declared length {declared} does not match {actual} hex characters")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("malformed +CSIM response: {0:?}")]
    Malformed(String),
}

/// Build the `AT+CSIM` command (without line terminator) carrying `apdu`.
pub fn encode(apdu: &[u8]) -> Result<String, CodecError> {
    if apdu.len() > MAX_APDU_LEN {
        return Err(CodecError::TooLong {
            len: apdu.len(),
            max: MAX_APDU_LEN,
        });
    }
    let payload = hex::encode_upper(apdu);
    Ok(format!("AT+CSIM={},\"{payload}\"", payload.len()))
}

/// Decode a hex payload with the default [`MAX_APDU_LEN`] capacity.
pub fn decode(hex_payload: &str) -> Result<Vec<u8>, CodecError> {
    decode_with_capacity(hex_payload, MAX_APDU_LEN)
}

/// Decode a hex payload, rejecting anything that would not fit in
/// `capacity` bytes.
pub fn decode_with_capacity(hex_payload: &str, capacity: usize) -> Result<Vec<u8>, CodecError> {
    let len = hex_payload.len();
    if len % 2 != 0 {
        return Err(CodecError::OddLength(len));
    }
    if len / 2 > capacity {
        return Err(CodecError::Capacity {
            len: len / 2,
            capacity,
        });
    }
    hex::decode(hex_payload).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { c, index } => {
            CodecError::InvalidHex { ch: c, index }
        }
        hex::FromHexError::OddLength => CodecError::OddLength(len),
        hex::FromHexError::InvalidStringLength => CodecError::OddLength(len),
    })
}

/// Append the line terminator to a bare command.
pub fn frame(command: &str) -> String {
    format!("{command}{LINE_END}")
}

/// Extract the hex part of an `AT+CSIM` command built by [`encode`].
pub fn command_payload(command: &str) -> Option<&str> {
    let rest = command.strip_prefix("AT+CSIM=")?;
    let (_, quoted) = rest.split_once(',')?;
    quoted.trim_end().strip_prefix('"')?.strip_suffix('"')
}
