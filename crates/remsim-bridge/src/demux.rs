//! Response demultiplexer.
//!
//! Modem output carries no request id, so responses are told apart purely by
//! shape: `+CSQ: <rssi>,<ber>` is a signal report, `+CSIM: <len>,"<hex>"` is
//! an APDU response, and `OK` / `ERROR` / `+CME ERROR:` / `+CMS ERROR:` close
//! whatever request is outstanding. Shapes may be interleaved in one chunk.
//!
//! This only works if callers keep at most one AT request in flight; the
//! bridge loop enforces that.
//!
//! A line may be split across reads. [`LineBuffer`] holds the unterminated
//! tail of one chunk until the rest of the line arrives.

use bytes::{Bytes, BytesMut};
use remsim_common::models::{CSQ_UNKNOWN, SignalSample};

use crate::at::{self, CodecError};
use crate::channel::RECV_BUF_LEN;
use crate::session::SessionHandler;
use crate::stats::Statistics;

/// Longest unterminated line kept across reads.
pub const MAX_PARTIAL_LINE: usize = 2 * RECV_BUF_LEN;

/// Reassembles newline-terminated lines from raw reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and take everything up to and including the last
    /// newline seen so far. The unterminated tail stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.pending.extend_from_slice(chunk);
        let end = self.pending.iter().rposition(|&b| b == b'\n')? + 1;
        Some(self.pending.split_to(end).freeze())
    }

    /// Bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop the buffered tail once it exceeds [`MAX_PARTIAL_LINE`].
    /// Returns how many bytes were discarded.
    pub fn discard_overlong(&mut self) -> Option<usize> {
        let len = self.pending.len();
        if len <= MAX_PARTIAL_LINE {
            return None;
        }
        self.pending.clear();
        Some(len)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Final result code terminating an AT exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Error(String),
}

/// One recognised item in modem output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    Signal { rssi: u8, ber: u8 },
    Apdu(Bytes),
    MalformedApdu(CodecError),
    Final(FinalResult),
}

/// Split a raw chunk into recognised events, in arrival order.
/// Lines matching no known shape (echo, URCs, blank lines) are skipped.
pub fn parse_chunk(chunk: &[u8]) -> Vec<ModemEvent> {
    let text = String::from_utf8_lossy(chunk);
    text.split('\n')
        .map(|line| line.trim_matches(|c: char| c == '\r' || c == '\0' || c.is_whitespace()))
        .filter(|line| !line.is_empty())
        .filter_map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Option<ModemEvent> {
    if let Some(idx) = line.find("+CSQ:") {
        return parse_csq(&line[idx + "+CSQ:".len()..]);
    }
    if let Some(idx) = line.find("+CSIM:") {
        return Some(parse_csim(&line[idx + "+CSIM:".len()..]));
    }
    match line {
        "OK" => Some(ModemEvent::Final(FinalResult::Ok)),
        "ERROR" => Some(ModemEvent::Final(FinalResult::Error(line.to_string()))),
        _ if line.starts_with("+CME ERROR:") || line.starts_with("+CMS ERROR:") => {
            Some(ModemEvent::Final(FinalResult::Error(line.to_string())))
        }
        _ => None,
    }
}

fn parse_csq(rest: &str) -> Option<ModemEvent> {
    let (rssi, ber) = rest.split_once(',')?;
    let rssi = rssi.trim().parse().ok()?;
    let ber = ber.trim().parse().ok()?;
    Some(ModemEvent::Signal { rssi, ber })
}

fn parse_csim(rest: &str) -> ModemEvent {
    let Some((len, payload)) = rest.split_once(',') else {
        return ModemEvent::MalformedApdu(CodecError::Malformed(rest.trim().to_string()));
    };
    let payload = payload.trim().trim_matches('"');
    match len.trim().parse::<usize>() {
        Err(_) => ModemEvent::MalformedApdu(CodecError::Malformed(rest.trim().to_string())),
        // Odd lengths fall through so the codec reports them precisely.
        Ok(declared) if declared != payload.len() && payload.len() % 2 == 0 => {
            ModemEvent::MalformedApdu(CodecError::LengthMismatch {
                declared,
                actual: payload.len(),
            })
        }
        Ok(_) => match at::decode(payload) {
            Ok(apdu) => ModemEvent::Apdu(Bytes::from(apdu)),
            Err(e) => ModemEvent::MalformedApdu(e),
        },
    }
}

/// What a dispatched chunk meant for the exchange in flight.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub apdus: usize,
    pub signals: usize,
    pub malformed: usize,
    pub finals: Vec<FinalResult>,
}

/// Parse `chunk` and route each event to its consumer: signal reports to
/// the statistics, APDUs to the session.
pub fn dispatch(chunk: &[u8], stats: &Statistics, session: &mut dyn SessionHandler) -> Dispatched {
    let mut out = Dispatched::default();
    for event in parse_chunk(chunk) {
        match event {
            ModemEvent::Signal { rssi, ber } => match SignalSample::from_csq(rssi, ber) {
                Some(sample) => {
                    tracing::debug!(rssi_dbm = sample.rssi_dbm, ber, "signal sample");
                    stats.record_signal(sample);
                    out.signals += 1;
                }
                None if rssi == CSQ_UNKNOWN => tracing::debug!("signal quality unknown"),
                None => tracing::warn!(rssi, "CSQ rssi out of range"),
            },
            ModemEvent::Apdu(apdu) => {
                tracing::debug!(apdu = %hex::encode_upper(&apdu), "modem -> card APDU response");
                stats.record_received();
                session.on_apdu(apdu);
                out.apdus += 1;
            }
            ModemEvent::MalformedApdu(e) => {
                tracing::warn!(error = %e, "dropping malformed +CSIM response");
                stats.record_error();
                out.malformed += 1;
            }
            ModemEvent::Final(result) => out.finals.push(result),
        }
    }
    out
}
