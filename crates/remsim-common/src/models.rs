//! Data models for the remote-SIM client.
//!
//! These types are shared between the modem bridge (which produces signal
//! samples and statistics) and the agent (which owns configuration and the
//! orchestrator-issued slot assignment).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Mapping mode ────────────────────────────────────────────────────

/// How the orchestrator maps this client onto a SIM bank slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingMode {
    #[default]
    OneToOneSwsim,
    OneToOneVsim,
    KiProxySwsim,
}

impl MappingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingMode::OneToOneSwsim => "ONE_TO_ONE_SWSIM",
            MappingMode::OneToOneVsim => "ONE_TO_ONE_VSIM",
            MappingMode::KiProxySwsim => "KI_PROXY_SWSIM",
        }
    }
}

impl std::fmt::Display for MappingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MappingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE_TO_ONE_SWSIM" => Ok(MappingMode::OneToOneSwsim),
            "ONE_TO_ONE_VSIM" => Ok(MappingMode::OneToOneVsim),
            "KI_PROXY_SWSIM" => Ok(MappingMode::KiProxySwsim),
            other => Err(format!("unknown mapping mode: {other}")),
        }
    }
}

// ── SIM path ────────────────────────────────────────────────────────

/// Which SIM a modem currently observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimPath {
    #[default]
    Local,
    Remote,
}

impl SimPath {
    /// GPIO level that selects this path (high = remote).
    pub fn level(&self) -> bool {
        matches!(self, SimPath::Remote)
    }
}

impl std::fmt::Display for SimPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimPath::Local => write!(f, "local"),
            SimPath::Remote => write!(f, "remote"),
        }
    }
}

// ── Modem wiring ────────────────────────────────────────────────────

/// Physical wiring of one modem: its GPIO pins and AT-command device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemConfig {
    pub sim_switch_pin: u32,
    pub reset_pin: u32,
    /// AT-command TTY. `None` disables APDU forwarding for this modem.
    pub device_path: Option<PathBuf>,
    pub is_primary: bool,
}

/// Identifies a modem within a [`ModemSetup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModemId {
    Primary,
    Secondary,
}

impl std::fmt::Display for ModemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModemId::Primary => write!(f, "primary"),
            ModemId::Secondary => write!(f, "secondary"),
        }
    }
}

/// Single- or dual-modem router, selected at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModemSetup {
    Single(ModemConfig),
    Dual {
        primary: ModemConfig,
        secondary: ModemConfig,
    },
}

impl ModemSetup {
    pub fn primary(&self) -> &ModemConfig {
        match self {
            ModemSetup::Single(m) => m,
            ModemSetup::Dual { primary, .. } => primary,
        }
    }

    pub fn secondary(&self) -> Option<&ModemConfig> {
        match self {
            ModemSetup::Single(_) => None,
            ModemSetup::Dual { secondary, .. } => Some(secondary),
        }
    }

    /// All modems with their identifiers, primary first.
    pub fn modems(&self) -> Vec<(ModemId, &ModemConfig)> {
        let mut out = vec![(ModemId::Primary, self.primary())];
        if let Some(secondary) = self.secondary() {
            out.push((ModemId::Secondary, secondary));
        }
        out
    }
}

// ── Signal quality ──────────────────────────────────────────────────

/// Most recent `+CSQ` reading. Overwritten on every successful parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSample {
    pub rssi_dbm: i16,
    pub ber: u8,
    pub sampled_at: DateTime<Utc>,
}

/// CSQ value meaning "not known or not detectable".
pub const CSQ_UNKNOWN: u8 = 99;

impl SignalSample {
    /// Build a sample from raw CSQ values. Returns `None` for 99 (unknown)
    /// and anything outside the 0..=31 range.
    pub fn from_csq(rssi: u8, ber: u8) -> Option<Self> {
        csq_to_dbm(rssi).map(|rssi_dbm| SignalSample {
            rssi_dbm,
            ber,
            sampled_at: Utc::now(),
        })
    }
}

/// 27.007 CSQ mapping: `dBm = -113 + 2 * rssi` for rssi in 0..=31.
pub fn csq_to_dbm(rssi: u8) -> Option<i16> {
    match rssi {
        0..=31 => Some(-113 + 2 * rssi as i16),
        _ => None,
    }
}

// ── Slot assignment ─────────────────────────────────────────────────

/// Slot assignment handed out by the orchestrator.
///
/// Only constructed through [`crate::protocol::AssignmentFields::into_assignment`],
/// which guarantees `bank_id`, `slot_id`, `bankd_host` and `bankd_port` are
/// all non-zero / non-empty. Fields are read through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub(crate) bank_id: u32,
    pub(crate) slot_id: u32,
    pub(crate) iccid: String,
    pub(crate) imsi: String,
    pub(crate) bankd_host: String,
    pub(crate) bankd_port: u16,
    pub(crate) confirmed_mapping_mode: Option<MappingMode>,
}

impl SlotAssignment {
    pub fn bank_id(&self) -> u32 {
        self.bank_id
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn iccid(&self) -> &str {
        &self.iccid
    }

    pub fn imsi(&self) -> &str {
        &self.imsi
    }

    pub fn bankd_host(&self) -> &str {
        &self.bankd_host
    }

    pub fn bankd_port(&self) -> u16 {
        self.bankd_port
    }

    /// Mapping mode echoed back by the orchestrator, if it sent one.
    pub fn confirmed_mapping_mode(&self) -> Option<MappingMode> {
        self.confirmed_mapping_mode
    }
}

// ── Statistics ──────────────────────────────────────────────────────

/// Point-in-time copy of the bridge counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub tpdus_sent: u64,
    pub tpdus_received: u64,
    pub errors: u64,
    pub reconnections: u64,
    pub sim_switches: u64,
    pub signal: Option<SignalSample>,
    /// ATR currently held for the modem, uppercase hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<String>,
}
