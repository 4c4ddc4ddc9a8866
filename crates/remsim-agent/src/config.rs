//! Daemon configuration.
//!
//! Three layers, lowest precedence first: built-in defaults, the config file
//! (OpenWRT UCI syntax, or TOML when the path ends in `.toml`), then
//! command-line flags and their environment variables. Out-of-range values
//! in the file are dropped with a warning; on the command line they are a
//! usage error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::builder::FalseyValueParser;
use serde::Deserialize;

use remsim_common::models::{MappingMode, ModemConfig, ModemSetup};

use crate::orchestrator::OrchestratorConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/config/remsim";

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 9998;

pub const DEFAULT_SIM_SWITCH_GPIO: u32 = 20;
pub const DEFAULT_RESET_GPIO: u32 = 21;
pub const DEFAULT_MODEM2_SIM_SWITCH_GPIO: u32 = 22;
pub const DEFAULT_MODEM2_RESET_GPIO: u32 = 23;

pub const DEFAULT_ORCHESTRATOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_ORCHESTRATOR_PORT: u16 = 5000;
pub const DEFAULT_TENANT_ID: i64 = 1;

pub const DEFAULT_SIGNAL_INTERVAL_SECS: i64 = 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Probed in order when no modem device is configured.
pub const MODEM_DEVICE_CANDIDATES: &[&str] = &["/dev/ttyUSB2", "/dev/cdc-wdm0"];

/// Highest client id / client slot the remsim server accepts.
pub const MAX_CLIENT_NUMBER: i64 = 1023;

// ── Command line ────────────────────────────────────────────────────

/// OpenWRT remote-SIM client.
#[derive(Parser, Debug, Clone)]
#[command(name = "remsim-openwrt", about = "Remote-SIM client for OpenWRT routers")]
pub struct Cli {
    /// Configuration file (UCI, or TOML if it ends in `.toml`).
    #[arg(long, env = "REMSIM_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable debug logging (overrides RUST_LOG).
    #[arg(short, long)]
    pub debug: bool,

    /// remsim server host.
    #[arg(short = 'i', long, env = "REMSIM_SERVER_HOST")]
    pub server_host: Option<String>,

    /// remsim server port.
    #[arg(short = 'p', long, env = "REMSIM_SERVER_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub server_port: Option<u16>,

    /// Client ID announced to the server.
    #[arg(short = 'c', long, env = "REMSIM_CLIENT_ID", value_parser = clap::value_parser!(u16).range(0..=MAX_CLIENT_NUMBER))]
    pub client_id: Option<u16>,

    /// Client slot announced to the server.
    #[arg(short = 'n', long, env = "REMSIM_CLIENT_SLOT", value_parser = clap::value_parser!(u16).range(0..=MAX_CLIENT_NUMBER))]
    pub client_slot: Option<u16>,

    /// AT-command device of the primary modem (auto-detected if unset).
    #[arg(long, env = "REMSIM_MODEM_DEVICE")]
    pub modem_device: Option<PathBuf>,

    #[arg(long, env = "REMSIM_SIM_SWITCH_GPIO")]
    pub sim_switch_gpio: Option<u32>,

    #[arg(long, env = "REMSIM_RESET_GPIO")]
    pub reset_gpio: Option<u32>,

    /// Drive a second modem.
    #[arg(long, env = "REMSIM_DUAL_MODEM", value_parser = FalseyValueParser::new())]
    pub dual_modem: bool,

    #[arg(long, env = "REMSIM_MODEM2_DEVICE")]
    pub modem2_device: Option<PathBuf>,

    #[arg(long, env = "REMSIM_MODEM2_SIM_SWITCH_GPIO")]
    pub modem2_sim_switch_gpio: Option<u32>,

    #[arg(long, env = "REMSIM_MODEM2_RESET_GPIO")]
    pub modem2_reset_gpio: Option<u32>,

    /// Register with the IonMesh orchestrator before connecting.
    #[arg(long, env = "IONMESH_ENABLED", value_parser = FalseyValueParser::new())]
    pub ionmesh: bool,

    #[arg(long, env = "IONMESH_HOST")]
    pub ionmesh_host: Option<String>,

    #[arg(long, env = "IONMESH_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub ionmesh_port: Option<u16>,

    #[arg(long, env = "IONMESH_TENANT_ID")]
    pub tenant_id: Option<i64>,

    /// Client identifier used with the orchestrator (defaults to the hostname).
    #[arg(long, env = "IONMESH_CLIENT_ID")]
    pub ionmesh_client_id: Option<String>,

    #[arg(long, env = "IONMESH_MAPPING_MODE")]
    pub mapping_mode: Option<MappingMode>,

    #[arg(long, env = "IONMESH_MCC_MNC")]
    pub mcc_mnc: Option<String>,

    /// Signal poll interval in seconds; 0 or negative disables polling.
    #[arg(long, env = "REMSIM_SIGNAL_INTERVAL", allow_negative_numbers = true)]
    pub signal_interval: Option<i64>,

    /// Orchestrator heartbeat interval in seconds.
    #[arg(long, env = "REMSIM_HEARTBEAT_INTERVAL", value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_interval: Option<u64>,
}

// ── Config file ─────────────────────────────────────────────────────

/// Raw config file contents. Every value is optional; numbers are kept wide
/// so range checks can warn instead of failing the whole file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub server: ServerInput,
    pub client: ClientInput,
    pub modem: ModemInput,
    pub modem2: Option<ModemInput>,
    pub ionmesh: IonmeshInput,
    pub monitor: MonitorInput,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerInput {
    pub host: Option<String>,
    pub port: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientInput {
    pub client_id: Option<i64>,
    pub client_slot: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModemInput {
    pub device: Option<PathBuf>,
    pub sim_switch_gpio: Option<u32>,
    pub reset_gpio: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IonmeshInput {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub tenant_id: Option<i64>,
    pub client_id: Option<String>,
    pub mapping_mode: Option<MappingMode>,
    pub mcc_mnc: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorInput {
    pub signal_interval: Option<i64>,
    pub heartbeat_interval: Option<i64>,
}

impl ConfigInput {
    /// Read `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&text).with_context(|| format!("invalid config TOML in {}", path.display()))
        } else {
            Ok(Self::from_uci(&text))
        }
    }

    /// Parse OpenWRT UCI syntax:
    ///
    /// ```text
    /// config remsim 'server'
    ///     option host '10.0.0.1'
    ///     option port 9998
    /// ```
    ///
    /// Options are applied to the section named by the preceding `config`
    /// line. Unknown sections and keys are ignored.
    pub fn from_uci(text: &str) -> Self {
        let mut out = Self::default();
        let mut section: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("config ") {
                let mut words = rest.split_whitespace();
                let kind = words.next();
                section = words.next().or(kind).map(|name| unquote(name).to_string());
                continue;
            }
            let Some(rest) = line.strip_prefix("option ") else {
                continue;
            };
            let Some((key, value)) = split_option(rest) else {
                tracing::warn!(line = lineno + 1, "malformed option line ignored");
                continue;
            };
            match section.as_deref() {
                Some(name) => out.apply_uci(name, key, value),
                None => tracing::warn!(line = lineno + 1, key, "option outside any section ignored"),
            }
        }
        out
    }

    fn apply_uci(&mut self, section: &str, key: &str, value: &str) {
        match (section, key) {
            ("server", "host") => self.server.host = Some(value.trim().to_string()),
            ("server", "port") => self.server.port = uci_number(section, key, value),
            ("client", "client_id") => self.client.client_id = uci_number(section, key, value),
            ("client", "client_slot") => self.client.client_slot = uci_number(section, key, value),
            ("modem", _) => self.modem.apply_uci(section, key, value),
            ("modem2", _) => self
                .modem2
                .get_or_insert_with(ModemInput::default)
                .apply_uci(section, key, value),
            ("ionmesh", "enabled") => self.ionmesh.enabled = uci_bool(section, key, value),
            ("ionmesh", "host") => self.ionmesh.host = Some(value.trim().to_string()),
            ("ionmesh", "port") => self.ionmesh.port = uci_number(section, key, value),
            ("ionmesh", "tenant_id") => self.ionmesh.tenant_id = uci_number(section, key, value),
            ("ionmesh", "client_id") => self.ionmesh.client_id = Some(value.to_string()),
            ("ionmesh", "mapping_mode") => match value.parse() {
                Ok(mode) => self.ionmesh.mapping_mode = Some(mode),
                Err(e) => tracing::warn!(section, key, error = %e, "ignoring config value"),
            },
            ("ionmesh", "mcc_mnc") => self.ionmesh.mcc_mnc = Some(value.to_string()),
            ("monitor", "signal_interval") => {
                self.monitor.signal_interval = uci_number(section, key, value)
            }
            ("monitor", "heartbeat_interval") => {
                self.monitor.heartbeat_interval = uci_number(section, key, value)
            }
            _ => tracing::debug!(section, key, "unknown config option"),
        }
    }
}

impl ModemInput {
    fn apply_uci(&mut self, section: &str, key: &str, value: &str) {
        match key {
            "device" => self.device = Some(PathBuf::from(value)),
            "sim_switch_gpio" => self.sim_switch_gpio = uci_number(section, key, value),
            "reset_gpio" => self.reset_gpio = uci_number(section, key, value),
            _ => tracing::debug!(section, key, "unknown config option"),
        }
    }
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(s)
}

/// `<key> '<value>'`, `<key> "<value>"` or `<key> <value>`.
fn split_option(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim_start();
    let end = rest.find(char::is_whitespace)?;
    let (key, value) = rest.split_at(end);
    let value = value.trim_start();
    let value = match value.chars().next()? {
        quote @ ('\'' | '"') => {
            let inner = &value[1..];
            &inner[..inner.find(quote)?]
        }
        _ => value.split_whitespace().next()?,
    };
    Some((key, value))
}

fn uci_number<T: std::str::FromStr>(section: &str, key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(section, key, value, "ignoring non-numeric config value");
    }
    parsed
}

fn uci_bool(section: &str, key: &str, value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!(section, key, value = other, "ignoring non-boolean config value");
            None
        }
    }
}

/// Keep `value` only if it lies in `range`; otherwise warn and drop it.
fn checked<T>(value: Option<i64>, range: std::ops::RangeInclusive<i64>, key: &str) -> Option<T>
where
    T: TryFrom<i64>,
{
    let v = value?;
    if !range.contains(&v) {
        tracing::warn!(key, value = v, "config value out of range, ignored");
        return None;
    }
    T::try_from(v).ok()
}

// ── Resolved configuration ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub client_id: u16,
    pub client_slot: u16,
    pub setup: ModemSetup,
    /// Seconds between `AT+CSQ` polls; `<= 0` disables polling.
    pub signal_interval: i64,
    pub heartbeat_interval: Duration,
    /// Present only when orchestration is enabled.
    pub orchestrator: Option<OrchestratorConfig>,
}

impl Config {
    /// Merge file values and command-line overrides over the defaults.
    ///
    /// `hostname` becomes the orchestrator client id when none is configured.
    pub fn resolve(cli: &Cli, file: ConfigInput, hostname: &str) -> anyhow::Result<Self> {
        let server_host = cli
            .server_host
            .clone()
            .or(file.server.host)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string());
        let server_port = cli
            .server_port
            .or_else(|| checked(file.server.port, 1..=65535, "server.port"))
            .unwrap_or(DEFAULT_SERVER_PORT);
        let client_id = cli
            .client_id
            .or_else(|| checked(file.client.client_id, 0..=MAX_CLIENT_NUMBER, "client.client_id"))
            .unwrap_or(0);
        let client_slot = cli
            .client_slot
            .or_else(|| checked(file.client.client_slot, 0..=MAX_CLIENT_NUMBER, "client.client_slot"))
            .unwrap_or(0);

        let primary = ModemConfig {
            sim_switch_pin: cli
                .sim_switch_gpio
                .or(file.modem.sim_switch_gpio)
                .unwrap_or(DEFAULT_SIM_SWITCH_GPIO),
            reset_pin: cli.reset_gpio.or(file.modem.reset_gpio).unwrap_or(DEFAULT_RESET_GPIO),
            device_path: cli.modem_device.clone().or(file.modem.device),
            is_primary: true,
        };
        let setup = if cli.dual_modem || file.modem2.is_some() {
            let modem2 = file.modem2.unwrap_or_default();
            let secondary = ModemConfig {
                sim_switch_pin: cli
                    .modem2_sim_switch_gpio
                    .or(modem2.sim_switch_gpio)
                    .unwrap_or(DEFAULT_MODEM2_SIM_SWITCH_GPIO),
                reset_pin: cli
                    .modem2_reset_gpio
                    .or(modem2.reset_gpio)
                    .unwrap_or(DEFAULT_MODEM2_RESET_GPIO),
                device_path: cli.modem2_device.clone().or(modem2.device),
                is_primary: false,
            };
            let primary_pins = [primary.sim_switch_pin, primary.reset_pin];
            anyhow::ensure!(
                primary.sim_switch_pin != primary.reset_pin
                    && !primary_pins.contains(&secondary.sim_switch_pin)
                    && !primary_pins.contains(&secondary.reset_pin)
                    && secondary.sim_switch_pin != secondary.reset_pin,
                "GPIO pins of the two modems overlap"
            );
            ModemSetup::Dual { primary, secondary }
        } else {
            anyhow::ensure!(
                primary.sim_switch_pin != primary.reset_pin,
                "SIM switch and reset GPIO are the same pin ({})",
                primary.reset_pin
            );
            ModemSetup::Single(primary)
        };

        let signal_interval = cli
            .signal_interval
            .or(file.monitor.signal_interval)
            .unwrap_or(DEFAULT_SIGNAL_INTERVAL_SECS);
        let heartbeat_secs = cli
            .heartbeat_interval
            .or_else(|| checked(file.monitor.heartbeat_interval, 1..=86_400, "monitor.heartbeat_interval"))
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);

        let ionmesh = file.ionmesh;
        let orchestrator = if cli.ionmesh || ionmesh.enabled.unwrap_or(false) {
            let host = cli
                .ionmesh_host
                .clone()
                .or(ionmesh.host)
                .unwrap_or_else(|| DEFAULT_ORCHESTRATOR_HOST.to_string());
            anyhow::ensure!(!host.trim().is_empty(), "orchestrator host is empty");
            Some(OrchestratorConfig {
                host,
                port: cli
                    .ionmesh_port
                    .or_else(|| checked(ionmesh.port, 1..=65535, "ionmesh.port"))
                    .unwrap_or(DEFAULT_ORCHESTRATOR_PORT),
                tenant_id: cli.tenant_id.or(ionmesh.tenant_id).unwrap_or(DEFAULT_TENANT_ID),
                client_id: cli
                    .ionmesh_client_id
                    .clone()
                    .or(ionmesh.client_id)
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| hostname.to_string()),
                mapping_mode: cli.mapping_mode.or(ionmesh.mapping_mode).unwrap_or_default(),
                mcc_mnc: cli.mcc_mnc.clone().or(ionmesh.mcc_mnc).filter(|m| !m.is_empty()),
            })
        } else {
            None
        };

        Ok(Self {
            server_host,
            server_port,
            client_id,
            client_slot,
            setup,
            signal_interval,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            orchestrator,
        })
    }

    /// Fill in the primary modem device from the first existing candidate,
    /// if none was configured.
    pub fn detect_modem_device<P: AsRef<Path>>(&mut self, candidates: &[P]) {
        let primary = match &mut self.setup {
            ModemSetup::Single(m) => m,
            ModemSetup::Dual { primary, .. } => primary,
        };
        if primary.device_path.is_some() {
            return;
        }
        for candidate in candidates {
            let path: &Path = candidate.as_ref();
            if path.exists() {
                primary.device_path = Some(path.to_path_buf());
                break;
            }
        }
        match &primary.device_path {
            Some(path) => tracing::info!(device = %path.display(), "modem device auto-detected"),
            None => tracing::warn!("no modem device auto-detected"),
        }
    }
}
