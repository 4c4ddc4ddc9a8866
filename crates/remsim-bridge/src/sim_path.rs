//! SIM-path controller.
//!
//! One instance per physical modem. The switch pin selects which SIM the
//! modem sees (high = remote, low = local); the reset pin is pulsed to make
//! the modem re-read the card. Pins are exported and set to output lazily on
//! first use, once per controller.

use std::sync::Arc;
use std::time::Duration;

use remsim_common::models::{ModemConfig, ModemId, SimPath};

use crate::error::BridgeError;
use crate::gpio::{Direction, Gpio};
use crate::stats::Statistics;

/// How long the reset line is held high. Hardware debounce requirement.
pub const RESET_PULSE: Duration = Duration::from_millis(500);

pub struct SimPathController {
    modem: ModemId,
    sim_switch_pin: u32,
    reset_pin: u32,
    gpio: Arc<dyn Gpio>,
    stats: Arc<Statistics>,
    initialized: bool,
    path: SimPath,
}

impl SimPathController {
    pub fn new(
        modem: ModemId,
        config: &ModemConfig,
        gpio: Arc<dyn Gpio>,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            modem,
            sim_switch_pin: config.sim_switch_pin,
            reset_pin: config.reset_pin,
            gpio,
            stats,
            initialized: false,
            path: SimPath::Local,
        }
    }

    pub fn modem(&self) -> ModemId {
        self.modem
    }

    /// Last path successfully applied.
    pub fn path(&self) -> SimPath {
        self.path
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn ensure_init(&mut self) -> Result<(), BridgeError> {
        if self.initialized {
            return Ok(());
        }
        for pin in [self.sim_switch_pin, self.reset_pin] {
            self.gpio
                .export(pin)
                .and_then(|()| self.gpio.set_direction(pin, Direction::Out))
                .map_err(|source| BridgeError::Gpio { pin, source })?;
        }
        self.initialized = true;
        tracing::info!(
            modem = %self.modem,
            sim_switch_pin = self.sim_switch_pin,
            reset_pin = self.reset_pin,
            "gpio initialized"
        );
        Ok(())
    }

    fn write(&self, pin: u32, high: bool) -> Result<(), BridgeError> {
        self.gpio
            .set_value(pin, high)
            .map_err(|source| BridgeError::Gpio { pin, source })
    }

    /// Point the modem at `path`.
    pub fn select(&mut self, path: SimPath) -> Result<(), BridgeError> {
        self.ensure_init()?;
        self.write(self.sim_switch_pin, path.level())?;
        self.path = path;
        self.stats.record_sim_switch();
        tracing::info!(modem = %self.modem, %path, "sim path switched");
        Ok(())
    }

    pub fn request_remote(&mut self) -> Result<(), BridgeError> {
        self.select(SimPath::Remote)
    }

    pub fn request_local(&mut self) -> Result<(), BridgeError> {
        self.select(SimPath::Local)
    }

    /// Pulse the reset line high for [`RESET_PULSE`], then low.
    pub async fn reset_modem(&mut self) -> Result<(), BridgeError> {
        self.ensure_init()?;
        tracing::info!(modem = %self.modem, "resetting modem");
        self.write(self.reset_pin, true)?;
        tokio::time::sleep(RESET_PULSE).await;
        self.write(self.reset_pin, false)?;
        tracing::info!(modem = %self.modem, "modem reset complete");
        Ok(())
    }
}
