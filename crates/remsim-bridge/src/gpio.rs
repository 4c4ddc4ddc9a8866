//! GPIO access used by the SIM-path controller.
//!
//! Production routers expose pins through the legacy sysfs interface under
//! `/sys/class/gpio`. The [`Gpio`] trait keeps the controller independent of
//! that so tests can observe pin writes.

use std::io;
use std::path::PathBuf;

/// Default sysfs GPIO root.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Minimal pin capability: export, direction, value.
pub trait Gpio: Send + Sync {
    fn export(&self, pin: u32) -> io::Result<()>;
    fn set_direction(&self, pin: u32, direction: Direction) -> io::Result<()>;
    fn set_value(&self, pin: u32, high: bool) -> io::Result<()>;
}

/// Sysfs-backed GPIO.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new(SYSFS_GPIO_ROOT)
    }
}

impl SysfsGpio {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pin_attr(&self, pin: u32, attr: &str) -> PathBuf {
        self.root.join(format!("gpio{pin}")).join(attr)
    }
}

impl Gpio for SysfsGpio {
    fn export(&self, pin: u32) -> io::Result<()> {
        match std::fs::write(self.root.join("export"), pin.to_string()) {
            Ok(()) => Ok(()),
            // Already exported.
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                tracing::debug!(pin, "gpio already exported");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_direction(&self, pin: u32, direction: Direction) -> io::Result<()> {
        std::fs::write(self.pin_attr(pin, "direction"), direction.as_str())
    }

    fn set_value(&self, pin: u32, high: bool) -> io::Result<()> {
        std::fs::write(self.pin_attr(pin, "value"), if high { "1" } else { "0" })?;
        tracing::debug!(pin, value = high as u8, "gpio set");
        Ok(())
    }
}
