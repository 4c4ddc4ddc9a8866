//! Bridge counters.
//!
//! Each counter is bumped only by the component that owns the event it
//! counts; readers take a [`StatsSnapshot`] on demand.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use remsim_common::models::{SignalSample, StatsSnapshot};

#[derive(Debug, Default)]
pub struct Statistics {
    tpdus_sent: AtomicU64,
    tpdus_received: AtomicU64,
    errors: AtomicU64,
    reconnections: AtomicU64,
    sim_switches: AtomicU64,
    signal: Mutex<Option<SignalSample>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.tpdus_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.tpdus_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sim_switch(&self) {
        self.sim_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the latest signal sample.
    pub fn record_signal(&self, sample: SignalSample) {
        if let Ok(mut slot) = self.signal.lock() {
            *slot = Some(sample);
        }
    }

    pub fn signal(&self) -> Option<SignalSample> {
        self.signal.lock().ok().and_then(|s| *s)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tpdus_sent: self.tpdus_sent.load(Ordering::Relaxed),
            tpdus_received: self.tpdus_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            sim_switches: self.sim_switches.load(Ordering::Relaxed),
            signal: self.signal(),
            atr: None,
        }
    }
}
