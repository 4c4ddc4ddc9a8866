//! Signal monitor.
//!
//! Periodically asks the bridge loop to issue `AT+CSQ`. Parsing of the reply
//! is left to the demultiplexer when it arrives.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug)]
pub struct SignalMonitor {
    interval: Option<Interval>,
    period: Option<Duration>,
}

impl SignalMonitor {
    /// `interval_secs <= 0` disables polling.
    pub fn new(interval_secs: i64) -> Self {
        if interval_secs <= 0 {
            return Self::disabled();
        }
        let period = Duration::from_secs(interval_secs as u64);
        Self {
            interval: Some(Self::schedule(period)),
            period: Some(period),
        }
    }

    pub fn disabled() -> Self {
        Self {
            interval: None,
            period: None,
        }
    }

    fn schedule(period: Duration) -> Interval {
        // First poll after one full period, not immediately.
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Change the interval at runtime. `<= 0` cancels future polls.
    pub fn set_interval(&mut self, interval_secs: i64) {
        *self = Self::new(interval_secs);
        tracing::info!(interval_secs, enabled = self.is_enabled(), "signal monitor reconfigured");
    }

    /// Resolve when the next poll is due. Never resolves while disabled.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
