//! Session parameters and the bridge event consumer.
//!
//! The RSPRO session towards the remsim server is driven elsewhere; this
//! module owns the parameters it connects with and drains what the bridge
//! reports upward.

use remsim_common::models::SlotAssignment;
use remsim_bridge::SessionEvent;
use tokio::sync::mpsc;

use crate::config::{Config, MAX_CLIENT_NUMBER};

/// Where the session connects and which slot it claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub server_host: String,
    pub server_port: u16,
    pub client_id: u16,
    pub client_slot: u16,
    /// Set once an orchestrator assignment has been applied.
    pub bank_id: Option<u32>,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_host: config.server_host.clone(),
            server_port: config.server_port,
            client_id: config.client_id,
            client_slot: config.client_slot,
            bank_id: None,
        }
    }

    /// Point the session at the bankd endpoint and slot from `assignment`.
    ///
    /// Slot ids beyond [`MAX_CLIENT_NUMBER`] leave the configured slot in
    /// place.
    pub fn apply(&mut self, assignment: &SlotAssignment) {
        self.server_host = assignment.bankd_host().to_string();
        self.server_port = assignment.bankd_port();
        self.bank_id = Some(assignment.bank_id());
        match u16::try_from(assignment.slot_id()) {
            Ok(slot) if i64::from(slot) <= MAX_CLIENT_NUMBER => self.client_slot = slot,
            _ => tracing::warn!(
                slot_id = assignment.slot_id(),
                max = MAX_CLIENT_NUMBER,
                "assigned slot out of range, keeping configured slot"
            ),
        }
        tracing::info!(
            server_host = %self.server_host,
            server_port = self.server_port,
            bank_id = assignment.bank_id(),
            client_slot = self.client_slot,
            "session retargeted by orchestrator"
        );
    }
}

/// Drain bridge events until the bridge goes away.
pub async fn run(session: SessionConfig, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    tracing::info!(
        server = %format!("{}:{}", session.server_host, session.server_port),
        client_id = session.client_id,
        client_slot = session.client_slot,
        "session ready"
    );
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Apdu(apdu) => {
                tracing::debug!(len = apdu.len(), "modem response APDU for bankd")
            }
            SessionEvent::SlotStatus(status) => tracing::info!(
                card_present = status.card_present,
                vcc_present = status.vcc_present,
                reset_active = status.reset_active,
                clk_active = status.clk_active,
                "slot status"
            ),
        }
    }
    tracing::debug!("session event stream closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use remsim_common::models::{ModemConfig, ModemSetup};
    use remsim_common::protocol::AssignmentFields;

    use super::*;

    fn config() -> Config {
        Config {
            server_host: "127.0.0.1".into(),
            server_port: 9998,
            client_id: 4,
            client_slot: 0,
            setup: ModemSetup::Single(ModemConfig {
                sim_switch_pin: 20,
                reset_pin: 21,
                device_path: None,
                is_primary: true,
            }),
            signal_interval: 60,
            heartbeat_interval: Duration::from_secs(30),
            orchestrator: None,
        }
    }

    fn assignment_with_slot(slot_id: u32) -> SlotAssignment {
        AssignmentFields {
            bank_id: 3,
            slot_id,
            iccid: "8944".into(),
            imsi: "2500".into(),
            bankd_host: "bankd.local".into(),
            bankd_port: 9999,
            mapping_mode: None,
        }
        .into_assignment()
        .unwrap()
    }

    #[test]
    fn apply_retargets_server_and_slot() {
        let mut session = SessionConfig::from_config(&config());
        session.apply(&assignment_with_slot(7));
        assert_eq!(
            session,
            SessionConfig {
                server_host: "bankd.local".into(),
                server_port: 9999,
                client_id: 4,
                client_slot: 7,
                bank_id: Some(3),
            }
        );
    }

    #[test]
    fn slot_outside_client_range_keeps_configured_slot() {
        for slot_id in [1024, 70_000] {
            let mut session = SessionConfig::from_config(&config());
            session.apply(&assignment_with_slot(slot_id));
            assert_eq!(session.client_slot, 0, "slot {slot_id}");
            assert_eq!(session.server_host, "bankd.local");
        }
    }

    #[test]
    fn highest_client_slot_is_accepted() {
        let mut session = SessionConfig::from_config(&config());
        session.apply(&assignment_with_slot(1023));
        assert_eq!(session.client_slot, 1023);
    }

    #[tokio::test]
    async fn run_ends_when_bridge_drops_sender() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Apdu(bytes::Bytes::from_static(&[0x90, 0x00])))
            .unwrap();
        drop(tx);
        run(SessionConfig::from_config(&config()), rx).await;
    }
}
