//! Seam between the bridge and the remote-SIM session state machine.
//!
//! The session FSM (card presence, RSPRO transport to bankd) lives outside
//! this crate. The bridge pushes decoded modem responses and slot status into
//! it through [`SessionHandler`].

use bytes::Bytes;
use tokio::sync::mpsc;

/// Physical slot status as reported by bankd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStatus {
    pub reset_active: bool,
    pub vcc_present: bool,
    pub clk_active: bool,
    pub card_present: bool,
}

/// Receives everything the bridge reports upward.
pub trait SessionHandler: Send {
    /// A response APDU decoded from `+CSIM:`.
    fn on_apdu(&mut self, apdu: Bytes);

    fn on_slot_status(&mut self, status: SlotStatus) {
        tracing::debug!(?status, "slot status ignored");
    }
}

/// Events forwarded by the channel-backed handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Apdu(Bytes),
    SlotStatus(SlotStatus),
}

impl SessionHandler for mpsc::UnboundedSender<SessionEvent> {
    fn on_apdu(&mut self, apdu: Bytes) {
        if self.send(SessionEvent::Apdu(apdu)).is_err() {
            tracing::warn!("session receiver dropped, APDU lost");
        }
    }

    fn on_slot_status(&mut self, status: SlotStatus) {
        if self.send(SessionEvent::SlotStatus(status)).is_err() {
            tracing::warn!("session receiver dropped, slot status lost");
        }
    }
}
