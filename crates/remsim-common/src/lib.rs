//! Shared types for the OpenWRT remote-SIM client.
//!
//! This crate contains:
//! - **Data models**: modem wiring, SIM paths, signal samples, slot assignments
//! - **Protocol bodies**: JSON requests/responses exchanged with the IonMesh orchestrator

pub mod models;
pub mod protocol;
