//! HTTP bodies exchanged with the IonMesh orchestrator.
//!
//! Requests are plain serde structs. The registration response is read with
//! fixed-key extraction: unknown keys are ignored, missing keys leave their
//! field at its zero value, and only an explicit `"status":"error"` aborts
//! the parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{MappingMode, SlotAssignment};

/// API version segment used in every orchestrator URL.
pub const API_VERSION: &str = "v1";

/// Port assumed when `bankd_endpoint` carries none.
pub const DEFAULT_BANKD_PORT: u16 = 9999;

// ── Requests ────────────────────────────────────────────────────────

/// `POST /api/backend/v1/remsim/register-client`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterClientRequest {
    pub client_id: String,
    pub mapping_mode: MappingMode,
    /// Empty string when no carrier preference is configured.
    pub mcc_mnc: String,
    pub tenant_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
}

/// `POST /api/backend/v1/remsim/heartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub client_id: String,
    pub status: ClientStatus,
}

impl HeartbeatRequest {
    pub fn active(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            status: ClientStatus::Active,
        }
    }
}

// ── Registration response ───────────────────────────────────────────

/// Why a registration body could not be read at all.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("orchestrator returned error status: {0}")]
    ErrorStatus(String),
    #[error("malformed response body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Which required assignment fields were absent or zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("incomplete assignment, missing: {}", .missing.join(", "))]
pub struct IncompleteAssignment {
    pub missing: Vec<&'static str>,
}

/// Raw fields pulled out of a registration response, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentFields {
    pub bank_id: u32,
    pub slot_id: u32,
    pub iccid: String,
    pub imsi: String,
    pub bankd_host: String,
    pub bankd_port: u16,
    pub mapping_mode: Option<MappingMode>,
}

impl AssignmentFields {
    /// Extract the known fields from a registration response body.
    pub fn from_json(body: &str) -> Result<Self, ResponseError> {
        let value: Value = serde_json::from_str(body)?;

        if value.get("status").and_then(Value::as_str) == Some("error") {
            let message = value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string();
            return Err(ResponseError::ErrorStatus(message));
        }

        let int = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0)
        };
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let (bankd_host, bankd_port) = value
            .get("bankd_endpoint")
            .and_then(Value::as_str)
            .map(parse_bankd_endpoint)
            .unwrap_or_default();

        Ok(Self {
            bank_id: int("bank_id"),
            slot_id: int("slot_id"),
            iccid: text("iccid"),
            imsi: text("imsi"),
            bankd_host,
            bankd_port,
            mapping_mode: value
                .get("mapping_mode")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
        })
    }

    /// Validate the completeness invariant and produce an assignment.
    pub fn into_assignment(self) -> Result<SlotAssignment, IncompleteAssignment> {
        let mut missing = Vec::new();
        if self.bank_id == 0 {
            missing.push("bank_id");
        }
        if self.slot_id == 0 {
            missing.push("slot_id");
        }
        if self.bankd_host.is_empty() {
            missing.push("bankd_host");
        }
        if self.bankd_port == 0 {
            missing.push("bankd_port");
        }
        if !missing.is_empty() {
            return Err(IncompleteAssignment { missing });
        }

        Ok(SlotAssignment {
            bank_id: self.bank_id,
            slot_id: self.slot_id,
            iccid: self.iccid,
            imsi: self.imsi,
            bankd_host: self.bankd_host,
            bankd_port: self.bankd_port,
            confirmed_mapping_mode: self.mapping_mode,
        })
    }
}

/// Split a bankd endpoint of the form `[scheme://]host[:port][/path]`.
///
/// A missing port yields [`DEFAULT_BANKD_PORT`]; an unparseable port yields 0,
/// which the completeness check then rejects.
pub fn parse_bankd_endpoint(endpoint: &str) -> (String, u16) {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let authority = without_scheme.split('/').next().unwrap_or("");

    match authority.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (authority.to_string(), DEFAULT_BANKD_PORT),
    }
}
