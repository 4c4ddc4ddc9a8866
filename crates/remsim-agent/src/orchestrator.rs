//! IonMesh orchestrator client.
//!
//! Three independent HTTP calls: register (once at startup), heartbeat
//! (periodic, from its own task) and unregister (at shutdown). Calls are
//! serialized through a lock so at most one request is in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};

use remsim_common::models::{MappingMode, SlotAssignment};
use remsim_common::protocol::{
    API_VERSION, AssignmentFields, HeartbeatRequest, IncompleteAssignment, RegisterClientRequest,
    ResponseError,
};

/// Upper bound on every orchestrator request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub host: String,
    pub port: u16,
    pub tenant_id: i64,
    pub client_id: String,
    pub mapping_mode: MappingMode,
    pub mcc_mnc: Option<String>,
}

impl OrchestratorConfig {
    pub fn base_url(&self) -> String {
        format!(
            "http://{}:{}/api/backend/{API_VERSION}/remsim",
            self.host, self.port
        )
    }

    fn register_request(&self) -> RegisterClientRequest {
        RegisterClientRequest {
            client_id: self.client_id.clone(),
            mapping_mode: self.mapping_mode,
            mcc_mnc: self.mcc_mnc.clone().unwrap_or_default(),
            tenant_id: self.tenant_id,
        }
    }
}

// ── Transport ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("orchestrator answered HTTP {status}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// The two HTTP verbs the orchestrator API needs.
pub trait HttpTransport: Send + Sync {
    fn post_json<B: Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;

    fn delete(&self, url: &str) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// `reqwest`-backed transport with [`HTTP_TIMEOUT`] applied to every call.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("remsim-openwrt/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn read(resp: reqwest::Response) -> Result<HttpResponse, TransportError> {
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn post_json<B: Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<HttpResponse, TransportError> {
        let resp = self.client.post(url).json(body).send().await?;
        Self::read(resp).await
    }

    async fn delete(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let resp = self.client.delete(url).send().await?;
        Self::read(resp).await
    }
}

fn expect_ok(resp: HttpResponse) -> Result<HttpResponse, TransportError> {
    if resp.status == 200 {
        Ok(resp)
    } else {
        Err(TransportError::Status {
            status: resp.status,
            body: resp.body,
        })
    }
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("registration rejected: {0}")]
    Protocol(#[from] ResponseError),
    #[error(transparent)]
    IncompleteAssignment(#[from] IncompleteAssignment),
}

pub struct OrchestratorClient<T = ReqwestTransport> {
    config: OrchestratorConfig,
    transport: T,
    in_flight: Mutex<()>,
}

impl<T: HttpTransport> OrchestratorClient<T> {
    pub fn new(config: OrchestratorConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            in_flight: Mutex::new(()),
        }
    }

    /// Register this client and return the slot it was assigned.
    ///
    /// The assignment is only returned if bank, slot and bankd endpoint are
    /// all present.
    pub async fn register(&self) -> Result<SlotAssignment, RegistrationError> {
        let _guard = self.in_flight.lock().await;
        let url = format!("{}/register-client", self.config.base_url());
        tracing::info!(
            %url,
            client_id = %self.config.client_id,
            mapping_mode = %self.config.mapping_mode,
            "registering with orchestrator"
        );

        let resp = expect_ok(
            self.transport
                .post_json(&url, &self.config.register_request())
                .await?,
        )?;
        tracing::debug!(body = %resp.body, "registration response");

        let assignment = AssignmentFields::from_json(&resp.body)?.into_assignment()?;
        tracing::info!(
            bank_id = assignment.bank_id(),
            slot_id = assignment.slot_id(),
            bankd_host = %assignment.bankd_host(),
            bankd_port = assignment.bankd_port(),
            iccid = %assignment.iccid(),
            "slot assigned"
        );
        Ok(assignment)
    }

    /// Success is solely HTTP 200; the body is not read.
    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        let _guard = self.in_flight.lock().await;
        let url = format!("{}/heartbeat", self.config.base_url());
        let body = HeartbeatRequest::active(self.config.client_id.as_str());
        expect_ok(self.transport.post_json(&url, &body).await?)?;
        tracing::debug!("heartbeat acknowledged");
        Ok(())
    }

    pub async fn unregister(&self) -> Result<(), TransportError> {
        let _guard = self.in_flight.lock().await;
        let url = format!("{}/unregister/{}", self.config.base_url(), self.config.client_id);
        expect_ok(self.transport.delete(&url).await?)?;
        tracing::info!(client_id = %self.config.client_id, "unregistered from orchestrator");
        Ok(())
    }
}

/// Send heartbeats every `interval` until `shutdown` flips to true.
/// Failures are logged and never end the loop.
pub async fn run_heartbeat<T: HttpTransport>(
    client: Arc<OrchestratorClient<T>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_ok: Option<DateTime<Utc>> = None;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match client.heartbeat().await {
            Ok(()) => {
                if failures > 0 {
                    tracing::info!(failures, "heartbeat recovered");
                }
                failures = 0;
                last_ok = Some(Utc::now());
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    error = %e,
                    failures,
                    last_ok = ?last_ok.map(|t| t.to_rfc3339()),
                    "heartbeat failed"
                );
            }
        }
    }
    tracing::debug!("heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Post(String, serde_json::Value),
        Delete(String),
    }

    /// Replays canned responses and records every call.
    #[derive(Default)]
    struct MockTransport {
        calls: StdMutex<Vec<Call>>,
        responses: StdMutex<VecDeque<HttpResponse>>,
    }

    impl MockTransport {
        fn replying(responses: &[(u16, &str)]) -> Self {
            Self {
                calls: StdMutex::default(),
                responses: StdMutex::new(
                    responses
                        .iter()
                        .map(|(status, body)| HttpResponse {
                            status: *status,
                            body: body.to_string(),
                        })
                        .collect(),
                ),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self) -> HttpResponse {
            self.responses.lock().unwrap().pop_front().unwrap_or(HttpResponse {
                status: 200,
                body: String::new(),
            })
        }
    }

    impl HttpTransport for MockTransport {
        async fn post_json<B: Serialize + Sync>(
            &self,
            url: &str,
            body: &B,
        ) -> Result<HttpResponse, TransportError> {
            let body = serde_json::to_value(body).unwrap();
            self.calls.lock().unwrap().push(Call::Post(url.to_string(), body));
            Ok(self.next())
        }

        async fn delete(&self, url: &str) -> Result<HttpResponse, TransportError> {
            self.calls.lock().unwrap().push(Call::Delete(url.to_string()));
            Ok(self.next())
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            host: "10.0.0.1".into(),
            port: 5000,
            tenant_id: 1,
            client_id: "router-7".into(),
            mapping_mode: MappingMode::OneToOneSwsim,
            mcc_mnc: None,
        }
    }

    const ASSIGNMENT: &str = r#"{"bank_id":3,"slot_id":7,"iccid":"8944","imsi":"2500","bankd_endpoint":"http://bankd.local:9999","mapping_mode":"ONE_TO_ONE_VSIM"}"#;

    #[tokio::test]
    async fn register_posts_request_and_parses_assignment() {
        let client = OrchestratorClient::new(config(), MockTransport::replying(&[(200, ASSIGNMENT)]));
        let assignment = client.register().await.unwrap();

        assert_eq!(assignment.bank_id(), 3);
        assert_eq!(assignment.slot_id(), 7);
        assert_eq!(assignment.bankd_host(), "bankd.local");
        assert_eq!(assignment.bankd_port(), 9999);
        assert_eq!(assignment.confirmed_mapping_mode(), Some(MappingMode::OneToOneVsim));

        assert_eq!(
            client.transport.calls(),
            vec![Call::Post(
                "http://10.0.0.1:5000/api/backend/v1/remsim/register-client".into(),
                serde_json::json!({
                    "client_id": "router-7",
                    "mapping_mode": "ONE_TO_ONE_SWSIM",
                    "mcc_mnc": "",
                    "tenant_id": 1
                })
            )]
        );
    }

    #[tokio::test]
    async fn error_status_is_protocol_error() {
        let body = r#"{"status":"error","message":"no free slot","bank_id":3,"slot_id":7,"bankd_endpoint":"h:1"}"#;
        let client = OrchestratorClient::new(config(), MockTransport::replying(&[(200, body)]));
        match client.register().await {
            Err(RegistrationError::Protocol(ResponseError::ErrorStatus(msg))) => {
                assert_eq!(msg, "no free slot")
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_fields_are_incomplete() {
        let body = r#"{"bank_id":3,"bankd_endpoint":"bankd.local"}"#;
        let client = OrchestratorClient::new(config(), MockTransport::replying(&[(200, body)]));
        match client.register().await {
            Err(RegistrationError::IncompleteAssignment(e)) => assert_eq!(e.missing, vec!["slot_id"]),
            other => panic!("expected incomplete assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_200_is_transport_error() {
        let client = OrchestratorClient::new(config(), MockTransport::replying(&[(503, ASSIGNMENT)]));
        assert!(matches!(
            client.register().await,
            Err(RegistrationError::Transport(TransportError::Status { status: 503, .. }))
        ));
    }

    #[tokio::test]
    async fn heartbeat_and_unregister_urls() {
        let client = OrchestratorClient::new(config(), MockTransport::replying(&[(200, "ignored"), (404, "")]));
        client.heartbeat().await.unwrap();
        assert!(client.unregister().await.is_err());

        assert_eq!(
            client.transport.calls(),
            vec![
                Call::Post(
                    "http://10.0.0.1:5000/api/backend/v1/remsim/heartbeat".into(),
                    serde_json::json!({"client_id": "router-7", "status": "active"})
                ),
                Call::Delete("http://10.0.0.1:5000/api/backend/v1/remsim/unregister/router-7".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_ticks_until_shutdown() {
        let client = Arc::new(OrchestratorClient::new(
            config(),
            MockTransport::replying(&[(500, ""), (200, "")]),
        ));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_heartbeat(client.clone(), Duration::from_secs(30), rx));

        tokio::time::sleep(Duration::from_secs(95)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        // Ticks at 30, 60 and 90 s; the first failure did not stop the loop.
        assert_eq!(client.transport.calls().len(), 3);
    }

    // ── Real HTTP against an in-process server ──────────────────────

    async fn serve(app: axum::Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    #[tokio::test]
    async fn reqwest_transport_round_trip() {
        use axum::Json;
        use axum::extract::Path;
        use axum::routing::{delete, post};

        let app = axum::Router::new()
            .route(
                "/api/backend/v1/remsim/register-client",
                post(|Json(req): Json<serde_json::Value>| async move {
                    assert_eq!(req["client_id"], "router-7");
                    ASSIGNMENT
                }),
            )
            .route("/api/backend/v1/remsim/heartbeat", post(|| async { "" }))
            .route(
                "/api/backend/v1/remsim/unregister/{client_id}",
                delete(|Path(id): Path<String>| async move {
                    assert_eq!(id, "router-7");
                    ""
                }),
            );
        let port = serve(app).await;

        let client = OrchestratorClient::new(
            OrchestratorConfig {
                host: "127.0.0.1".into(),
                port,
                ..config()
            },
            ReqwestTransport::new().unwrap(),
        );
        let assignment = client.register().await.unwrap();
        assert_eq!((assignment.bank_id(), assignment.slot_id()), (3, 7));
        client.heartbeat().await.unwrap();
        client.unregister().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_orchestrator_is_transport_error() {
        // Bind and drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = OrchestratorClient::new(
            OrchestratorConfig {
                host: "127.0.0.1".into(),
                port,
                ..config()
            },
            ReqwestTransport::new().unwrap(),
        );
        assert!(matches!(
            client.register().await,
            Err(RegistrationError::Transport(TransportError::Request(_)))
        ));
    }
}
