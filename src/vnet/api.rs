//! HTTP routes controlling the in-memory stack.
//!
//! `GET /connect` with `Upgrade: vmnet-frames` turns the HTTP connection
//! into a guest channel using the configured stream framing.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hyper_util::rt::TokioIo;
use serde::Serialize;

use crate::config::{DnsZone, NetworkConfig};
use crate::net::{Connection, PipeConnection};
use crate::vnet::port::GuestPort;
use crate::vnet::{ByteCounters, CounterSnapshot, ExposeRequest, ForwardError, Forwarder, UnexposeRequest};

/// `Upgrade` token a guest sends to attach through `/connect`.
pub const GUEST_UPGRADE: &str = "vmnet-frames";

/// Shared state of the stack routes.
#[derive(Clone)]
pub(crate) struct StackState {
    pub counters: Arc<ByteCounters>,
    pub forwarder: Arc<Forwarder>,
    pub port: Arc<GuestPort>,
    pub config: Arc<NetworkConfig>,
    pub search_domains: Arc<Vec<String>>,
}

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub bytes: CounterSnapshot,
    pub forwards: usize,
}

#[derive(Serialize)]
pub struct DnsResponse<'a> {
    pub zones: &'a [DnsZone],
    pub search_domains: &'a [String],
}

pub(crate) fn routes(state: StackState) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/services/forwarder/all", get(list_forwards))
        .route("/services/forwarder/expose", post(expose))
        .route("/services/forwarder/unexpose", post(unexpose))
        .route("/services/dhcp/leases", get(dhcp_leases))
        .route("/services/dns/all", get(dns_zones))
        .route("/connect", get(connect))
        .with_state(state)
}

async fn get_stats(State(state): State<StackState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        bytes: state.counters.snapshot(),
        forwards: state.forwarder.len(),
    })
}

async fn list_forwards(State(state): State<StackState>) -> Json<Vec<ExposeRequest>> {
    Json(state.forwarder.list())
}

async fn expose(State(state): State<StackState>, Json(req): Json<ExposeRequest>) -> Response {
    match state.forwarder.expose(&req).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => forward_error(e),
    }
}

async fn unexpose(State(state): State<StackState>, Json(req): Json<UnexposeRequest>) -> Response {
    match state.forwarder.unexpose(&req.local) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => forward_error(e),
    }
}

async fn dhcp_leases(State(state): State<StackState>) -> Json<BTreeMap<String, String>> {
    Json(
        state
            .config
            .dhcp_static_leases
            .iter()
            .map(|(ip, mac)| (ip.to_string(), mac.to_string()))
            .collect(),
    )
}

async fn dns_zones(State(state): State<StackState>) -> Response {
    Json(DnsResponse {
        zones: &state.config.dns,
        search_domains: &state.search_domains,
    })
    .into_response()
}

async fn connect(State(state): State<StackState>, mut request: Request) -> Response {
    let protocol = state.port.protocol();
    if !protocol.is_stream() {
        return (
            StatusCode::CONFLICT,
            format!("{protocol} framing cannot run over an HTTP connection\n"),
        )
            .into_response();
    }
    let wants_upgrade = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(GUEST_UPGRADE));
    if !wants_upgrade {
        return (
            StatusCode::UPGRADE_REQUIRED,
            [(header::UPGRADE, GUEST_UPGRADE)],
            format!("send `Upgrade: {GUEST_UPGRADE}` to attach a guest\n"),
        )
            .into_response();
    }
    if state.port.is_attached() {
        return (StatusCode::CONFLICT, "a guest is already attached\n").into_response();
    }

    let on_upgrade = hyper::upgrade::on(&mut request);
    let port = state.port.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(error = %e, "Guest upgrade failed");
                return;
            }
        };
        let conn = PipeConnection::new(TokioIo::new(upgraded));
        if let Err(e) = port.attach(&conn).await {
            tracing::warn!(connection_id = %conn.id(), error = %e, "Guest session ended with error");
        }
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Guest session close failed");
        }
    });

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::CONNECTION, "upgrade"),
            (header::UPGRADE, GUEST_UPGRADE),
        ],
    )
        .into_response()
}

fn forward_error(e: ForwardError) -> Response {
    let status = match e {
        ForwardError::InvalidAddress(_) | ForwardError::OutsideSubnet { .. } => {
            StatusCode::BAD_REQUEST
        }
        ForwardError::AlreadyExposed(_) => StatusCode::CONFLICT,
        ForwardError::NotExposed(_) => StatusCode::NOT_FOUND,
        ForwardError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %e, "Forwarder request rejected");
    (status, e.to_string()).into_response()
}
