//! The control-plane HTTP surface: command push, DNAT refresh/teardown, OpenVPN
//! client attach/detach/bandwidth-reset, and a liveness probe. All bodies are JSON; responses are
//! `{ok:true}` or an HTTP error code with `{error:"..."}`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::management::ManagementClient;
use crate::protocol::{self, CommandPayload};
use crate::routing::RoutingProgrammer;
use crate::session::{DeviceId, SessionTable};

const BANDWIDTH_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ControlState {
    pub sessions: Arc<SessionTable>,
    pub routing: Arc<RoutingProgrammer>,
    pub management: ManagementClient,
    pub udp: Arc<tokio::net::UdpSocket>,
}

pub async fn serve(addr: SocketAddr, state: ControlState) -> std::io::Result<()> {
    let router = Router::new()
        .route("/push-command", post(push_command))
        .route("/refresh-dnat", post(refresh_dnat))
        .route("/teardown-dnat", post(teardown_dnat))
        .route("/openvpn-client-connect", post(openvpn_client_connect))
        .route("/openvpn-client-disconnect", post(openvpn_client_disconnect))
        .route("/openvpn-client-reset-bandwidth", post(openvpn_client_reset_bandwidth))
        .route("/healthz", get(healthz))
        .with_state(state);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router).await
}

/// Runs the 30 s bandwidth flush cycle: snapshot OpenVPN binding counters, read and
/// zero iptables DNAT byte counters, merge by username, POST to the management API.
pub async fn run_bandwidth_flush(state: ControlState) {
    let mut ticker = tokio::time::interval(BANDWIDTH_FLUSH_INTERVAL);
    loop {
        ticker.tick().await;

        let mut usage: std::collections::HashMap<String, u64> =
            state.routing.all_openvpn_usernames().into_iter().collect();

        let deltas = state.routing.read_and_zero_all_dnat_counters().await;
        for (port, delta) in deltas {
            let Some(username) = state.routing.username_for_port(port) else { continue };
            let total = state.routing.accumulate(&username, delta);
            usage
                .entry(username)
                .and_modify(|v| *v = (*v).max(total))
                .or_insert(total);
        }

        state.management.flush_bandwidth(&usage).await;
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn ok() -> Response {
    Json(json!({ "ok": true })).into_response()
}

#[derive(Deserialize)]
struct PushCommandRequest {
    device_id: String,
    id: String,
    #[serde(rename = "type")]
    kind: String,
    payload: serde_json::Value,
}

async fn push_command(State(state): State<ControlState>, Json(req): Json<PushCommandRequest>) -> Response {
    let Some(device_id) = parse_device_id(&req.device_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid device_id");
    };
    let Some(session) = state.sessions.by_device(device_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("device {device_id} is not connected"));
    };

    let command = CommandPayload { id: &req.id, kind: &req.kind, payload: &req.payload };
    let frame = match protocol::encode_command(&command) {
        Ok(f) => f,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    if let Err(e) = state.udp.send_to(&frame, session.peer()).await {
        tracing::warn!(error = %e, %device_id, "failed to push command");
    }
    ok()
}

#[derive(Deserialize)]
struct RefreshDnatRequest {
    device_vpn_ip: Ipv4Addr,
    base_port: u16,
    proxy_type: String,
    username: String,
}

async fn refresh_dnat(State(state): State<ControlState>, Json(req): Json<RefreshDnatRequest>) -> Response {
    let Some(proxy_type) = crate::routing::ProxyType::parse(&req.proxy_type) else {
        return error_response(StatusCode::BAD_REQUEST, format!("unknown proxy_type {}", req.proxy_type));
    };
    state
        .routing
        .setup_dnat(req.base_port, req.device_vpn_ip, proxy_type, req.username)
        .await;
    ok()
}

#[derive(Deserialize)]
struct TeardownDnatRequest {
    base_port: u16,
}

async fn teardown_dnat(State(state): State<ControlState>, Json(req): Json<TeardownDnatRequest>) -> Response {
    state.routing.teardown_dnat(req.base_port).await;
    ok()
}

#[derive(Deserialize)]
struct OpenVpnClientConnectRequest {
    client_vpn_ip: Ipv4Addr,
    device_vpn_ip: Ipv4Addr,
    socks_user: String,
    socks_pass: String,
    #[serde(default)]
    bandwidth_limit: u64,
    #[serde(default)]
    bandwidth_used: u64,
}

async fn openvpn_client_connect(
    State(state): State<ControlState>,
    Json(req): Json<OpenVpnClientConnectRequest>,
) -> Response {
    match state
        .routing
        .attach_openvpn(
            req.client_vpn_ip,
            req.device_vpn_ip,
            req.socks_user,
            req.socks_pass,
            req.bandwidth_limit,
            req.bandwidth_used,
        )
        .await
    {
        Ok(()) => ok(),
        Err(e @ crate::error::ControlError::RoutingNotReady(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Deserialize)]
struct OpenVpnClientDisconnectRequest {
    client_vpn_ip: Ipv4Addr,
}

async fn openvpn_client_disconnect(
    State(state): State<ControlState>,
    Json(req): Json<OpenVpnClientDisconnectRequest>,
) -> Response {
    state.routing.detach_openvpn(req.client_vpn_ip).await;
    ok()
}

#[derive(Deserialize)]
struct ResetBandwidthRequest {
    client_vpn_ip: Option<Ipv4Addr>,
    username: Option<String>,
}

async fn openvpn_client_reset_bandwidth(
    State(state): State<ControlState>,
    Json(req): Json<ResetBandwidthRequest>,
) -> Response {
    state.routing.reset_bandwidth(req.client_vpn_ip, req.username.as_deref());
    ok()
}

#[derive(Serialize)]
struct Healthz {
    ok: bool,
    sessions: usize,
    bindings: usize,
}

async fn healthz(State(state): State<ControlState>) -> Json<Healthz> {
    Json(Healthz {
        ok: true,
        sessions: state.sessions.len(),
        bindings: state.routing.all_openvpn_usernames().len(),
    })
}

fn parse_device_id(s: &str) -> Option<DeviceId> {
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return None;
    }
    let bytes = hex::decode(hex).ok()?;
    DeviceId::from_bytes(&bytes)
}
