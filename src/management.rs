//! Outbound HTTP client to the management API. A single [`reqwest::Client`] is built
//! once at startup and cloned into every task that needs it — cheap, since `reqwest::Client`
//! internally shares its connection pool behind an `Arc`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::DeviceId;

const PUSH_TIMEOUT: Duration = Duration::from_secs(3);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
struct ConnectedRequest {
    device_id: String,
    vpn_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSpec {
    pub port: u16,
    pub proxy_type: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectedResponse {
    pub base_port: u16,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

#[derive(Clone)]
pub struct ManagementClient {
    http: reqwest::Client,
    base_url: String,
}

impl ManagementClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    /// Fire-and-forget: a failed notification is logged and never retried
    /// (`ControlPlaneUnreachable`).
    pub async fn notify_connected(&self, device_id: DeviceId, vpn_ip: Ipv4Addr) -> Option<ConnectedResponse> {
        let url = format!("{}/api/internal/vpn/connected", self.base_url);
        let body = ConnectedRequest { device_id: device_id.to_string(), vpn_ip };

        match self.http.post(&url).json(&body).timeout(PUSH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<ConnectedResponse>().await {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!(error = %e, %device_id, "malformed connected response");
                    None
                }
            },
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), %device_id, "connected notification rejected");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, %device_id, "connected notification unreachable");
                None
            }
        }
    }

    /// Mirrors `notify_connected`'s response shape for teardown: the returned connections are the
    /// DNAT bindings the caller must tear down.
    pub async fn notify_disconnected(&self, device_id: DeviceId, vpn_ip: Ipv4Addr) -> Option<ConnectedResponse> {
        let url = format!("{}/api/internal/vpn/disconnected", self.base_url);
        let body = ConnectedRequest { device_id: device_id.to_string(), vpn_ip };

        match self.http.post(&url).json(&body).timeout(PUSH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<ConnectedResponse>().await {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!(error = %e, %device_id, "malformed disconnected response");
                    None
                }
            },
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), %device_id, "disconnected notification rejected");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, %device_id, "disconnected notification unreachable");
                None
            }
        }
    }

    pub async fn flush_bandwidth(&self, usage: &HashMap<String, u64>) {
        if usage.is_empty() {
            return;
        }

        let url = format!("{}/api/internal/bandwidth-flush", self.base_url);
        if let Err(e) = self.http.post(&url).json(usage).timeout(FLUSH_TIMEOUT).send().await {
            tracing::warn!(error = %e, count = usage.len(), "bandwidth flush unreachable; will retry next tick");
        }
    }
}
