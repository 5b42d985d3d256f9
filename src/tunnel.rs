//! The tunnel protocol endpoint: UDP reader, TCP-AUTH fallback acceptor, and the
//! session sweeper. Each runs as its own task; they share [`SessionTable`] and a handle to the
//! TUN write half.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use crate::management::ManagementClient;
use crate::protocol::{self, Frame};
use crate::routing::RoutingProgrammer;
use crate::session::{AuthOutcome, DeviceId, SessionTable};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT_SECS: u64 = 60;
const MAX_DATAGRAM: usize = 2048;

pub struct TunnelEndpoint {
    pub sessions: Arc<SessionTable>,
    pub routing: Arc<RoutingProgrammer>,
    pub management: ManagementClient,
    pub udp: Arc<UdpSocket>,
}

impl TunnelEndpoint {
    /// Handles one inbound AUTH frame: silent reconnect or new-session allocation.
    async fn handle_auth(&self, device_id: DeviceId, peer: SocketAddr) -> Vec<u8> {
        match self.sessions.authenticate(device_id, peer) {
            AuthOutcome::Reconnected(session) => {
                if let Err(e) = self.routing.setup_device(session.vpn_ip).await {
                    tracing::warn!(error = %e, %device_id, "failed to reassert routing on reconnect");
                }
                protocol::encode_auth_ok(session.vpn_ip).to_vec()
            }
            AuthOutcome::NewSession(session) => {
                let vpn_ip = session.vpn_ip;

                let management = self.management.clone();
                let routing = Arc::clone(&self.routing);
                tokio::spawn(async move {
                    if let Err(e) = routing.setup_device(vpn_ip).await {
                        tracing::warn!(error = %e, %device_id, "failed to program routing for new session");
                    }
                    if let Some(resp) = management.notify_connected(device_id, vpn_ip).await {
                        for conn in resp.connections {
                            let Some(proxy_type) = crate::routing::ProxyType::parse(&conn.proxy_type) else {
                                continue;
                            };
                            routing.setup_dnat(conn.port, vpn_ip, proxy_type, conn.username).await;
                        }
                    }
                });

                protocol::encode_auth_ok(vpn_ip).to_vec()
            }
            AuthOutcome::PoolExhausted => {
                tracing::warn!(%device_id, "IP pool exhausted, rejecting AUTH");
                protocol::AUTH_FAIL.to_vec()
            }
        }
    }

    /// Runs the UDP→TUN reader: the hot single-threaded path that parses inbound datagrams and
    /// writes `DATA` payloads straight to the TUN device.
    pub async fn run_udp_reader<W>(self: Arc<Self>, mut tun_writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.udp.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "UDP recv_from failed");
                    continue;
                }
            };

            match protocol::decode(&buf[..len]) {
                Ok(Frame::Auth { device_id }) => {
                    let Some(device_id) = DeviceId::from_bytes(&device_id) else { continue };
                    let reply = self.handle_auth(device_id, peer).await;
                    let _ = self.udp.send_to(&reply, peer).await;
                }
                Ok(Frame::Ping) => {
                    if let Some(session) = self.sessions.touch_peer(peer) {
                        session.touch();
                    }
                    let _ = self.udp.send_to(&protocol::PONG, peer).await;
                }
                Ok(Frame::Data { packet }) => {
                    if self.sessions.touch_peer(peer).is_none() {
                        continue;
                    }
                    if let Err(e) = tun_writer.write_all(packet).await {
                        tracing::warn!(error = %e, "TUN write failed");
                    }
                }
                Err(_) => {
                    // Malformed or unknown-type datagram: dropped silently, counted not logged.
                }
            }
        }
    }

    /// Accepts TCP-AUTH fallback connections: handsets whose carrier filters inbound
    /// UDP authenticate over TCP and are then driven entirely by the UDP reader above.
    pub async fn run_tcp_auth_acceptor(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "TCP-AUTH accept failed");
                    continue;
                }
            };
            let endpoint = Arc::clone(&self);
            tokio::spawn(async move {
                endpoint.handle_tcp_auth(stream, addr).await;
            });
        }
    }

    async fn handle_tcp_auth(&self, mut stream: tokio::net::TcpStream, addr: SocketAddr) {
        use tokio::io::AsyncReadExt;

        let mut buf = [0u8; 1 + protocol::DEVICE_ID_LEN + 2];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }

        let Some((device_id_bytes, udp_port)) = protocol::decode_tcp_auth(&buf) else {
            let _ = stream.write_all(&protocol::AUTH_FAIL).await;
            return;
        };
        let Some(device_id) = DeviceId::from_bytes(&device_id_bytes) else {
            let _ = stream.write_all(&protocol::AUTH_FAIL).await;
            return;
        };

        let peer = SocketAddr::new(addr.ip(), udp_port);
        let reply = self.handle_auth(device_id, peer).await;
        let _ = stream.write_all(&reply).await;
    }

    /// Evicts idle sessions every [`SWEEP_INTERVAL`], tearing down dependent routing/OpenVPN
    /// state, notifying the management API, and tearing down whatever DNAT bindings its
    /// disconnected response names.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            for device_id in self.sessions.idle_beyond(IDLE_TIMEOUT_SECS) {
                let Some(session) = self.sessions.evict(device_id) else { continue };
                self.routing.teardown_device(session.vpn_ip).await;
                if let Some(resp) = self.management.notify_disconnected(device_id, session.vpn_ip).await {
                    for conn in resp.connections {
                        self.routing.teardown_dnat(conn.port).await;
                    }
                }
                tracing::info!(%device_id, vpn_ip = %session.vpn_ip, "evicted idle session");
            }
        }
    }
}
