//! The packet forwarding plane: a single-threaded TUN→UDP pump that classifies every
//! egressing IPv4 packet as a direct match, a NAT-routed (OpenVPN) match, or unmatched.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;

use crate::protocol;
use crate::routing::RoutingProgrammer;
use crate::session::SessionTable;

const IPV4_MIN_LEN: usize = 20;
const READ_BUF: usize = 2048;

pub struct ForwardingPlane {
    pub sessions: Arc<SessionTable>,
    pub routing: Arc<RoutingProgrammer>,
    pub udp: Arc<UdpSocket>,
}

impl ForwardingPlane {
    /// Pulls packets off TUN into one reusable buffer and classifies each by destination. Runs forever
    /// on a dedicated task; no lock is needed because this is the sole reader of `tun_reader`.
    pub async fn run<R>(self: Arc<Self>, mut tun_reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = match tun_reader.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "TUN read failed");
                    continue;
                }
            };

            if n < IPV4_MIN_LEN {
                continue;
            }

            self.forward_packet(&buf[..n]).await;
        }
    }

    async fn forward_packet(&self, packet: &[u8]) {
        let Some(dst) = ipv4_dst(packet) else { return };

        if let Some(session) = self.sessions.by_vpn_ip(dst) {
            let frame = protocol::encode_data(packet);
            let _ = self.udp.send_to(&frame, session.peer()).await;
            return;
        }

        let Some(src) = ipv4_src(packet) else { return };
        if let Some(binding) = self.routing.openvpn_binding_for_source(src) {
            if !binding.admit(packet.len() as u64) {
                return;
            }
            let Some(session) = self.sessions.by_vpn_ip(binding.device_vpn_ip) else { return };
            let frame = protocol::encode_data(packet);
            let _ = self.udp.send_to(&frame, session.peer()).await;
        }
    }
}

fn ipv4_dst(packet: &[u8]) -> Option<Ipv4Addr> {
    let b = packet.get(16..20)?;
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

fn ipv4_src(packet: &[u8]) -> Option<Ipv4Addr> {
    let b = packet.get(12..16)?;
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut p = vec![0u8; IPV4_MIN_LEN];
        p[0] = 0x45;
        p[12..16].copy_from_slice(&src.octets());
        p[16..20].copy_from_slice(&dst.octets());
        p
    }

    #[test]
    fn extracts_src_and_dst() {
        let src = Ipv4Addr::new(10, 9, 0, 5);
        let dst = Ipv4Addr::new(192, 168, 255, 3);
        let packet = ipv4_packet(src, dst);
        assert_eq!(ipv4_src(&packet), Some(src));
        assert_eq!(ipv4_dst(&packet), Some(dst));
    }
}
