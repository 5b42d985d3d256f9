//! Boot-time kernel configuration: TUN device creation, sysctl tuning, and the
//! base iptables rule set. All best-effort — a failed sysctl write or rule add is logged, never
//! fatal, matching the routing programmer's failure policy.

use std::net::Ipv4Addr;

use tokio::process::Command;

use crate::routing::{BLACKHOLE_RULE_PRIORITY, BLACKHOLE_TABLE, OPENVPN_SUBNET, TUN_SUBNET};

pub const TUN_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 255, 1);
pub const TUN_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const TUN_MTU: u16 = 1400;
pub const TUN_TXQUEUELEN: u32 = 5000;

/// Creates and configures the shared TUN device. Returns the async device split
/// by the caller into owned read/write halves for the forwarding plane and tunnel endpoint.
pub fn build_tun_device(name: &str) -> Result<tun::AsyncDevice, tun::Error> {
    let mut config = tun::Configuration::default();
    config
        .tun_name(name)
        .address(TUN_ADDRESS)
        .netmask(TUN_NETMASK)
        .mtu(TUN_MTU)
        .up();

    tun::create_as_async(&config)
}

/// Raises kernel buffer sizes and congestion control tuning. Best-effort.
pub async fn tune_sysctls(tun_name: &str) {
    set_sysctl("net.ipv4.ip_forward", "1").await;
    set_sysctl("net.ipv4.tcp_congestion_control", "bbr").await;
    set_sysctl("net.ipv4.tcp_rmem", "4096 87380 16777216").await;
    set_sysctl("net.ipv4.tcp_wmem", "4096 65536 16777216").await;
    set_sysctl("net.core.rmem_max", "16777216").await;
    set_sysctl("net.core.wmem_max", "16777216").await;
    set_sysctl("net.ipv4.tcp_mtu_probing", "1").await;

    if let Err(e) = run("ip", &["link", "set", "dev", tun_name, "txqueuelen", &TUN_TXQUEUELEN.to_string()]).await {
        tracing::debug!(error = %e, %tun_name, "failed to set txqueuelen");
    }
}

async fn set_sysctl(key: &str, value: &str) {
    if let Err(e) = run("sysctl", &["-w", &format!("{key}={value}")]).await {
        tracing::info!(error = %e, %key, "sysctl tuning failed, continuing");
    }
}

/// Programs MASQUERADE/FORWARD/INPUT rules and the blackhole safety net.
pub async fn program_base_rules(tun_name: &str, forwarder_port: u16) {
    let _ = run("iptables", &["-t", "nat", "-A", "POSTROUTING", "-s", TUN_SUBNET, "-j", "MASQUERADE"]).await;
    let _ = run("iptables", &["-A", "FORWARD", "-s", TUN_SUBNET, "-j", "ACCEPT"]).await;
    let _ = run("iptables", &["-A", "FORWARD", "-d", TUN_SUBNET, "-j", "ACCEPT"]).await;
    let _ = run("iptables", &["-A", "FORWARD", "-s", OPENVPN_SUBNET, "-j", "ACCEPT"]).await;
    let _ = run("iptables", &["-A", "FORWARD", "-d", OPENVPN_SUBNET, "-j", "ACCEPT"]).await;
    let _ = run(
        "iptables",
        &["-A", "INPUT", "-i", tun_name, "-p", "tcp", "--dport", &forwarder_port.to_string(), "-j", "ACCEPT"],
    )
    .await;

    let _ = run("ip", &["route", "replace", "blackhole", "default", "table", &BLACKHOLE_TABLE.to_string()]).await;
    let _ = run(
        "ip",
        &[
            "rule", "add", "from", OPENVPN_SUBNET, "lookup", &BLACKHOLE_TABLE.to_string(), "priority",
            &BLACKHOLE_RULE_PRIORITY.to_string(),
        ],
    )
    .await;
}

async fn run(program: &str, args: &[&str]) -> std::io::Result<()> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
