//! The routing/NAT programmer: all mutations are idempotent shell invocations of `ip` and
//! `iptables` run under CAP_NET_ADMIN. A single [`parking_lot::Mutex`] guards the
//! four pieces of in-memory state that mutate together (device routing tables, OpenVPN bindings,
//! DNAT port bindings, and the bandwidth accumulator); kernel calls happen outside the lock so a
//! slow `iptables` invocation never blocks the data plane.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::process::Command;

use crate::error::KernelError;

pub const OPENVPN_SUBNET: &str = "10.9.0.0/24";
pub const TUN_SUBNET: &str = "192.168.255.0/24";
pub const BLACKHOLE_TABLE: u32 = 99;
pub const BLACKHOLE_RULE_PRIORITY: u32 = 32000;
pub const OPENVPN_RULE_PRIORITY: u32 = 100;

const HTTP_PROXY_PORT: u16 = 8080;
const SOCKS5_PROXY_PORT: u16 = 1080;
const UDP_RELAY_PORT: u16 = 1081;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Socks5,
    UdpRelay,
}

impl ProxyType {
    pub fn device_port(self) -> u16 {
        match self {
            ProxyType::Http => HTTP_PROXY_PORT,
            ProxyType::Socks5 => SOCKS5_PROXY_PORT,
            ProxyType::UdpRelay => UDP_RELAY_PORT,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(ProxyType::Http),
            "socks5" => Some(ProxyType::Socks5),
            "udp-relay" => Some(ProxyType::UdpRelay),
            _ => None,
        }
    }
}

/// One attached OpenVPN client: policy-routed through a handset's routing table and DNATed into
/// the transparent forwarder.
pub struct OpenVpnBinding {
    pub device_vpn_ip: Ipv4Addr,
    pub socks_user: String,
    pub socks_pass: String,
    pub bytes_used: AtomicU64,
    pub bytes_limit: u64,
}

impl OpenVpnBinding {
    /// Adds `len` bytes to the counter and reports whether the packet should still be forwarded.
    /// Per S6: the packet that pushes the counter past the limit is still forwarded; only later
    /// packets are dropped (the limit is checked *before* the add, not after).
    pub fn admit(&self, len: u64) -> bool {
        let limit = self.bytes_limit;
        if limit > 0 {
            let before = self.bytes_used.load(Ordering::Relaxed);
            if before > limit {
                return false;
            }
        }
        self.bytes_used.fetch_add(len, Ordering::Relaxed);
        true
    }
}

/// One exposed proxy port: `{ExternalPort -> (DeviceVpnIp, DevicePort, ProxyType, Username)}`.
pub struct DnatBinding {
    pub device_vpn_ip: Ipv4Addr,
    pub device_port: u16,
    pub proxy_type: ProxyType,
    pub username: String,
}

#[derive(Default)]
struct RoutingState {
    /// DeviceVpnIp -> routing table number.
    device_tables: HashMap<Ipv4Addr, u32>,
    /// ClientVpnIp -> binding.
    openvpn_bindings: HashMap<Ipv4Addr, Arc<OpenVpnBinding>>,
    /// ExternalPort -> binding.
    dnat_bindings: HashMap<u16, DnatBinding>,
    /// Username -> bytes carried over from a previous flush whose POST to the management API
    /// did not (yet) succeed, or whose iptables counter read raced a rule removal.
    port_accumulator: HashMap<String, u64>,
}

pub struct RoutingProgrammer {
    tun_name: String,
    tun_gateway_ip: Ipv4Addr,
    forwarder_port: u16,
    state: Mutex<RoutingState>,
}

impl RoutingProgrammer {
    pub fn new(tun_name: impl Into<String>, tun_gateway_ip: Ipv4Addr, forwarder_port: u16) -> Self {
        Self {
            tun_name: tun_name.into(),
            tun_gateway_ip,
            forwarder_port,
            state: Mutex::new(RoutingState::default()),
        }
    }

    /// Installs the blackhole safety net: any OpenVPN-subnet traffic without a
    /// matching per-client rule lands in table 99 and is dropped.
    pub async fn install_blackhole(&self) {
        run_logged(&["route", "replace", "blackhole", "default", "table", &BLACKHOLE_TABLE.to_string()]).await;
        run_logged(&[
            "rule", "add", "from", OPENVPN_SUBNET, "lookup", &BLACKHOLE_TABLE.to_string(), "priority",
            &BLACKHOLE_RULE_PRIORITY.to_string(),
        ])
        .await;
    }

    fn table_for(vpn_ip: Ipv4Addr) -> u32 {
        vpn_ip.octets()[3] as u32 + 100
    }

    /// Programs (or reasserts) a device's default route through its dedicated table. Called on
    /// both new AUTH and silent reconnect.
    pub async fn setup_device(&self, device_vpn_ip: Ipv4Addr) -> Result<(), KernelError> {
        let table = Self::table_for(device_vpn_ip);
        self.state.lock().device_tables.insert(device_vpn_ip, table);

        run_ip(&[
            "route", "replace", "default", "via", &device_vpn_ip.to_string(), "dev", &self.tun_name,
            "table", &table.to_string(),
        ])
        .await
    }

    /// Tears down a device: detaches every dependent OpenVPN binding (kernel rules removed in a
    /// delete-until-fail loop so accumulated duplicates vanish) and flushes its routing table.
    pub async fn teardown_device(&self, device_vpn_ip: Ipv4Addr) {
        let stale_clients: Vec<Ipv4Addr> = {
            let state = self.state.lock();
            state
                .openvpn_bindings
                .iter()
                .filter(|(_, b)| b.device_vpn_ip == device_vpn_ip)
                .map(|(client, _)| *client)
                .collect()
        };
        for client_vpn_ip in stale_clients {
            self.detach_openvpn(client_vpn_ip).await;
        }

        let table = self.state.lock().device_tables.remove(&device_vpn_ip);
        if let Some(table) = table {
            let _ = run_ip(&["route", "flush", "table", &table.to_string()]).await;
        }
    }

    pub fn table_for_device(&self, device_vpn_ip: Ipv4Addr) -> Option<u32> {
        self.state.lock().device_tables.get(&device_vpn_ip).copied()
    }

    /// Attaches an OpenVPN client: requires a routing table, upserts the binding,
    /// then idempotently (pre-clear, then add) programs the ip-rule and DNAT rule.
    pub async fn attach_openvpn(
        &self,
        client_vpn_ip: Ipv4Addr,
        device_vpn_ip: Ipv4Addr,
        socks_user: String,
        socks_pass: String,
        bytes_limit: u64,
        bytes_used: u64,
    ) -> Result<(), crate::error::ControlError> {
        let table = self
            .table_for_device(device_vpn_ip)
            .ok_or(crate::error::ControlError::RoutingNotReady(device_vpn_ip))?;

        let binding = Arc::new(OpenVpnBinding {
            device_vpn_ip,
            socks_user,
            socks_pass,
            bytes_used: AtomicU64::new(bytes_used),
            bytes_limit,
        });
        self.state.lock().openvpn_bindings.insert(client_vpn_ip, binding);

        delete_ip_rule_loop(client_vpn_ip).await;
        let _ = run_ip(&[
            "rule", "add", "from", &format!("{client_vpn_ip}/32"), "lookup", &table.to_string(),
            "priority", &OPENVPN_RULE_PRIORITY.to_string(),
        ])
        .await;

        delete_openvpn_dnat_loop(client_vpn_ip).await;
        let client_src = format!("{client_vpn_ip}/32");
        let dest = format!("{}:{}", self.tun_gateway_ip, self.forwarder_port);
        let _ = run_iptables(&[
            "-t", "nat", "-I", "PREROUTING", "-s", &client_src, "-p", "tcp", "-j", "DNAT", "--to-destination", &dest,
        ])
        .await;

        Ok(())
    }

    /// Detaches an OpenVPN client: drops the binding, loop-deletes the ip-rule and DNAT rule.
    pub async fn detach_openvpn(&self, client_vpn_ip: Ipv4Addr) {
        self.state.lock().openvpn_bindings.remove(&client_vpn_ip);
        delete_ip_rule_loop(client_vpn_ip).await;
        delete_openvpn_dnat_loop(client_vpn_ip).await;
    }

    pub fn openvpn_binding_for(&self, client_vpn_ip: Ipv4Addr) -> Option<Arc<OpenVpnBinding>> {
        self.state.lock().openvpn_bindings.get(&client_vpn_ip).cloned()
    }

    /// Looks up the OpenVPN binding owning a packet's *source* IP — the data plane's NAT-routed
    /// match.
    pub fn openvpn_binding_for_source(&self, source: Ipv4Addr) -> Option<Arc<OpenVpnBinding>> {
        self.openvpn_binding_for(source)
    }

    pub fn reset_bandwidth(&self, client_vpn_ip: Option<Ipv4Addr>, username: Option<&str>) {
        let state = self.state.lock();
        if let Some(client_vpn_ip) = client_vpn_ip {
            if let Some(binding) = state.openvpn_bindings.get(&client_vpn_ip) {
                binding.bytes_used.store(0, Ordering::Relaxed);
            }
        }
        if let Some(username) = username {
            drop(state);
            let mut state = self.state.lock();
            state.port_accumulator.insert(username.to_string(), 0);
        }
    }

    /// Programs DNAT for an exposed proxy port and records the port→username mapping used to
    /// attribute iptables byte counters back to the customer connection on flush.
    pub async fn setup_dnat(
        &self,
        external_port: u16,
        device_vpn_ip: Ipv4Addr,
        proxy_type: ProxyType,
        username: String,
    ) {
        let device_port = proxy_type.device_port();
        self.state.lock().dnat_bindings.insert(
            external_port,
            DnatBinding { device_vpn_ip, device_port, proxy_type, username },
        );

        delete_dnat_rule_loop(external_port, device_vpn_ip, device_port).await;
        let tcp_args = dnat_add_args("tcp", external_port, device_vpn_ip, device_port);
        let _ = run_iptables(&tcp_args.iter().map(String::as_str).collect::<Vec<_>>()).await;
        let udp_args = dnat_add_args("udp", external_port, device_vpn_ip, device_port);
        let _ = run_iptables(&udp_args.iter().map(String::as_str).collect::<Vec<_>>()).await;
    }

    pub async fn teardown_dnat(&self, external_port: u16) {
        let binding = self.state.lock().dnat_bindings.remove(&external_port);
        if let Some(binding) = binding {
            delete_dnat_rule_loop(external_port, binding.device_vpn_ip, binding.device_port).await;
        }
    }

    pub fn username_for_port(&self, port: u16) -> Option<String> {
        self.state.lock().dnat_bindings.get(&port).map(|b| b.username.clone())
    }

    pub fn all_openvpn_usernames(&self) -> Vec<(String, u64)> {
        self.state
            .lock()
            .openvpn_bindings
            .values()
            .map(|b| (b.socks_user.clone(), b.bytes_used.load(Ordering::Relaxed)))
            .collect()
    }

    /// Folds a DNAT-rule byte delta into the in-memory accumulator and returns the running total
    /// for `username`. Used by the bandwidth flush task so transient counter reads survive a
    /// briefly-unreachable management API.
    pub fn accumulate(&self, username: &str, delta: u64) -> u64 {
        let mut state = self.state.lock();
        let entry = state.port_accumulator.entry(username.to_string()).or_insert(0);
        *entry += delta;
        *entry
    }

    /// Reads every DNAT rule's byte counter in one `-L` pass, then zeroes the whole chain with a
    /// single `-Z`. `-Z` with no rule number zeroes every counter in PREROUTING, so ports must be
    /// read together and zeroed together — reading and zeroing port-by-port would wipe every
    /// later port's counter before it is ever read.
    pub async fn read_and_zero_all_dnat_counters(&self) -> HashMap<u16, u64> {
        let output = match run_iptables_output(&["-t", "nat", "-L", "PREROUTING", "-v", "-n", "-x"]).await {
            Ok(out) => out,
            Err(_) => return HashMap::new(),
        };
        let deltas = parse_all_dnat_rule_bytes(&output);
        let _ = run_iptables(&["-t", "nat", "-Z", "PREROUTING"]).await;
        deltas
    }
}

fn dnat_add_args(proto: &str, external_port: u16, device_vpn_ip: Ipv4Addr, device_port: u16) -> Vec<String> {
    vec![
        "-t".into(), "nat".into(), "-A".into(), "PREROUTING".into(),
        "-p".into(), proto.into(), "--dport".into(), external_port.to_string(),
        "-j".into(), "DNAT".into(), "--to-destination".into(), format!("{device_vpn_ip}:{device_port}"),
    ]
}

async fn delete_ip_rule_loop(client_vpn_ip: Ipv4Addr) {
    loop {
        let ok = run_ip(&[
            "rule", "del", "from", &format!("{client_vpn_ip}/32"), "priority",
            &OPENVPN_RULE_PRIORITY.to_string(),
        ])
        .await
        .is_ok();
        if !ok {
            break;
        }
    }
}

async fn delete_openvpn_dnat_loop(client_vpn_ip: Ipv4Addr) {
    loop {
        let status = Command::new("iptables")
            .args(["-t", "nat", "-D", "PREROUTING", "-s", &format!("{client_vpn_ip}/32"), "-p", "tcp", "-j", "DNAT"])
            .output()
            .await;
        match status {
            Ok(out) if out.status.success() => continue,
            _ => break,
        }
    }
}

async fn delete_dnat_rule_loop(external_port: u16, device_vpn_ip: Ipv4Addr, device_port: u16) {
    for proto in ["tcp", "udp"] {
        loop {
            let mut args = vec!["-t", "nat", "-D", "PREROUTING", "-p", proto, "--dport"];
            let port_str = external_port.to_string();
            let dest = format!("{device_vpn_ip}:{device_port}");
            args.push(&port_str);
            args.extend(["-j", "DNAT", "--to-destination", &dest]);
            let status = Command::new("iptables").args(&args).output().await;
            match status {
                Ok(out) if out.status.success() => continue,
                _ => break,
            }
        }
    }
}

async fn run_ip(args: &[&str]) -> Result<(), KernelError> {
    run_cmd("ip", args).await
}

async fn run_iptables(args: &[&str]) -> Result<(), KernelError> {
    run_cmd("iptables", args).await
}

async fn run_cmd(program: &str, args: &[&str]) -> Result<(), KernelError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| KernelError::Spawn { command: program.to_string(), source })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(KernelError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: output.status,
            stderr,
        });
    }
    Ok(())
}

/// Runs a kernel mutation and logs (rather than propagates) a failure: a failed ip/iptables
/// invocation is logged with stderr and the programmer proceeds.
async fn run_logged(args: &[&str]) {
    if let Err(e) = run_ip(args).await {
        tracing::warn!(error = %e, "kernel programming command failed");
    }
}

async fn run_iptables_output(args: &[&str]) -> std::io::Result<String> {
    let output = Command::new("iptables").args(args).output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `iptables -t nat -L PREROUTING -v -n -x` output into a byte-counter delta per DNAT
/// external port. The format is whitespace-columnar; brittle but this is the only option without
/// linking libnetfilter. A port with both a tcp and a udp rule (see `dnat_add_args`) has its
/// counters summed.
fn parse_all_dnat_rule_bytes(output: &str) -> HashMap<u16, u64> {
    let mut totals = HashMap::new();
    for line in output.lines() {
        if !line.contains("DNAT") {
            continue;
        }
        let Some(port) = extract_dport(line) else { continue };
        let mut fields = line.split_whitespace();
        let _pkts = fields.next();
        let Some(bytes) = fields.next().and_then(parse_iptables_count) else { continue };
        *totals.entry(port).or_insert(0) += bytes;
    }
    totals
}

fn extract_dport(line: &str) -> Option<u16> {
    line.split_whitespace()
        .find_map(|word| word.strip_prefix("dpt:"))
        .and_then(|s| s.parse().ok())
}

/// `iptables -x` counters carry a `K`/`M`/`G` suffix when not run with `-x`; with `-x` they are
/// plain decimal, but we tolerate both since operators sometimes omit the flag by hand.
fn parse_iptables_count(field: &str) -> Option<u64> {
    if let Ok(n) = field.parse::<u64>() {
        return Some(n);
    }
    let (num, mult): (&str, u64) = match field.chars().last()? {
        'K' => (&field[..field.len() - 1], 1_000),
        'M' => (&field[..field.len() - 1], 1_000_000),
        'G' => (&field[..field.len() - 1], 1_000_000_000),
        _ => return None,
    };
    num.parse::<f64>().ok().map(|n| (n * mult as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_cutoff_admits_the_packet_that_crosses_the_limit() {
        let binding = OpenVpnBinding {
            device_vpn_ip: Ipv4Addr::new(192, 168, 255, 3),
            socks_user: "u".into(),
            socks_pass: "p".into(),
            bytes_used: AtomicU64::new(1020),
            bytes_limit: 1024,
        };

        assert!(binding.admit(10));
        assert_eq!(binding.bytes_used.load(Ordering::Relaxed), 1030);

        assert!(!binding.admit(10));
        assert_eq!(binding.bytes_used.load(Ordering::Relaxed), 1030);
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let binding = OpenVpnBinding {
            device_vpn_ip: Ipv4Addr::new(192, 168, 255, 3),
            socks_user: "u".into(),
            socks_pass: "p".into(),
            bytes_used: AtomicU64::new(0),
            bytes_limit: 0,
        };
        for _ in 0..1000 {
            assert!(binding.admit(1_000_000));
        }
    }

    #[test]
    fn table_number_is_host_octet_plus_100() {
        assert_eq!(RoutingProgrammer::table_for(Ipv4Addr::new(192, 168, 255, 3)), 103);
        assert_eq!(RoutingProgrammer::table_for(Ipv4Addr::new(192, 168, 255, 254)), 354);
    }

    #[test]
    fn parses_dnat_byte_counters_for_every_port_in_one_pass() {
        let output = "Chain PREROUTING (policy ACCEPT 0 packets, 0 bytes)\n\
 pkts      bytes target     prot opt in     out     source               destination\n\
   12      3456 DNAT       tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:30001 to:192.168.255.3:8080\n\
    1       100 DNAT       udp  --  *      *       0.0.0.0/0            0.0.0.0/0            udp dpt:30001 to:192.168.255.3:8080\n\
    5       900 DNAT       tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:30002 to:192.168.255.4:8080\n";
        let totals = parse_all_dnat_rule_bytes(output);
        assert_eq!(totals.get(&30001), Some(&3556));
        assert_eq!(totals.get(&30002), Some(&900));
        assert_eq!(totals.get(&40000), None);
    }

    #[test]
    fn parses_k_suffixed_counts() {
        assert_eq!(parse_iptables_count("12K"), Some(12_000));
        assert_eq!(parse_iptables_count("7"), Some(7));
    }
}
