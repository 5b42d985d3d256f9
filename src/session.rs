//! The handset session table: three mutually-consistent indices over a set of live [`Session`]s,
//! plus the VPN-IP allocation pool.
//!
//! Readers dominate the hot path, so each index is a [`DashMap`] (sharded reader-writer locking)
//! and the per-session `last_seen` clock is updated lock-free through an [`AtomicU64`] embedded in
//! the shared [`Session`].

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Opaque 16-byte handle identifying a handset across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

/// Live state the relay holds for one authenticated handset.
#[derive(Debug)]
pub struct Session {
    pub device_id: DeviceId,
    pub vpn_ip: Ipv4Addr,
    peer: Mutex<SocketAddr>,
    last_seen: AtomicU64,
}

impl Session {
    pub fn peer(&self) -> SocketAddr {
        *self.peer.lock()
    }

    fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock() = addr;
    }

    pub fn touch(&self) {
        self.last_seen.store(now_secs(), Ordering::Relaxed);
    }

    pub fn idle_for_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A finite bitset over the host range `FIRST..=LAST` of the server's TUN subnet.
///
/// Allocation is first-free; release is idempotent. Held behind a dedicated mutex per the
/// concurrency model — allocate/release are short critical sections independent of the session
/// table's own lock.
pub struct IpPool {
    first: u8,
    last: u8,
    in_use: Mutex<Vec<bool>>,
}

impl IpPool {
    pub fn new(first: u8, last: u8) -> Self {
        Self {
            first,
            last,
            in_use: Mutex::new(vec![false; (last - first + 1) as usize]),
        }
    }

    pub fn allocate(&self, base: Ipv4Addr) -> Option<Ipv4Addr> {
        let octets = base.octets();
        let mut in_use = self.in_use.lock();
        let idx = in_use.iter().position(|used| !used)?;
        in_use[idx] = true;
        Some(Ipv4Addr::new(octets[0], octets[1], octets[2], self.first + idx as u8))
    }

    pub fn release(&self, ip: Ipv4Addr) {
        let host = ip.octets()[3];
        if host < self.first || host > self.last {
            return;
        }
        let idx = (host - self.first) as usize;
        let mut in_use = self.in_use.lock();
        if idx < in_use.len() {
            in_use[idx] = false;
        }
    }

    pub fn free_count(&self) -> usize {
        self.in_use.lock().iter().filter(|used| !**used).count()
    }
}

/// The outcome of an AUTH attempt, consumed by the caller to decide whether to notify the
/// management API and (re)program the device's routing table.
pub enum AuthOutcome {
    /// Reconnect of a known device: same VpnIp, no notification, routing must be reasserted.
    Reconnected(Arc<Session>),
    /// Brand-new device: a VpnIp was allocated, `connected` must be posted, routing programmed.
    NewSession(Arc<Session>),
    /// The IP pool is exhausted.
    PoolExhausted,
}

/// The three mutually-consistent indices over the live session set, plus the IP pool.
pub struct SessionTable {
    by_device: DashMap<DeviceId, Arc<Session>>,
    by_vpn_ip: DashMap<Ipv4Addr, Arc<Session>>,
    by_peer: DashMap<SocketAddr, Ipv4Addr>,
    pub pool: IpPool,
    subnet_base: Ipv4Addr,
}

impl SessionTable {
    pub fn new(subnet_base: Ipv4Addr, pool_first: u8, pool_last: u8) -> Self {
        Self {
            by_device: DashMap::new(),
            by_vpn_ip: DashMap::new(),
            by_peer: DashMap::new(),
            pool: IpPool::new(pool_first, pool_last),
            subnet_base,
        }
    }

    pub fn by_vpn_ip(&self, ip: Ipv4Addr) -> Option<Arc<Session>> {
        self.by_vpn_ip.get(&ip).map(|e| Arc::clone(&e))
    }

    pub fn by_peer(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        let vpn_ip = *self.by_peer.get(&addr)?;
        self.by_vpn_ip(vpn_ip)
    }

    pub fn by_device(&self, device_id: DeviceId) -> Option<Arc<Session>> {
        self.by_device.get(&device_id).map(|e| Arc::clone(&e))
    }

    pub fn len(&self) -> usize {
        self.by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }

    /// Runs the AUTH algorithm: silent reconnect if the DeviceId is known, otherwise
    /// allocate-and-insert.
    pub fn authenticate(&self, device_id: DeviceId, peer: SocketAddr) -> AuthOutcome {
        if let Some(session) = self.by_device(device_id) {
            let old_peer = session.peer();
            if old_peer != peer {
                self.by_peer.remove(&old_peer);
                self.by_peer.insert(peer, session.vpn_ip);
                session.set_peer(peer);
            }
            session.touch();
            return AuthOutcome::Reconnected(session);
        }

        let Some(vpn_ip) = self.pool.allocate(self.subnet_base) else {
            return AuthOutcome::PoolExhausted;
        };

        let session = Arc::new(Session {
            device_id,
            vpn_ip,
            peer: Mutex::new(peer),
            last_seen: AtomicU64::new(now_secs()),
        });

        self.by_device.insert(device_id, Arc::clone(&session));
        self.by_vpn_ip.insert(vpn_ip, Arc::clone(&session));
        self.by_peer.insert(peer, vpn_ip);

        AuthOutcome::NewSession(session)
    }

    /// Records inbound traffic (DATA or PING) from `peer`, bumping `last_seen` if it maps to a
    /// live session. Returns the session so the caller can act on it without a second lookup.
    pub fn touch_peer(&self, peer: SocketAddr) -> Option<Arc<Session>> {
        let session = self.by_peer(peer)?;
        session.touch();
        Some(session)
    }

    /// Removes every index entry for `device_id` and releases its VpnIp. Returns the evicted
    /// session (if any) so the caller can tear down dependent kernel state and notify the
    /// management API.
    pub fn evict(&self, device_id: DeviceId) -> Option<Arc<Session>> {
        let (_, session) = self.by_device.remove(&device_id)?;
        self.by_vpn_ip.remove(&session.vpn_ip);
        self.by_peer.remove(&session.peer());
        self.pool.release(session.vpn_ip);
        Some(session)
    }

    /// Returns the DeviceIds of sessions idle beyond `max_idle_secs`, for the sweeper.
    pub fn idle_beyond(&self, max_idle_secs: u64) -> Vec<DeviceId> {
        self.by_device
            .iter()
            .filter(|e| e.value().idle_for_secs() > max_idle_secs)
            .map(|e| *e.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn device(byte: u8) -> DeviceId {
        DeviceId([byte; 16])
    }

    #[test]
    fn new_auth_allocates_and_reconnect_is_silent() {
        let table = SessionTable::new(Ipv4Addr::new(192, 168, 255, 1), 2, 254);

        let outcome = table.authenticate(device(1), addr(1000));
        let vpn_ip = match outcome {
            AuthOutcome::NewSession(session) => session.vpn_ip,
            _ => panic!("expected a new session"),
        };
        assert_eq!(vpn_ip, Ipv4Addr::new(192, 168, 255, 2));

        // Reconnect from a new source port preserves the VpnIp and does not re-allocate.
        let outcome = table.authenticate(device(1), addr(2000));
        match outcome {
            AuthOutcome::Reconnected(session) => {
                assert_eq!(session.vpn_ip, vpn_ip);
                assert_eq!(session.peer(), addr(2000));
            }
            _ => panic!("expected a reconnect"),
        }
        assert_eq!(table.len(), 1);
        assert!(table.by_peer(addr(1000)).is_none());
        assert!(table.by_peer(addr(2000)).is_some());
    }

    #[test]
    fn pool_conservation_across_auth_and_eviction_cycles() {
        let table = SessionTable::new(Ipv4Addr::new(192, 168, 255, 1), 2, 254);
        let initial_free = table.pool.free_count();

        for i in 0..50u8 {
            match table.authenticate(device(i), addr(3000 + i as u16)) {
                AuthOutcome::NewSession(_) => {}
                _ => panic!("expected new session for device {i}"),
            }
        }
        for i in 0..50u8 {
            assert!(table.evict(device(i)).is_some());
        }

        assert_eq!(table.pool.free_count(), initial_free);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn pool_exhaustion_reports_exhausted() {
        let table = SessionTable::new(Ipv4Addr::new(192, 168, 255, 1), 2, 3);
        assert!(matches!(
            table.authenticate(device(1), addr(1)),
            AuthOutcome::NewSession(_)
        ));
        assert!(matches!(
            table.authenticate(device(2), addr(2)),
            AuthOutcome::NewSession(_)
        ));
        assert!(matches!(
            table.authenticate(device(3), addr(3)),
            AuthOutcome::PoolExhausted
        ));
    }

    #[test]
    fn eviction_is_idempotent() {
        let table = SessionTable::new(Ipv4Addr::new(192, 168, 255, 1), 2, 254);
        table.authenticate(device(1), addr(1));
        assert!(table.evict(device(1)).is_some());
        assert!(table.evict(device(1)).is_none());
    }
}
