use std::net::SocketAddr;

/// Errors surfaced by the control-plane HTTP handlers.
///
/// Everything internal to the data plane (malformed frames, unknown peers, failed kernel
/// mutations) is recovered locally and never reaches this type; see the module-level docs on
/// [`crate::tunnel`] and [`crate::routing`] for how those are handled inline.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("device {0} is not connected")]
    DeviceNotConnected(crate::session::DeviceId),

    #[error("device {0} has no routing table yet")]
    RoutingNotReady(std::net::Ipv4Addr),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

/// Errors from shelling out to `ip`/`iptables`.
///
/// Callers log these and move on: kernel programming failures are treated as recoverable, since
/// the next attach/detach cycle (or daemon restart) reconciles the rule set.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the transparent CONNECT forwarder's per-connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("failed to recover original destination: {0}")]
    OriginalDst(#[source] std::io::Error),

    #[error("no binding for client {0}")]
    NoBinding(std::net::Ipv4Addr),

    #[error("per-device concurrency limit reached for {0:?}")]
    ConcurrencyLimit(SocketAddr),

    #[error("dial or CONNECT handshake to upstream proxy failed: {0}")]
    UpstreamProxy(#[source] std::io::Error),

    #[error("upstream proxy returned non-200 to CONNECT: {0}")]
    NonOkConnect(u16),
}
