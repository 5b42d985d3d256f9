//! Configuration surface: `clap`-driven CLI with `env` fallback, in the idiom of the reference
//! daemons this crate is modeled on (`clap::Parser`, `#[arg(long, env = "...")]`).

use std::fmt;
use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// UDP+TCP port for the handset tunnel protocol endpoint.
    #[arg(long, env = "TUNNEL_PORT", default_value_t = 1194)]
    pub tunnel_port: u16,

    /// Control-plane HTTP surface port.
    #[arg(long, env = "CONTROL_PORT", default_value_t = 8081)]
    pub control_port: u16,

    /// Base URL of the management API.
    #[arg(long, env = "API_URL", default_value = "http://127.0.0.1:8080")]
    pub api_url: String,

    /// Listen address of the transparent CONNECT forwarder.
    #[arg(long, env = "FORWARDER_ADDR", default_value = "192.168.255.1:9999")]
    pub forwarder_addr: SocketAddr,

    /// TUN device name.
    #[arg(long, env = "TUN_NAME", default_value = "tun0")]
    pub tun_name: String,

    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Human)]
    pub log_format: LogFormat,

    /// Skip TUN/sysctl/iptables bootstrap — for tests or non-Linux dev boxes.
    #[arg(long, env = "SKIP_KERNEL_SETUP", default_value_t = false)]
    pub skip_kernel_setup: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogFormat {
    Json,
    Human,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Human => write!(f, "human"),
        }
    }
}
