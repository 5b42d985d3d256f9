use std::os::unix::io::AsRawFd;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tunnel_relay::config::{Cli, LogFormat};
use tunnel_relay::control::{self, ControlState};
use tunnel_relay::forward::ForwardingPlane;
use tunnel_relay::forwarder::Forwarder;
use tunnel_relay::management::ManagementClient;
use tunnel_relay::routing::RoutingProgrammer;
use tunnel_relay::session::SessionTable;
use tunnel_relay::tunnel::TunnelEndpoint;
use tunnel_relay::{POOL_FIRST_HOST, POOL_LAST_HOST, TUN_SUBNET_BASE};

const UDP_BUFFER_SIZE: usize = 4 * 1024 * 1024;

fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(target_os = "linux")]
    if !cli.skip_kernel_setup && !has_necessary_permissions() {
        eprintln!("tunnel-relayd needs to run as root or with the CAP_NET_ADMIN capability.");
        return ExitCode::FAILURE;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn has_necessary_permissions() -> bool {
    let is_root = nix::unistd::Uid::current().is_root();
    let has_net_admin =
        caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_NET_ADMIN).is_ok_and(|b| b);
    is_root || has_net_admin
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::builder().with_default_directive(tracing::level_filters::LevelFilter::INFO.into()).from_env_lossy();
    match format {
        LogFormat::Human => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    init_logging(cli.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tunnel-relayd starting");

    if !cli.skip_kernel_setup {
        tunnel_relay::kernel::tune_sysctls(&cli.tun_name).await;
        tunnel_relay::kernel::program_base_rules(&cli.tun_name, cli.forwarder_addr.port()).await;
    }

    let tun_device = if cli.skip_kernel_setup {
        None
    } else {
        Some(tunnel_relay::kernel::build_tun_device(&cli.tun_name)?)
    };

    let sessions = Arc::new(SessionTable::new(TUN_SUBNET_BASE, POOL_FIRST_HOST, POOL_LAST_HOST));
    let routing = Arc::new(RoutingProgrammer::new(&cli.tun_name, TUN_SUBNET_BASE, cli.forwarder_addr.port()));
    let http = reqwest::Client::new();
    let management = ManagementClient::new(http, cli.api_url.clone());

    if !cli.skip_kernel_setup {
        routing.install_blackhole().await;
    }

    let udp = Arc::new(bind_udp_socket(cli.tunnel_port).await?);
    let tcp_auth_listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.tunnel_port)).await?;

    let endpoint = Arc::new(TunnelEndpoint {
        sessions: Arc::clone(&sessions),
        routing: Arc::clone(&routing),
        management: management.clone(),
        udp: Arc::clone(&udp),
    });

    let forwarding_plane =
        Arc::new(ForwardingPlane { sessions: Arc::clone(&sessions), routing: Arc::clone(&routing), udp: Arc::clone(&udp) });

    if let Some(tun_device) = tun_device {
        let (tun_reader, tun_writer) = tokio::io::split(tun_device);
        tokio::spawn(Arc::clone(&endpoint).run_udp_reader(tun_writer));
        tokio::spawn(Arc::clone(&forwarding_plane).run(tun_reader));
    } else {
        tracing::warn!("kernel setup skipped: TUN device not created, running without packet forwarding");
    }

    tokio::spawn(Arc::clone(&endpoint).run_tcp_auth_acceptor(tcp_auth_listener));
    tokio::spawn(Arc::clone(&endpoint).run_sweeper());

    let forwarder = Arc::new(Forwarder::new(Arc::clone(&routing)));
    let forwarder_listener = tokio::net::TcpListener::bind(cli.forwarder_addr).await?;
    tokio::spawn(forwarder.run(forwarder_listener));

    let control_state = ControlState { sessions, routing, management, udp };
    let control_addr = ([0, 0, 0, 0], cli.control_port).into();
    tokio::spawn(control::run_bandwidth_flush(control_state.clone()));
    tokio::spawn(control::serve(control_addr, control_state));

    tracing::info!(
        tunnel_port = cli.tunnel_port,
        control_port = cli.control_port,
        forwarder_addr = %cli.forwarder_addr,
        "all engines spawned"
    );

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, exiting");
    Ok(())
}

async fn bind_udp_socket(port: u16) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port)).await?;

    let fd = socket.as_raw_fd();
    let size = UDP_BUFFER_SIZE as i32;
    for (level, name) in [(libc::SOL_SOCKET, libc::SO_RCVBUF), (libc::SOL_SOCKET, libc::SO_SNDBUF)] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &size as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            tracing::warn!(error = %std::io::Error::last_os_error(), "failed to raise UDP socket buffer size");
        }
    }

    Ok(socket)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
