//! The transparent HTTP-CONNECT forwarder: recovers the pre-DNAT destination via
//! `SO_ORIGINAL_DST`, sniffs the intended hostname from the client's first bytes, and relays the
//! connection through the owning handset's HTTP proxy.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::ForwarderError;
use crate::routing::RoutingProgrammer;

const PEEK_BUF_SIZE: usize = 4096;
const PEEK_DEADLINE: Duration = Duration::from_millis(200);
const SEMAPHORE_CAPACITY: usize = 8;
const SEMAPHORE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 2;
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(1)];
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const HALF_CLOSE_DRAIN: Duration = Duration::from_secs(5);
const SPLICE_BUF_SIZE: usize = 128 * 1024;

const SO_ORIGINAL_DST: libc::c_int = 80;

pub struct Forwarder {
    routing: Arc<RoutingProgrammer>,
    semaphores: DashMap<Ipv4Addr, Arc<Semaphore>>,
}

impl Forwarder {
    pub fn new(routing: Arc<RoutingProgrammer>) -> Self {
        Self { routing, semaphores: DashMap::new() }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "forwarder accept failed");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle(stream, peer).await {
                    tracing::debug!(error = %e, %peer, "forwarder connection failed");
                }
            });
        }
    }

    async fn handle(&self, client: TcpStream, peer: SocketAddr) -> Result<(), ForwarderError> {
        let orig_dst = original_dst(&client).map_err(ForwarderError::OriginalDst)?;

        let SocketAddr::V4(peer_v4) = peer else {
            return Err(ForwarderError::NoBinding(Ipv4Addr::UNSPECIFIED));
        };
        let binding = self
            .routing
            .openvpn_binding_for_source(*peer_v4.ip())
            .ok_or(ForwarderError::NoBinding(*peer_v4.ip()))?;

        let mut peek_buf = [0u8; PEEK_BUF_SIZE];
        let peeked = match tokio::time::timeout(PEEK_DEADLINE, client.peek(&mut peek_buf)).await {
            Ok(Ok(n)) => &peek_buf[..n],
            _ => &peek_buf[..0],
        };

        let host = sniff_hostname(peeked);
        let target = match &host {
            Some(h) => format!("{h}:{}", orig_dst.port()),
            None => format!("{}:{}", orig_dst.ip(), orig_dst.port()),
        };

        let device_vpn_ip = binding.device_vpn_ip;
        let semaphore = self
            .semaphores
            .entry(device_vpn_ip)
            .or_insert_with(|| Arc::new(Semaphore::new(SEMAPHORE_CAPACITY)))
            .clone();

        let _permit = tokio::time::timeout(SEMAPHORE_ACQUIRE_TIMEOUT, semaphore.acquire_owned())
            .await
            .map_err(|_| ForwarderError::ConcurrencyLimit(peer))?
            .expect("semaphore is never closed");

        let proxy_addr = SocketAddr::new(device_vpn_ip.into(), crate::routing::ProxyType::Http.device_port());
        let (upstream, leftover) =
            dial_with_retry(proxy_addr, &target, &binding.socks_user, &binding.socks_pass).await?;

        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);

        splice(client, upstream, leftover).await;
        Ok(())
    }
}

fn original_dst(stream: &TcpStream) -> io::Result<SocketAddrV4> {
    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut libc::sockaddr_in as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddrV4::new(ip, port))
}

/// Sniffs the intended hostname from a client's first bytes: a TLS ClientHello's SNI extension,
/// or an HTTP `Host:` header. Returns `None` on anything else or a malformed record.
fn sniff_hostname(peeked: &[u8]) -> Option<String> {
    if peeked.first() == Some(&0x16) {
        return parse_tls_sni(peeked);
    }
    parse_http_host(peeked)
}

/// Walks the TLS record/handshake framing precisely as specified: 5-byte record header,
/// handshake type 0x01, skip 34 bytes (version+random), skip session-id/cipher-suites/compression,
/// iterate extensions for type 0x0000 (server_name), decode the first `host_name` (type 0x00).
fn parse_tls_sni(data: &[u8]) -> Option<String> {
    if data.first() != Some(&0x16) {
        return None;
    }
    let handshake = data.get(5..)?;
    if handshake.first() != Some(&0x01) {
        return None;
    }
    let body = handshake.get(4..)?; // skip 1-byte type + 3-byte length

    let mut cursor = 34usize; // client_version(2) + random(32)

    let session_id_len = *body.get(cursor)? as usize;
    cursor += 1 + session_id_len;

    let cipher_suites_len = u16::from_be_bytes(body.get(cursor..cursor + 2)?.try_into().ok()?) as usize;
    cursor += 2 + cipher_suites_len;

    let compression_len = *body.get(cursor)? as usize;
    cursor += 1 + compression_len;

    let extensions_total = u16::from_be_bytes(body.get(cursor..cursor + 2)?.try_into().ok()?) as usize;
    cursor += 2;
    let extensions_end = cursor + extensions_total;
    let extensions = body.get(cursor..extensions_end.min(body.len()))?;

    let mut i = 0usize;
    while i + 4 <= extensions.len() {
        let ext_type = u16::from_be_bytes(extensions.get(i..i + 2)?.try_into().ok()?);
        let ext_len = u16::from_be_bytes(extensions.get(i + 2..i + 4)?.try_into().ok()?) as usize;
        let ext_data = extensions.get(i + 4..i + 4 + ext_len)?;

        if ext_type == 0x0000 {
            return parse_server_name_list(ext_data);
        }
        i += 4 + ext_len;
    }
    None
}

fn parse_server_name_list(ext_data: &[u8]) -> Option<String> {
    let list_len = u16::from_be_bytes(ext_data.get(0..2)?.try_into().ok()?) as usize;
    let list = ext_data.get(2..2 + list_len)?;

    let mut i = 0usize;
    while i + 3 <= list.len() {
        let name_type = list[i];
        let name_len = u16::from_be_bytes(list.get(i + 1..i + 3)?.try_into().ok()?) as usize;
        let name = list.get(i + 3..i + 3 + name_len)?;
        if name_type == 0x00 {
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
        i += 3 + name_len;
    }
    None
}

fn parse_http_host(peeked: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(peeked).ok()?;
    for line in text.split("\r\n") {
        if line.to_ascii_lowercase().starts_with("host:") {
            let value = line.split_once(':')?.1.trim();
            return Some(value.to_string());
        }
    }
    None
}

async fn dial_with_retry(
    proxy_addr: SocketAddr,
    target: &str,
    user: &str,
    pass: &str,
) -> Result<(TcpStream, Vec<u8>), ForwarderError> {
    let mut last_err = None;
    for attempt in 0..=MAX_RETRIES {
        match tokio::time::timeout(CONNECT_TIMEOUT, dial_once(proxy_addr, target, user, pass)).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = Some(ForwarderError::UpstreamProxy(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))),
        }
        if attempt < MAX_RETRIES {
            tokio::time::sleep(RETRY_BACKOFF[attempt as usize]).await;
        }
    }
    Err(last_err.expect("loop always sets an error before exhausting retries"))
}

async fn dial_once(proxy_addr: SocketAddr, target: &str, user: &str, pass: &str) -> Result<(TcpStream, Vec<u8>), ForwarderError> {
    let mut stream = TcpStream::connect(proxy_addr).await.map_err(ForwarderError::UpstreamProxy)?;

    let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: Basic {credentials}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.map_err(ForwarderError::UpstreamProxy)?;

    let (status_code, leftover) = read_connect_response(&mut stream).await.map_err(ForwarderError::UpstreamProxy)?;
    if status_code != 200 {
        return Err(ForwarderError::NonOkConnect(status_code));
    }

    // Bytes the proxy sent immediately after its response, in the same read: these belong to the
    // tunneled connection and must reach the client once splicing starts, not be dropped here.
    Ok((stream, leftover))
}

/// Reads the CONNECT response status line and header block, returning the status code and any
/// bytes read past the terminating `\r\n\r\n` — these are tunneled payload, not header, and must
/// not be dropped (the single most common correctness bug in this path).
async fn read_connect_response(stream: &mut TcpStream) -> io::Result<(u16, Vec<u8>)> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "proxy closed before CONNECT response"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            let header = String::from_utf8_lossy(&buf[..pos]);
            let status_line = header.lines().next().unwrap_or("");
            let status_code = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(0);
            let leftover = buf[pos + 4..].to_vec();
            return Ok((status_code, leftover));
        }
        if buf.len() > 16 * 1024 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "CONNECT response header too large"));
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn splice(client: TcpStream, upstream: TcpStream, leftover: Vec<u8>) {
    let (client_r, mut client_w) = tokio::io::split(client);
    let (upstream_r, upstream_w) = tokio::io::split(upstream);

    if !leftover.is_empty() && client_w.write_all(&leftover).await.is_err() {
        return;
    }

    let mut c2u = Box::pin(pump(client_r, upstream_w));
    let mut u2c = Box::pin(pump(upstream_r, client_w));

    let mut c2u_done = false;
    let mut u2c_done = false;

    loop {
        tokio::select! {
            _ = &mut c2u, if !c2u_done => { c2u_done = true; }
            _ = &mut u2c, if !u2c_done => { u2c_done = true; }
        }

        match (c2u_done, u2c_done) {
            (true, true) => break,
            (true, false) => {
                let _ = tokio::time::timeout(HALF_CLOSE_DRAIN, &mut u2c).await;
                break;
            }
            (false, true) => {
                let _ = tokio::time::timeout(HALF_CLOSE_DRAIN, &mut c2u).await;
                break;
            }
            (false, false) => {}
        }
    }
}

async fn pump<R, W>(mut r: R, mut w: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUF_SIZE];
    loop {
        let read = tokio::time::timeout(IDLE_TIMEOUT, r.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
        };
        if w.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = w.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let mut server_name = Vec::new();
        server_name.push(0x00); // host_name
        server_name.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        server_name.extend_from_slice(hostname.as_bytes());

        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(&server_name);

        let mut sni_extension = Vec::new();
        sni_extension.extend_from_slice(&0x0000u16.to_be_bytes());
        sni_extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        sni_extension.extend_from_slice(&server_name_list);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id len
        body.extend_from_slice(&4u16.to_be_bytes()); // cipher suites len
        body.extend_from_slice(&[0x13, 0x01, 0x13, 0x02]);
        body.push(1); // compression methods len
        body.push(0);
        body.extend_from_slice(&(sni_extension.len() as u16).to_be_bytes());
        body.extend_from_slice(&sni_extension);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let body_len = (body.len() as u32).to_be_bytes();
        handshake.extend_from_slice(&body_len[1..]); // 3-byte length
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let record = tls_client_hello_with_sni("example.com");
        assert_eq!(parse_tls_sni(&record), Some("example.com".to_string()));
    }

    #[test]
    fn malformed_record_yields_none() {
        assert_eq!(parse_tls_sni(&[0x16, 0x03, 0x01]), None);
    }

    #[test]
    fn finds_host_header_case_insensitively() {
        let req = b"GET / HTTP/1.1\r\nHOST: example.org\r\nUser-Agent: x\r\n\r\n";
        assert_eq!(parse_http_host(req), Some("example.org".to_string()));
    }

    #[test]
    fn sniff_prefers_tls_over_http() {
        let record = tls_client_hello_with_sni("secure.example");
        assert_eq!(sniff_hostname(&record), Some("secure.example".to_string()));
    }

    #[test]
    fn finds_header_end_boundary() {
        let buf = b"HTTP/1.1 200 OK\r\n\r\nleftover";
        let pos = find_header_end(buf).unwrap();
        assert_eq!(&buf[pos + 4..], b"leftover");
    }
}
