//! The tunnel wire format: `[type:1][payload]` over UDP, plus the TCP-AUTH fallback framing.
//!
//! `AUTH`/`AUTH_OK` share byte `0x01`; `PING`/`AUTH_FAIL` share `0x03` — direction
//! disambiguates them, so [`Frame`] only models the handset→relay direction the daemon needs to
//! parse. Relay→handset frames are built directly by their callers via the `encode_*` helpers.

pub const TYPE_AUTH: u8 = 0x01;
pub const TYPE_DATA: u8 = 0x02;
pub const TYPE_PING: u8 = 0x03;
pub const TYPE_AUTH_FAIL: u8 = 0x03;
pub const TYPE_PONG: u8 = 0x04;
pub const TYPE_COMMAND: u8 = 0x05;

pub const DEVICE_ID_LEN: usize = 16;
pub const IPV4_HEADER_MIN_LEN: usize = 20;
pub const MTU: usize = 1400;

/// A parsed handset→relay datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Auth { device_id: [u8; DEVICE_ID_LEN] },
    Data { packet: &'a [u8] },
    Ping,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("AUTH payload shorter than {DEVICE_ID_LEN} bytes")]
    AuthTooShort,
    #[error("DATA payload shorter than the minimum IPv4 header ({IPV4_HEADER_MIN_LEN} bytes)")]
    DataTooShort,
}

/// Parses a single UDP datagram received from a handset.
pub fn decode(datagram: &[u8]) -> Result<Frame<'_>, DecodeError> {
    let (&kind, rest) = datagram.split_first().ok_or(DecodeError::Empty)?;

    match kind {
        TYPE_AUTH => {
            let device_id: [u8; DEVICE_ID_LEN] =
                rest.get(..DEVICE_ID_LEN).ok_or(DecodeError::AuthTooShort)?.try_into().expect("slice is exactly DEVICE_ID_LEN");
            Ok(Frame::Auth { device_id })
        }
        TYPE_DATA => {
            if rest.len() < IPV4_HEADER_MIN_LEN {
                return Err(DecodeError::DataTooShort);
            }
            Ok(Frame::Data { packet: rest })
        }
        TYPE_PING => Ok(Frame::Ping),
        other => Err(DecodeError::UnknownType(other)),
    }
}

pub fn encode_auth_ok(vpn_ip: std::net::Ipv4Addr) -> [u8; 5] {
    let octets = vpn_ip.octets();
    [TYPE_AUTH, octets[0], octets[1], octets[2], octets[3]]
}

pub const AUTH_FAIL: [u8; 1] = [TYPE_AUTH_FAIL];
pub const PONG: [u8; 1] = [TYPE_PONG];

/// Wraps a raw IPv4 packet read from TUN into a `DATA` frame destined for a handset.
pub fn encode_data(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + packet.len());
    out.push(TYPE_DATA);
    out.extend_from_slice(packet);
    out
}

/// A command pushed to a handset: `[0x05][json]`.
#[derive(Debug, serde::Serialize)]
pub struct CommandPayload<'a> {
    pub id: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub payload: &'a serde_json::Value,
}

pub fn encode_command(command: &CommandPayload<'_>) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(command)?;
    let mut out = Vec::with_capacity(1 + json.len());
    out.push(TYPE_COMMAND);
    out.extend(json);
    Ok(out)
}

/// The TCP-AUTH fallback framing: `[0x01][16-byte DeviceId][4-byte BE UDP port]` in, and
/// `[0x01][4-byte VpnIp]` or `[0x03]` out, for handsets whose carrier filters inbound UDP.
pub fn decode_tcp_auth(buf: &[u8]) -> Option<([u8; DEVICE_ID_LEN], u16)> {
    if buf.first() != Some(&TYPE_AUTH) {
        return None;
    }
    let device_id: [u8; DEVICE_ID_LEN] = buf.get(1..1 + DEVICE_ID_LEN)?.try_into().ok()?;
    let port_bytes: [u8; 2] = buf.get(1 + DEVICE_ID_LEN..3 + DEVICE_ID_LEN)?.try_into().ok()?;
    Some((device_id, u16::from_be_bytes(port_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_auth() {
        let mut datagram = vec![TYPE_AUTH];
        datagram.extend_from_slice(&[0xAA; DEVICE_ID_LEN]);
        assert_eq!(
            decode(&datagram).unwrap(),
            Frame::Auth { device_id: [0xAA; DEVICE_ID_LEN] }
        );
    }

    #[test]
    fn rejects_short_auth() {
        let datagram = vec![TYPE_AUTH, 0x01, 0x02];
        assert_eq!(decode(&datagram).unwrap_err(), DecodeError::AuthTooShort);
    }

    #[test]
    fn decodes_data_at_minimum_length() {
        let mut datagram = vec![TYPE_DATA];
        datagram.extend_from_slice(&[0u8; IPV4_HEADER_MIN_LEN]);
        assert_eq!(
            decode(&datagram).unwrap(),
            Frame::Data { packet: &[0u8; IPV4_HEADER_MIN_LEN] }
        );
    }

    #[test]
    fn rejects_short_data() {
        let datagram = vec![TYPE_DATA, 0, 0, 0];
        assert_eq!(decode(&datagram).unwrap_err(), DecodeError::DataTooShort);
    }

    #[test]
    fn rejects_unknown_type_and_empty() {
        assert_eq!(decode(&[0x09]).unwrap_err(), DecodeError::UnknownType(0x09));
        assert_eq!(decode(&[]).unwrap_err(), DecodeError::Empty);
    }

    #[test]
    fn auth_ok_round_trips_vpn_ip() {
        let ip = std::net::Ipv4Addr::new(192, 168, 255, 2);
        assert_eq!(encode_auth_ok(ip), [TYPE_AUTH, 192, 168, 255, 2]);
    }

    #[test]
    fn tcp_auth_roundtrip() {
        let mut buf = vec![TYPE_AUTH];
        buf.extend_from_slice(&[0x42; DEVICE_ID_LEN]);
        buf.extend_from_slice(&4567u16.to_be_bytes());
        let (device_id, port) = decode_tcp_auth(&buf).unwrap();
        assert_eq!(device_id, [0x42; DEVICE_ID_LEN]);
        assert_eq!(port, 4567);
    }
}
