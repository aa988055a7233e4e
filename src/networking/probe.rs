use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;

use crate::protocol::{self, OPCODE_INFO, ProtocolError};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

pub const HOSTNAME_TIMEOUT: &str = "timed out";
pub const HOSTNAME_DNS_FAILED: &str = "invalid IP or domain";
pub const HOSTNAME_INCOMPLETE: &str = "incomplete reply";
pub const HOSTNAME_TRUNCATED: &str = "[hostname truncated]";

/// Snapshot of one probe. Offline snapshots carry a diagnostic in `hostname`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub online: bool,
    pub passworded: bool,
    pub players: u16,
    pub max_players: u16,
    pub hostname: String,
}

impl ServerStatus {
    pub fn offline(reason: impl Into<String>) -> Self {
        Self {
            online: false,
            passworded: false,
            players: 0,
            max_players: 0,
            hostname: reason.into(),
        }
    }

    /// Map a raw `'i'` reply to a snapshot; malformed replies become offline snapshots.
    pub fn from_reply(packet: &[u8]) -> Self {
        match protocol::decode_info(packet) {
            Ok(info) => Self {
                online: true,
                passworded: info.passworded,
                players: info.players,
                max_players: info.max_players,
                hostname: info.hostname,
            },
            Err(ProtocolError::HostnameOverrun { .. }) => Self::offline(HOSTNAME_TRUNCATED),
            Err(_) => Self::offline(HOSTNAME_INCOMPLETE),
        }
    }
}

/// Query `host:port` with an `'i'` packet. Never fails: every problem is reported as an
/// offline snapshot.
pub async fn probe(host: &str, port: u16, wait: Duration) -> ServerStatus {
    probe_with_opcode(host, port, OPCODE_INFO, wait).await
}

/// Why a probe got no usable reply.
enum Miss {
    Unresolved,
    Query(ProtocolError),
    Socket(std::io::Error),
}

pub async fn probe_with_opcode(host: &str, port: u16, opcode: u8, wait: Duration) -> ServerStatus {
    query(host, resolve_ipv4(host, port), port, opcode, wait).await
}

/// Resolution and the UDP round trip share one `wait` deadline.
async fn query<R>(host: &str, resolve: R, port: u16, opcode: u8, wait: Duration) -> ServerStatus
where
    R: Future<Output = Option<SocketAddrV4>>,
{
    let exchange = async {
        let target = resolve.await.ok_or(Miss::Unresolved)?;
        let packet = protocol::encode_query(&target.ip().to_string(), port, opcode)
            .map_err(Miss::Query)?;
        let reply = round_trip(target, &packet).await.map_err(Miss::Socket)?;
        Ok::<_, Miss>((target, reply))
    };

    match timeout(wait, exchange).await {
        Ok(Ok((target, reply))) => {
            if let Ok(header) = protocol::decode_header(&reply)
                && (header.opcode != opcode || header.port != port)
            {
                debug!(
                    "probe: {target} echoed {}:{} opcode {:?} to {:?}",
                    header.ip, header.port, header.opcode as char, opcode as char
                );
            }
            let status = ServerStatus::from_reply(&reply);
            debug!(
                "probe: {target} online={} players={}/{}",
                status.online, status.players, status.max_players
            );
            status
        }
        Ok(Err(Miss::Unresolved)) => {
            warn!("probe: could not resolve {host}");
            ServerStatus::offline(HOSTNAME_DNS_FAILED)
        }
        Ok(Err(Miss::Query(err))) => ServerStatus::offline(format!("error: {err}")),
        Ok(Err(Miss::Socket(err))) => {
            warn!("probe: socket error talking to {host}:{port}: {err}");
            ServerStatus::offline(format!("error: {err}"))
        }
        Err(_) => {
            debug!("probe: {host}:{port} did not answer within {wait:?}");
            ServerStatus::offline(HOSTNAME_TIMEOUT)
        }
    }
}

async fn resolve_ipv4(host: &str, port: u16) -> Option<SocketAddrV4> {
    let host = host.trim();
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(SocketAddrV4::new(ip, port));
    }
    lookup_host((host, port)).await.ok()?.find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    })
}

async fn round_trip(target: SocketAddrV4, packet: &[u8]) -> std::io::Result<Vec<u8>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(target).await?;
    socket.send(packet).await?;
    let mut buf = vec![0u8; 4096];
    let len = socket.recv(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}
