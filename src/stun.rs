//! Minimal STUN binding client used to learn a peer socket's public mapping.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info};

pub const STUN_TIMEOUT: Duration = Duration::from_millis(1200);

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to resolve {0}")]
    Resolve(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(&'static str),
}

pub type TransactionId = [u8; 12];

/// Ask each server in turn for the mapped address of `socket` and return the
/// first answer. Failures are logged and the next server is tried.
pub async fn discover(socket: &UdpSocket, servers: &[String]) -> Option<SocketAddr> {
    for server in servers {
        match query(socket, server).await {
            Ok(mapped) => {
                info!(%server, %mapped, "STUN discovered public mapping");
                return Some(mapped);
            }
            Err(e) => debug!(%server, "STUN query failed: {e}"),
        }
    }
    None
}

/// Send one binding request to `server` (`stun:host:port` or `host:port`).
pub async fn query(socket: &UdpSocket, server: &str) -> Result<SocketAddr, StunError> {
    let host = server.strip_prefix("stun:").unwrap_or(server).trim();
    let want_v4 = socket.local_addr()?.is_ipv4();
    let target = tokio::net::lookup_host(host)
        .await?
        .find(|addr| addr.is_ipv4() == want_v4)
        .ok_or_else(|| StunError::Resolve(host.to_string()))?;

    let txid = new_transaction_id();
    socket.send_to(&binding_request(&txid), target).await?;

    let mut buf = [0u8; 1024];
    let wait = async {
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != target {
                continue;
            }
            return parse_mapped_address(&buf[..n], &txid);
        }
    };
    tokio::time::timeout(STUN_TIMEOUT, wait)
        .await
        .map_err(|_| StunError::Timeout(STUN_TIMEOUT))?
}

fn new_transaction_id() -> TransactionId {
    let mut txid = [0u8; 12];
    txid.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..12]);
    txid
}

pub fn binding_request(txid: &TransactionId) -> [u8; HEADER_LEN] {
    let mut req = [0u8; HEADER_LEN];
    req[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    req[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    req[8..20].copy_from_slice(txid);
    req
}

/// Extract the mapped address from a binding success response.
/// XOR-MAPPED-ADDRESS is preferred; plain MAPPED-ADDRESS is accepted.
pub fn parse_mapped_address(msg: &[u8], txid: &TransactionId) -> Result<SocketAddr, StunError> {
    if msg.len() < HEADER_LEN {
        return Err(StunError::Malformed("too short"));
    }
    if u16::from_be_bytes([msg[0], msg[1]]) != BINDING_SUCCESS {
        return Err(StunError::Malformed("not a binding success"));
    }
    if u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]) != MAGIC_COOKIE {
        return Err(StunError::Malformed("bad magic cookie"));
    }
    if msg[8..20] != txid[..] {
        return Err(StunError::Malformed("transaction mismatch"));
    }

    let body_len = u16::from_be_bytes([msg[2], msg[3]]) as usize;
    let limit = (HEADER_LEN + body_len).min(msg.len());
    let mut offset = HEADER_LEN;
    let mut plain = None;

    while offset + 4 <= limit {
        let kind = u16::from_be_bytes([msg[offset], msg[offset + 1]]);
        let len = u16::from_be_bytes([msg[offset + 2], msg[offset + 3]]) as usize;
        offset += 4;
        if offset + len > limit {
            break;
        }
        let value = &msg[offset..offset + len];
        match kind {
            XOR_MAPPED_ADDRESS => {
                if let Some(addr) = address_value(value, txid, true) {
                    return Ok(addr);
                }
            }
            MAPPED_ADDRESS if plain.is_none() => plain = address_value(value, txid, false),
            _ => {}
        }
        // attributes are padded to 4 bytes
        offset += len.next_multiple_of(4);
    }

    plain.ok_or(StunError::Malformed("no mapped address"))
}

fn address_value(value: &[u8], txid: &TransactionId, xor: bool) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor {
                octets.iter_mut().zip(cookie).for_each(|(b, k)| *b ^= k);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let mut octets: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            if xor {
                let key = cookie.iter().chain(txid.iter());
                octets.iter_mut().zip(key).for_each(|(b, k)| *b ^= k);
            }
            IpAddr::from(octets)
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}
