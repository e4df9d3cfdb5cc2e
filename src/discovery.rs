//! Blocking UDP broadcast host discovery. Grounded on
//! `pypipboy/network.py::NetworkChannel.discoverHosts`.

use crate::error::Result;
use serde_json::Value;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

pub const AUTODISCOVER_MESSAGE: &[u8] = b"{\"cmd\": \"autodiscover\"}";
pub const AUTODISCOVER_PORT: u16 = 28000;
pub const AUTODISCOVER_TIMEOUT: Duration = Duration::from_secs(3);

/// One host's autodiscovery response, with the game's raw JSON fields plus
/// the address it answered from.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDesc {
    pub addr: String,
    pub fields: Value,
}

/// Broadcasts the autodiscover datagram and collects every well-formed
/// response until `timeout` elapses. Malformed or empty datagrams are logged
/// and skipped rather than aborting the scan.
pub fn discover_hosts(timeout: Option<Duration>) -> Result<Vec<HostDesc>> {
    let timeout = timeout.unwrap_or(AUTODISCOVER_TIMEOUT);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(timeout))?;

    let broadcast_addr = (std::net::Ipv4Addr::BROADCAST, AUTODISCOVER_PORT);
    socket.send_to(AUTODISCOVER_MESSAGE, broadcast_addr)?;

    let mut hosts = Vec::new();
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 4096];

    loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(d) if d > Duration::from_millis(0) => d,
            _ => break,
        };
        socket.set_read_timeout(Some(remaining))?;

        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if n == 0 {
                    log::debug!("discovery: empty datagram from {}", from);
                    continue;
                }
                match serde_json::from_slice::<Value>(&buf[..n]) {
                    Ok(fields) => hosts.push(HostDesc {
                        addr: from.ip().to_string(),
                        fields,
                    }),
                    Err(e) => log::debug!("discovery: malformed response from {}: {}", from, e),
                }
            }
            Err(e) if is_timeout(&e) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(hosts)
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
