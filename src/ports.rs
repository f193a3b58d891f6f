use crate::{Error, Result};
use std::collections::BTreeSet;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Find the lowest port in `start..=end` with nothing listening on `host`.
///
/// The port is not reserved; whoever asked has to bind it before anyone else
/// scans the same range.
pub fn find_open_port(host: &str, start: u16, end: u16) -> Result<u16> {
    find_open_port_excluding(host, start, end, &BTreeSet::new())
}

/// Like [`find_open_port`], skipping every port in `exclude` without probing it.
pub fn find_open_port_excluding(
    host: &str,
    start: u16,
    end: u16,
    exclude: &BTreeSet<u16>,
) -> Result<u16> {
    if start > end {
        return Err(Error::Config(format!(
            "empty port range {}-{}",
            start, end
        )));
    }

    for port in start..=end {
        if exclude.contains(&port) {
            continue;
        }
        if !is_listening(host, port) {
            tracing::debug!(host, port, "Found open port");
            return Ok(port);
        }
    }

    Err(Error::NoPortAvailable {
        host: host.to_string(),
        start,
        end,
    })
}

/// A refused (or otherwise failed) connect means nobody is listening.
fn is_listening(host: &str, port: u16) -> bool {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(_) => return false,
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, PROBE_TIMEOUT).is_ok())
}
