//! Local TCP port probing.
//!
//! Probing gives no reservation: another process can take the port between the
//! probe and the benchmark binary's own bind, so a bind failure at launch is
//! handled as a retryable slot failure.

use crate::error::PerfError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;
use tracing::trace;

/// Highest port the allocator will hand out (exclusive).
pub const PORT_CEILING: u16 = 65535;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Try an exclusive bind on the wildcard address.
///
/// `SO_REUSEADDR` stays unset (std sets it for listeners on unix), so a port
/// held by a socket in any state reads as taken.
fn try_bind(port: u16) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into()).is_ok()
}

/// Return the first port at or above `start` that can be bound.
pub fn find_free_port(start: u16) -> Result<u16, PerfError> {
    let first = start.max(1);
    for port in first..PORT_CEILING {
        if try_bind(port) {
            trace!(port, "port probe succeeded");
            return Ok(port);
        }
        trace!(port, "port busy");
    }
    Err(PerfError::NoFreePort { start })
}

/// Connect-probe used before starting the metrics endpoint, so a second
/// supervisor on the same host skips the endpoint instead of failing.
pub fn is_port_in_use(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_find_free_port_skips_bound_port() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = listener.local_addr().unwrap().port();

        let port = find_free_port(taken).unwrap();
        assert!(port > taken, "expected a port above {}, got {}", taken, port);
    }

    #[test]
    fn test_find_free_port_returns_start_when_free() {
        // Grab an ephemeral port, release it, and expect the probe to accept it.
        let port = {
            let listener = TcpListener::bind("0.0.0.0:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(find_free_port(port).unwrap() >= port);
    }

    #[test]
    fn test_find_free_port_exhausted() {
        assert!(matches!(
            find_free_port(PORT_CEILING),
            Err(PerfError::NoFreePort { start: PORT_CEILING })
        ));
    }

    #[test]
    fn test_is_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(port));

        drop(listener);
        assert!(!is_port_in_use(port));
    }
}
