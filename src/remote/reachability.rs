//! Cheap reachability check: a bare TCP connect with no handshake.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::readiness::{ReachabilityFuture, ReachabilityCheck};

/// Connect timeout applied to each check.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Returns `true` when `host:port` accepts a TCP connection within
/// `limit`.
pub async fn tcp_reachable(host: &str, port: u16, limit: Duration) -> bool {
    matches!(timeout(limit, TcpStream::connect((host, port))).await, Ok(Ok(_)))
}

/// [`ReachabilityCheck`] backed by [`tcp_reachable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpReachability {
    timeout: Duration,
}

impl TcpReachability {
    /// Creates a check with a custom connect timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpReachability {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl ReachabilityCheck for TcpReachability {
    fn is_reachable<'a>(&'a self, host: &'a str, port: u16) -> ReachabilityFuture<'a> {
        Box::pin(tcp_reachable(host, port, self.timeout))
    }
}
