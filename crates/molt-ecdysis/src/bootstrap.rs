//! Startup: decide whether this generation binds or inherits.

use std::os::unix::io::RawFd;

use tracing::{info, warn};

use crate::error::Result;
use crate::handler::ConnectionHandler;
use crate::listener::Network;
use crate::server::Server;
use crate::spawn::INHERITED_LISTENER_FD;

/// Environment marker set on a successor by its predecessor.
pub const RESTART_ENV: &str = "MOLT_GRACEFUL_RESTART";

/// Where this generation's listener comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerSource {
    /// Bind the configured address.
    Fresh,
    /// Adopt the listener a predecessor left at this descriptor.
    Inherited(RawFd),
}

impl ListenerSource {
    /// Read [`RESTART_ENV`] from the process environment.
    pub fn from_env() -> Self {
        Self::from_marker(std::env::var(RESTART_ENV).ok().as_deref())
    }

    /// Interpret a marker value. `true`, `1` and `yes` (any case) mean
    /// inherited; anything else, or no marker, means fresh.
    pub fn from_marker(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes") => {
                Self::Inherited(INHERITED_LISTENER_FD)
            }
            _ => Self::Fresh,
        }
    }
}

/// Build this generation's server.
///
/// A fresh server binds lazily when it starts serving, so bind failures
/// surface from [`Server::serve`]. An inherited descriptor is validated here;
/// a bad one is fatal and the process should exit non-zero rather than fall
/// back to binding, since the predecessor is still holding the address.
///
/// Must be called within a Tokio runtime.
pub fn bootstrap<H: ConnectionHandler>(
    source: ListenerSource,
    network: Network,
    address: &str,
    handler: H,
) -> Result<Server<H>> {
    match source {
        ListenerSource::Fresh => {
            info!(%network, address, "Starting fresh generation");
            Ok(Server::new(network, address, handler))
        }
        ListenerSource::Inherited(fd) => {
            let server = Server::from_inherited(fd, handler)?;
            let local = server.local_addr();
            info!(fd, address = ?local, "Starting inherited generation");
            if local.map(|a| a.to_string()).as_deref() != Some(address) {
                warn!(
                    configured = address,
                    inherited = ?local,
                    "Configured address ignored, serving the inherited listener"
                );
            }
            Ok(server)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, HandlerError};
    use crate::handler::handler_fn;
    use std::net::SocketAddr;
    use std::os::unix::io::AsRawFd;
    use tokio::net::TcpStream;

    async fn noop(_stream: TcpStream, _peer: SocketAddr) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn test_marker_values() {
        assert_eq!(ListenerSource::from_marker(None), ListenerSource::Fresh);
        assert_eq!(ListenerSource::from_marker(Some("")), ListenerSource::Fresh);
        assert_eq!(ListenerSource::from_marker(Some("false")), ListenerSource::Fresh);
        assert_eq!(ListenerSource::from_marker(Some("0")), ListenerSource::Fresh);

        for value in ["true", "TRUE", "1", "yes", " true "] {
            assert_eq!(
                ListenerSource::from_marker(Some(value)),
                ListenerSource::Inherited(3),
                "marker {value:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_fresh_bootstrap_defers_bind() {
        let server = bootstrap(
            ListenerSource::Fresh,
            Network::Tcp,
            "127.0.0.1:0",
            handler_fn(noop),
        )
        .unwrap();
        assert!(server.listener().is_none());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_inherited_bootstrap_adopts_listener() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let fd = unsafe { libc::dup(std_listener.as_raw_fd()) };
        assert!(fd >= 0);

        let server = bootstrap(
            ListenerSource::Inherited(fd),
            Network::Tcp,
            "127.0.0.1:1",
            handler_fn(noop),
        )
        .unwrap();
        assert_eq!(server.local_addr(), Some(addr));
    }

    #[tokio::test]
    async fn test_inherited_bootstrap_rejects_bad_fd() {
        let result = bootstrap(
            ListenerSource::Inherited(9999),
            Network::Tcp,
            "127.0.0.1:0",
            handler_fn(noop),
        );
        assert!(matches!(result, Err(Error::Inheritance { fd: 9999, .. })));
    }
}
