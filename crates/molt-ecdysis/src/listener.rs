//! The listener handle: the one bound, listening TCP socket a generation owns.
//!
//! A handle is either *fresh* (bound by this process) or *inherited* (adopted
//! from a descriptor the predecessor placed in our fd table). Either way the
//! socket is exported to a successor by descriptor duplication, never by
//! sharing the handle itself.
//!
//! # Closing
//!
//! `accept` on a Tokio listener is a suspension point that a caller's
//! cancellation token cannot reach. The only thing that unblocks a pending
//! accept is [`ListenerHandle::close`]: it wakes every pending accept with
//! [`Error::ListenerClosed`] and releases this process' reference to the
//! socket once the last in-flight accept has returned.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default accept backlog for fresh listeners.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Network family of a fresh listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// IPv4 or IPv6, whichever the address resolves to first.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
        }
    }
}

/// Returned when a network family string is not one of `tcp`, `tcp4`, `tcp6`.
#[derive(Debug, thiserror::Error)]
#[error("unsupported network family '{0}' (expected tcp, tcp4 or tcp6)")]
pub struct ParseNetworkError(String);

impl FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            _ => Err(ParseNetworkError(s.to_string())),
        }
    }
}

/// Where a listener handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOrigin {
    /// Bound by this process.
    Fresh,
    /// Adopted from a predecessor's descriptor.
    Inherited,
}

/// Owns one bound, listening TCP socket.
pub struct ListenerHandle {
    inner: Mutex<Option<Arc<TcpListener>>>,
    closed: CancellationToken,
    origin: ListenerOrigin,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Bind and listen on `address`, restricted to the given network family.
    ///
    /// The address may be a literal socket address or a `host:port` pair; the
    /// first resolved address of the right family that binds wins.
    pub async fn bind(network: Network, address: &str, backlog: u32) -> Result<Self> {
        let bind_err = |source: io::Error| Error::Bind {
            network: network.to_string(),
            address: address.to_string(),
            source,
        };

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address)
            .await
            .map_err(bind_err)?
            .filter(|addr| network.accepts(addr))
            .collect();

        if candidates.is_empty() {
            return Err(bind_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network} address found"),
            )));
        }

        let mut last_err = None;
        for addr in candidates {
            match listen_on(addr, backlog) {
                Ok(listener) => {
                    let local_addr = listener.local_addr().map_err(bind_err)?;
                    info!(%network, address = %local_addr, backlog, "Bound fresh listener");
                    return Ok(Self::new(listener, ListenerOrigin::Fresh, local_addr));
                }
                Err(e) => {
                    debug!(address = %addr, error = %e, "Bind attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(bind_err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address could be bound")
        })))
    }

    /// Adopt a listening socket passed down by a predecessor.
    ///
    /// The descriptor is validated before ownership is taken: it must be an
    /// open socket of type `SOCK_STREAM`, in the listening state, with an
    /// IPv4 or IPv6 address. On failure the descriptor is left open.
    ///
    /// The adopted descriptor is marked close-on-exec, so it only reaches a
    /// successor through an explicit export.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn from_inherited(fd: RawFd) -> Result<Self> {
        validate_listening_socket(fd)?;
        set_cloexec(fd)
            .map_err(|e| Error::inheritance(fd, format!("setting close-on-exec failed: {e}")))?;

        // SAFETY: the fd was validated as an open listening TCP socket above,
        // and the predecessor handed it to us for exclusive adoption.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener
            .set_nonblocking(true)
            .map_err(|e| Error::inheritance(fd, format!("set_nonblocking failed: {e}")))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|e| Error::inheritance(fd, format!("getsockname failed: {e}")))?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| Error::inheritance(fd, format!("reactor registration failed: {e}")))?;

        info!(fd, address = %local_addr, "Inherited listener from predecessor");
        Ok(Self::new(listener, ListenerOrigin::Inherited, local_addr))
    }

    fn new(listener: TcpListener, origin: ListenerOrigin, local_addr: SocketAddr) -> Self {
        Self {
            inner: Mutex::new(Some(Arc::new(listener))),
            closed: CancellationToken::new(),
            origin,
            local_addr,
        }
    }

    /// Accept one connection.
    ///
    /// Returns [`Error::ListenerClosed`] if the handle is closed before or
    /// while waiting, and [`Error::Accept`] for any OS-level accept failure.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let Some(listener) = self.current() else {
            return Err(Error::ListenerClosed);
        };

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(Error::ListenerClosed),
            accepted = listener.accept() => accepted.map_err(Error::Accept),
        }
    }

    /// Duplicate the listening descriptor for handing to a successor.
    ///
    /// The duplicate is close-on-exec in this process; the spawner installs
    /// it in the successor's fd table without that flag.
    pub fn export_descriptor(&self) -> Result<OwnedFd> {
        let listener = self.current().ok_or_else(|| {
            Error::Export(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener already closed",
            ))
        })?;
        let fd = listener.as_fd().try_clone_to_owned().map_err(Error::Export)?;
        debug!(source_fd = listener.as_raw_fd(), exported_fd = fd.as_raw_fd(), "Exported listener descriptor");
        Ok(fd)
    }

    /// Close the listener. Pending accepts fail with [`Error::ListenerClosed`].
    ///
    /// Returns `true` if this call closed the handle, `false` if it was
    /// already closed.
    pub fn close(&self) -> bool {
        let taken = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();

        match taken {
            Some(_) => {
                info!(address = %self.local_addr, origin = ?self.origin, "Listener closed");
                true
            }
            None => false,
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the handle was bound fresh or inherited.
    pub fn origin(&self) -> ListenerOrigin {
        self.origin
    }

    fn current(&self) -> Option<Arc<TcpListener>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_addr", &self.local_addr)
            .field("origin", &self.origin)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn listen_on(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Check that `fd` is an open, listening, IP stream socket.
fn validate_listening_socket(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::inheritance(fd, "negative descriptor"));
    }

    // SAFETY: fstat only writes into the zeroed stat buffer we own.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(Error::inheritance(
            fd,
            format!("fstat failed: {}", io::Error::last_os_error()),
        ));
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err(Error::inheritance(fd, "not a socket"));
    }

    let sock_type = getsockopt_int(fd, libc::SO_TYPE)
        .map_err(|e| Error::inheritance(fd, format!("SO_TYPE query failed: {e}")))?;
    if sock_type != libc::SOCK_STREAM {
        return Err(Error::inheritance(fd, "not a stream socket"));
    }

    let accepting = getsockopt_int(fd, libc::SO_ACCEPTCONN)
        .map_err(|e| Error::inheritance(fd, format!("SO_ACCEPTCONN query failed: {e}")))?;
    if accepting == 0 {
        return Err(Error::inheritance(fd, "socket is not listening"));
    }

    // SAFETY: getsockname writes at most `len` bytes into the zeroed storage.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr>(),
            &mut len,
        )
    };
    if ret != 0 {
        return Err(Error::inheritance(
            fd,
            format!("getsockname failed: {}", io::Error::last_os_error()),
        ));
    }
    match i32::from(storage.ss_family) {
        libc::AF_INET | libc::AF_INET6 => Ok(()),
        family => Err(Error::inheritance(
            fd,
            format!("address family {family} is not IPv4 or IPv6"),
        )),
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::FD_CLOEXEC != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn getsockopt_int(fd: RawFd, option: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len are valid for writes of the sizes passed.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            std::ptr::addr_of_mut!(value).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if ret == 0 {
        Ok(value)
    } else {
        Err(io::Error::last_os_error())
    }
}
