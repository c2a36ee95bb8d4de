//! One generation's server state.

use std::net::SocketAddr;
use std::os::unix::io::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatcher::accept_loop;
use crate::error::{Error, Result};
use crate::handler::ConnectionHandler;
use crate::listener::{ListenerHandle, Network, DEFAULT_BACKLOG};
use crate::shutdown::{DrainGroup, DrainOutcome};

/// The server state of one process generation.
///
/// Owns the generation's listener handle (set once: eagerly when inherited,
/// lazily on the first [`serve`](Self::serve) otherwise) and the drain group
/// of its connection tasks. Shared by reference between the accept loop and
/// the restart orchestrator.
pub struct Server<H> {
    network: Network,
    address: String,
    backlog: u32,
    handler: Arc<H>,
    listener: OnceCell<Arc<ListenerHandle>>,
    listening: Notify,
    drain: DrainGroup,
    drain_timeout: Option<Duration>,
    stopped: AtomicBool,
}

impl<H: ConnectionHandler> Server<H> {
    /// A server that binds `address` when it starts serving.
    pub fn new(network: Network, address: impl Into<String>, handler: H) -> Self {
        Self {
            network,
            address: address.into(),
            backlog: DEFAULT_BACKLOG,
            handler: Arc::new(handler),
            listener: OnceCell::new(),
            listening: Notify::new(),
            drain: DrainGroup::new(),
            drain_timeout: None,
            stopped: AtomicBool::new(false),
        }
    }

    /// A server around a listener inherited from a predecessor at `fd`.
    pub fn from_inherited(fd: RawFd, handler: H) -> Result<Self> {
        let listener = ListenerHandle::from_inherited(fd)?;
        let server = Self::new(Network::Tcp, listener.local_addr().to_string(), handler);
        server
            .listener
            .set(Arc::new(listener))
            .map_err(|_| Error::inheritance(fd, "listener already initialized"))?;
        Ok(server)
    }

    /// Accept backlog used when binding fresh.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Bound the drain on [`stop`](Self::stop). `None` (the default) waits
    /// for every connection to finish.
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Run the accept loop.
    ///
    /// Binds the listener first if this generation has none yet. Runs until
    /// the loop stops and always returns the reason: [`Error::Cancelled`]
    /// when `cancel` was observed, [`Error::ListenerClosed`] after
    /// [`stop`](Self::stop), [`Error::Accept`] on a permanent accept failure,
    /// or [`Error::Bind`] if the listener could not be created.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let _serving = self.drain.serve_guard();
        if self.is_stopped() {
            return Err(Error::ListenerClosed);
        }

        let listener = self
            .listener
            .get_or_try_init(|| async {
                ListenerHandle::bind(self.network, &self.address, self.backlog)
                    .await
                    .map(Arc::new)
            })
            .await?;
        self.listening.notify_waiters();

        if self.stopped.load(Ordering::SeqCst) {
            listener.close();
            return Err(Error::ListenerClosed);
        }

        accept_loop(listener, &self.handler, &self.drain, &cancel).await
    }

    /// Close the listener and wait for every outstanding connection task.
    ///
    /// Repeated calls are no-ops that return as soon as the (already empty)
    /// drain group confirms it.
    pub async fn stop(&self) -> DrainOutcome {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            info!(
                outstanding = self.outstanding(),
                "Stopping server, closing listener"
            );
        }
        if let Some(listener) = self.listener.get() {
            listener.close();
        }
        self.drain.drain(self.drain_timeout).await
    }

    /// Duplicate the listening descriptor for a successor.
    pub fn export_descriptor(&self) -> Result<OwnedFd> {
        match self.listener.get() {
            Some(listener) => listener.export_descriptor(),
            None => Err(Error::Export(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "server is not listening yet",
            ))),
        }
    }

    /// Connection tasks not yet completed.
    pub fn outstanding(&self) -> usize {
        self.drain.outstanding()
    }

    /// The listener, once one exists.
    pub fn listener(&self) -> Option<&Arc<ListenerHandle>> {
        self.listener.get()
    }

    /// Bound address, once a listener exists.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.get().map(|l| l.local_addr())
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the listener exists (after the first `serve` binds it).
    pub async fn wait_listening(&self) -> Arc<ListenerHandle> {
        loop {
            let notified = self.listening.notified();
            tokio::pin!(notified);
            // Registered before the check so a bind in between is not missed.
            notified.as_mut().enable();

            if let Some(listener) = self.listener.get() {
                return Arc::clone(listener);
            }
            notified.await;
        }
    }
}
