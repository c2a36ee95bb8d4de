//! # molt-ecdysis
//!
//! Zero-downtime restarts for a single TCP listener.
//!
//! ## Overview
//!
//! A running generation hands its listening socket to a successor process
//! instead of closing it:
//! 1. A restart trigger arrives (SIGHUP by default)
//! 2. The listener descriptor is duplicated and the current executable is
//!    spawned again with that descriptor at fd 3
//! 3. The successor validates fd 3 and starts accepting on it
//! 4. The predecessor closes its copy, drains in-flight connections and exits
//!
//! The socket stays open across the whole sequence, so clients never see a
//! refused connection.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP` - Graceful restart (spawn successor, then drain and exit)
//! - `SIGTERM` - Per [`TerminatePolicy`]: drain and exit (default), or restart
//! - `SIGINT` - Graceful shutdown (drain and exit, no successor)
//!
//! ## Environment Variables
//!
//! - `MOLT_GRACEFUL_RESTART` - Set to `true` on a successor; selects the
//!   inherited listener at fd 3 instead of binding
//!
//! ## Shutdown latency
//!
//! The accept loop checks its cancellation token once per iteration. A loop
//! blocked in accept only wakes when a connection arrives or the listener is
//! closed, so [`Server::stop`] closes the listener first.
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other
//! platforms. [`SuccessorSpawner`] is the seam for other process models.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

mod bootstrap;
mod dispatcher;
mod error;
mod handler;
mod listener;
mod restart;
mod server;
mod shutdown;
mod signals;
mod spawn;

pub use bootstrap::{bootstrap, ListenerSource, RESTART_ENV};
pub use error::{is_transient_accept, Error, HandlerError, Result};
pub use handler::{handler_fn, ConnectionHandler, HandlerFn};
pub use listener::{ListenerHandle, ListenerOrigin, Network, ParseNetworkError, DEFAULT_BACKLOG};
pub use restart::{Orchestrator, ParsePolicyError, RestartState, TerminatePolicy, Termination};
pub use server::Server;
pub use shutdown::{DrainGroup, DrainOutcome, ServeGuard};
pub use signals::{listen as listen_for_signals, Trigger};
pub use spawn::{
    ForkExecSpawner, Successor, SuccessorCommand, SuccessorSpawner, INHERITED_LISTENER_FD,
};
