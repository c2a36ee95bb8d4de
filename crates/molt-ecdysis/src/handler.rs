//! The per-connection handler contract.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::error::HandlerError;

/// Serves one accepted connection.
///
/// The handler takes ownership of the stream; dropping it closes the
/// connection, so every return path (including errors) releases it. Errors
/// are logged by the dispatcher with the connection identity and otherwise
/// ignored.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// Handler backed by a closure.
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`ConnectionHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> ConnectionHandler for HandlerFn<F>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        (self.f)(stream, peer)
    }
}
