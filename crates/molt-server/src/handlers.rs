//! Connection handlers served by the binary.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use molt_ecdysis::{ConnectionHandler, HandlerError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

use crate::config::{HandlerKind, ServerConfig};

/// Writes a fixed payload, then closes the connection.
#[derive(Debug, Clone)]
pub struct StaticReply {
    payload: Arc<[u8]>,
    delay: Duration,
}

impl StaticReply {
    pub fn new(payload: impl Into<Arc<[u8]>>, delay: Duration) -> Self {
        Self {
            payload: payload.into(),
            delay,
        }
    }

    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), HandlerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        stream.write_all(&self.payload).await?;
        stream.shutdown().await?;
        trace!(%peer, bytes = self.payload.len(), "Static reply sent");
        Ok(())
    }
}

/// Echoes everything back until the client closes its side.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Echo {
    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), HandlerError> {
        let (mut reader, mut writer) = stream.split();
        let copied = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;
        trace!(%peer, bytes = copied, "Echo finished");
        Ok(())
    }
}

/// The configured handler.
#[derive(Debug, Clone)]
pub enum Handler {
    Static(StaticReply),
    Echo(Echo),
}

impl Handler {
    pub fn from_config(config: &ServerConfig) -> Self {
        match config.handler.kind {
            HandlerKind::Static => Handler::Static(StaticReply::new(
                config.handler.payload.as_bytes(),
                config.handler_delay(),
            )),
            HandlerKind::Echo => Handler::Echo(Echo),
        }
    }
}

impl ConnectionHandler for Handler {
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async move {
            match self {
                Handler::Static(reply) => reply.serve(stream, peer).await,
                Handler::Echo(echo) => echo.serve(stream, peer).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Run `handler` against one client connection and return what the
    /// client read after sending `input`.
    async fn exchange(handler: Handler, input: &[u8]) -> Vec<u8> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handler.handle(stream, peer).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        server.await.unwrap();
        received
    }

    #[tokio::test]
    async fn test_static_reply() {
        let handler = Handler::Static(StaticReply::new(&b"server-data"[..], Duration::ZERO));
        assert_eq!(exchange(handler, b"").await, b"server-data");
    }

    #[tokio::test]
    async fn test_static_reply_delay() {
        let handler = Handler::Static(StaticReply::new(
            &b"late"[..],
            Duration::from_millis(100),
        ));
        let started = Instant::now();
        assert_eq!(exchange(handler, b"").await, b"late");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_echo() {
        let input = b"hello molt\nsecond line\n";
        assert_eq!(exchange(Handler::Echo(Echo), input).await, input);
    }
}
