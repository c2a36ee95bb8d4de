//! The accept loop.
//!
//! Cancellation is cooperative and checked once per iteration, before each
//! accept. A loop parked in `accept` does not see the token until accept
//! returns, so shutdown latency is bounded by the time until the pending
//! accept unblocks. Closing the listener is what makes that immediate.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{is_transient_accept, Error, Result};
use crate::handler::ConnectionHandler;
use crate::listener::ListenerHandle;
use crate::shutdown::DrainGroup;

/// Accept connections until cancelled, closed, or a permanent accept error.
///
/// Each accepted connection runs in its own task inside `drain`; handler
/// errors are logged there and never end the loop.
pub(crate) async fn accept_loop<H: ConnectionHandler>(
    listener: &ListenerHandle,
    handler: &Arc<H>,
    drain: &DrainGroup,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut next_id: u64 = 0;
    info!(
        address = %listener.local_addr(),
        origin = ?listener.origin(),
        "Accepting connections"
    );

    loop {
        if cancel.is_cancelled() {
            info!("Serve cancelled, accept loop stopping");
            return Err(Error::Cancelled);
        }

        match listener.accept().await {
            Ok((stream, peer)) => {
                next_id += 1;
                let conn_id = next_id;
                debug!(conn_id, %peer, "Connection accepted");

                let handler = Arc::clone(handler);
                drain.spawn(async move {
                    match handler.handle(stream, peer).await {
                        Ok(()) => debug!(conn_id, %peer, "Connection finished"),
                        Err(e) => warn!(conn_id, %peer, error = %e, "Connection handler failed"),
                    }
                });
            }
            Err(Error::Accept(e)) if is_transient_accept(&e) => {
                warn!(error = %e, "Transient accept error, retrying");
            }
            Err(Error::ListenerClosed) => {
                info!("Listener closed, accept loop stopping");
                return Err(Error::ListenerClosed);
            }
            Err(e) => {
                error!(error = %e, "Accept failed, accept loop stopping");
                return Err(e);
            }
        }
    }
}
