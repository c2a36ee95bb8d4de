//! Process signals as restart and shutdown triggers.
//!
//! | Signal  | Trigger                 |
//! |---------|-------------------------|
//! | SIGHUP  | [`Trigger::Restart`]    |
//! | SIGTERM | [`Trigger::Terminate`]  |
//! | SIGINT  | [`Trigger::Interrupt`]  |
//!
//! What `Terminate` means is up to the orchestrator's policy.

use std::fmt;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};

const TRIGGER_CHANNEL_CAPACITY: usize = 16;

/// An external request delivered to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Hand the listener to a successor, then drain and exit.
    Restart,
    /// SIGTERM: handled per the configured terminate policy.
    Terminate,
    /// Drain and exit without a successor.
    Interrupt,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Restart => write!(f, "restart"),
            Trigger::Terminate => write!(f, "terminate"),
            Trigger::Interrupt => write!(f, "interrupt"),
        }
    }
}

fn register(kind: SignalKind, name: &'static str) -> Result<Signal> {
    signal(kind).map_err(|source| Error::Signal {
        signal: name,
        source,
    })
}

/// Install the signal handlers and forward deliveries as triggers.
///
/// Handlers are registered before this returns, so a signal sent after the
/// call is never lost to the default disposition. Must be called within a
/// Tokio runtime. The forwarding task ends when the receiver is dropped.
pub fn listen() -> Result<mpsc::Receiver<Trigger>> {
    let mut hangup = register(SignalKind::hangup(), "SIGHUP")?;
    let mut terminate = register(SignalKind::terminate(), "SIGTERM")?;
    let mut interrupt = register(SignalKind::interrupt(), "SIGINT")?;

    let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        loop {
            let trigger = tokio::select! {
                _ = hangup.recv() => {
                    info!(signal = "SIGHUP", "Received restart signal");
                    Trigger::Restart
                }
                _ = terminate.recv() => {
                    info!(signal = "SIGTERM", "Received terminate signal");
                    Trigger::Terminate
                }
                _ = interrupt.recv() => {
                    info!(signal = "SIGINT", "Received interrupt signal");
                    Trigger::Interrupt
                }
            };

            if tx.send(trigger).await.is_err() {
                debug!("Trigger receiver dropped, signal forwarding stopped");
                return;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::Restart.to_string(), "restart");
        assert_eq!(Trigger::Terminate.to_string(), "terminate");
        assert_eq!(Trigger::Interrupt.to_string(), "interrupt");
    }

    #[tokio::test]
    async fn test_sighup_becomes_restart() {
        let mut triggers = listen().unwrap();

        let ret = unsafe { libc::kill(libc::getpid(), libc::SIGHUP) };
        assert_eq!(ret, 0);

        let trigger = tokio::time::timeout(Duration::from_secs(5), triggers.recv())
            .await
            .unwrap();
        assert_eq!(trigger, Some(Trigger::Restart));
    }
}
