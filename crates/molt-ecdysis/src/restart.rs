//! The restart orchestrator.
//!
//! Drives one generation through
//! `Running -> RestartRequested -> SuccessorSpawning -> Draining -> Terminated`.
//!
//! The successor is spawned before this generation closes its listener, so
//! the accept queue is serviced by at least one process at every instant.
//! Anything that fails before the successor exists (export, spawn) is logged
//! and the generation goes back to `Running` untouched.
//!
//! Triggers are handled one at a time. Once a handoff or shutdown is under
//! way further triggers are logged and ignored, and triggers that queued up
//! while a failed attempt was running are discarded rather than replayed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootstrap::RESTART_ENV;
use crate::error::Result;
use crate::handler::ConnectionHandler;
use crate::server::Server;
use crate::shutdown::DrainOutcome;
use crate::signals::Trigger;
use crate::spawn::{ForkExecSpawner, Successor, SuccessorCommand, SuccessorSpawner};

/// Lifecycle of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Running,
    RestartRequested,
    SuccessorSpawning,
    Draining,
    Terminated,
}

impl fmt::Display for RestartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartState::Running => write!(f, "running"),
            RestartState::RestartRequested => write!(f, "restart-requested"),
            RestartState::SuccessorSpawning => write!(f, "successor-spawning"),
            RestartState::Draining => write!(f, "draining"),
            RestartState::Terminated => write!(f, "terminated"),
        }
    }
}

/// What [`Trigger::Terminate`] does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminatePolicy {
    /// Drain and exit without a successor.
    #[default]
    Shutdown,
    /// Treat it like a restart trigger.
    Restart,
}

impl fmt::Display for TerminatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminatePolicy::Shutdown => write!(f, "shutdown"),
            TerminatePolicy::Restart => write!(f, "restart"),
        }
    }
}

/// Unknown terminate policy name.
#[derive(Debug, thiserror::Error)]
#[error("unknown terminate policy {0:?} (expected \"shutdown\" or \"restart\")")]
pub struct ParsePolicyError(String);

impl FromStr for TerminatePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shutdown" => Ok(TerminatePolicy::Shutdown),
            "restart" => Ok(TerminatePolicy::Restart),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A successor took over the listener.
    Handoff {
        successor: Successor,
        drain: DrainOutcome,
    },
    /// Stopped without a successor.
    Shutdown { drain: DrainOutcome },
}

impl Termination {
    /// Result of the final drain.
    pub fn drain(&self) -> DrainOutcome {
        match self {
            Termination::Handoff { drain, .. } | Termination::Shutdown { drain } => *drain,
        }
    }
}

enum Action {
    Restart,
    Shutdown,
}

/// Reacts to triggers for one generation's [`Server`].
pub struct Orchestrator<H, S = ForkExecSpawner> {
    server: Arc<Server<H>>,
    spawner: S,
    command: SuccessorCommand,
    policy: TerminatePolicy,
    cancel: CancellationToken,
    state: watch::Sender<RestartState>,
}

impl<H: ConnectionHandler> Orchestrator<H> {
    /// Orchestrate `server`, re-running `command` as the successor.
    ///
    /// `cancel` is the token the server's accept loop was started with; it
    /// is cancelled once the generation has terminated.
    pub fn new(server: Arc<Server<H>>, command: SuccessorCommand, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(RestartState::Running);
        Self {
            server,
            spawner: ForkExecSpawner,
            command,
            policy: TerminatePolicy::default(),
            cancel,
            state,
        }
    }
}

impl<H: ConnectionHandler, S: SuccessorSpawner> Orchestrator<H, S> {
    /// Use a different successor spawner.
    pub fn with_spawner<T: SuccessorSpawner>(self, spawner: T) -> Orchestrator<H, T> {
        Orchestrator {
            server: self.server,
            spawner,
            command: self.command,
            policy: self.policy,
            cancel: self.cancel,
            state: self.state,
        }
    }

    /// Set what SIGTERM does.
    pub fn with_terminate_policy(mut self, policy: TerminatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RestartState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> RestartState {
        *self.state.borrow()
    }

    /// Handle triggers until the generation terminates.
    ///
    /// A closed trigger channel is treated as a shutdown request.
    pub async fn run(self, mut triggers: mpsc::Receiver<Trigger>) -> Termination {
        info!(policy = %self.policy, "Restart orchestrator running");

        loop {
            let Some(trigger) = triggers.recv().await else {
                info!("Trigger channel closed, shutting down");
                return self.shut_down(&mut triggers).await;
            };

            match self.action_for(trigger) {
                Action::Shutdown => {
                    info!(%trigger, "Shutdown requested");
                    return self.shut_down(&mut triggers).await;
                }
                Action::Restart => {
                    info!(%trigger, "Restart requested");
                    match self.hand_off() {
                        Ok(successor) => return self.finish_handoff(successor, &mut triggers).await,
                        Err(e) => {
                            error!(error = %e, "Restart failed, continuing to serve");
                            self.transition(RestartState::Running);
                            while let Ok(queued) = triggers.try_recv() {
                                warn!(trigger = %queued, "Discarding trigger queued during failed restart");
                            }
                        }
                    }
                }
            }
        }
    }

    fn action_for(&self, trigger: Trigger) -> Action {
        match trigger {
            Trigger::Restart => Action::Restart,
            Trigger::Interrupt => Action::Shutdown,
            Trigger::Terminate => match self.policy {
                TerminatePolicy::Shutdown => Action::Shutdown,
                TerminatePolicy::Restart => Action::Restart,
            },
        }
    }

    fn hand_off(&self) -> Result<Successor> {
        self.transition(RestartState::RestartRequested);
        let listener = self.server.export_descriptor()?;

        self.transition(RestartState::SuccessorSpawning);
        let command = self.command.clone().env(RESTART_ENV, "true");
        self.spawner.spawn(&command, listener)
    }

    async fn finish_handoff(
        &self,
        successor: Successor,
        triggers: &mut mpsc::Receiver<Trigger>,
    ) -> Termination {
        info!(successor_pid = successor.pid, "Successor spawned, draining");
        let drain = self.drain(triggers).await;
        self.terminate();
        Termination::Handoff { successor, drain }
    }

    async fn shut_down(&self, triggers: &mut mpsc::Receiver<Trigger>) -> Termination {
        let drain = self.drain(triggers).await;
        self.terminate();
        Termination::Shutdown { drain }
    }

    async fn drain(&self, triggers: &mut mpsc::Receiver<Trigger>) -> DrainOutcome {
        self.transition(RestartState::Draining);

        let stop = self.server.stop();
        tokio::pin!(stop);
        loop {
            tokio::select! {
                outcome = &mut stop => return outcome,
                Some(trigger) = triggers.recv() => {
                    warn!(%trigger, "Ignoring trigger, generation is already draining");
                }
            }
        }
    }

    fn terminate(&self) {
        self.cancel.cancel();
        self.transition(RestartState::Terminated);
    }

    fn transition(&self, next: RestartState) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "Restart state changed");
    }
}
