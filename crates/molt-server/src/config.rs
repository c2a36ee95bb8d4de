//! Server configuration.
//!
//! Settings are layered, later sources winning:
//! 1. Built-in defaults
//! 2. A TOML file (`molt.toml` in the working directory unless `--config`
//!    names another one; the default file may be absent)
//! 3. Environment variables prefixed with `MOLT_`, using `__` between
//!    section and key
//! 4. Command-line flags
//!
//! # Environment Variables
//!
//! - `MOLT_LISTENER__NETWORK`: `tcp`, `tcp4` or `tcp6`. Default: `tcp`
//! - `MOLT_LISTENER__ADDRESS`: Bind address. Default: `127.0.0.1:8080`
//! - `MOLT_LISTENER__BACKLOG`: Accept backlog. Default: `128`
//! - `MOLT_HANDLER__KIND`: `static` or `echo`. Default: `static`
//! - `MOLT_HANDLER__PAYLOAD`: Bytes the static handler replies with. Default: `server-data`
//! - `MOLT_HANDLER__DELAY_MS`: Delay before the static reply. Default: `0`
//! - `MOLT_SHUTDOWN__DRAIN_TIMEOUT_SECS`: Drain bound in seconds. Default: unbounded
//! - `MOLT_SHUTDOWN__ON_TERMINATE`: What SIGTERM does, `shutdown` or `restart`. Default: `shutdown`
//! - `MOLT_PROCESS__PID_FILE`: Where each generation records its pid. Default: none
//! - `MOLT_LOGGING__FORMAT`: `pretty`, `compact` or `json`. Default: `compact`
//!
//! `MOLT_GRACEFUL_RESTART` is not a setting; it is the handoff marker read
//! by the bootstrap.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use molt_ecdysis::{Network, TerminatePolicy};
use serde::Deserialize;
use tracing::info;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "molt.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "MOLT";

/// Which connection handler to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Write a fixed payload, then close.
    #[default]
    Static,
    /// Echo bytes back until the client closes.
    Echo,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Static => write!(f, "static"),
            HandlerKind::Echo => write!(f, "echo"),
        }
    }
}

/// SIGTERM behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnTerminate {
    #[default]
    Shutdown,
    Restart,
}

impl From<OnTerminate> for TerminatePolicy {
    fn from(value: OnTerminate) -> Self {
        match value {
            OnTerminate::Shutdown => TerminatePolicy::Shutdown,
            OnTerminate::Restart => TerminatePolicy::Restart,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub network: String,
    pub address: String,
    pub backlog: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    pub kind: HandlerKind,
    pub payload: String,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    pub drain_timeout_secs: Option<u64>,
    pub on_terminate: OnTerminate,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessConfig {
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// Complete server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub handler: HandlerConfig,
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    pub logging: LoggingConfig,
}

/// Values given on the command line; `None` leaves lower layers in effect.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub network: Option<String>,
    pub address: Option<String>,
    pub pid_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Load configuration from defaults, file, process environment and
    /// command-line overrides.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        Self::load_with_env(overrides, None)
    }

    /// Like [`load`](Self::load), reading environment variables from `env`
    /// instead of the process environment when given.
    pub fn load_with_env(
        overrides: &Overrides,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let (path, required) = match &overrides.config_file {
            Some(path) => (path.as_path(), true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };

        let settings = config::Config::builder()
            .set_default("listener.network", "tcp")?
            .set_default("listener.address", "127.0.0.1:8080")?
            .set_default("listener.backlog", i64::from(molt_ecdysis::DEFAULT_BACKLOG))?
            .set_default("handler.kind", "static")?
            .set_default("handler.payload", "server-data")?
            .set_default("handler.delay_ms", 0)?
            .set_default("shutdown.on_terminate", "shutdown")?
            .set_default("logging.format", "compact")?
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(env),
            )
            .set_override_option("listener.network", overrides.network.clone())?
            .set_override_option("listener.address", overrides.address.clone())?
            .set_override_option(
                "process.pid_file",
                overrides
                    .pid_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )?
            .build()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;

        let config: ServerConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.network()?;
        anyhow::ensure!(self.listener.backlog > 0, "listener.backlog must be positive");
        Ok(())
    }

    /// Parsed listener network.
    pub fn network(&self) -> Result<Network> {
        self.listener
            .network
            .parse()
            .context("invalid listener.network")
    }

    /// Drain bound, `None` for unbounded.
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.shutdown.drain_timeout_secs.map(Duration::from_secs)
    }

    /// Delay before the static handler replies.
    pub fn handler_delay(&self) -> Duration {
        Duration::from_millis(self.handler.delay_ms)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            network = %self.listener.network,
            address = %self.listener.address,
            backlog = self.listener.backlog,
            "Listener configuration"
        );
        info!(
            kind = %self.handler.kind,
            delay_ms = self.handler.delay_ms,
            "Handler configuration"
        );
        match self.shutdown.drain_timeout_secs {
            Some(secs) => info!(drain_timeout_secs = secs, "Drain timeout: bounded"),
            None => info!("Drain timeout: unbounded"),
        }
        info!(
            on_terminate = %TerminatePolicy::from(self.shutdown.on_terminate),
            "SIGTERM policy"
        );
        if let Some(pid_file) = &self.process.pid_file {
            info!(pid_file = %pid_file.display(), "PID file enabled");
        }
    }
}
