//! Spawning the successor generation with the listener in its fd table.
//!
//! The successor gets stdin, stdout and stderr passed through and the
//! listener installed at [`INHERITED_LISTENER_FD`] (fd 3) without
//! close-on-exec. Everything else the parent holds stays close-on-exec.
//!
//! Spawning is fire-and-continue: the parent does not wait for the successor
//! to become ready. Both processes share the socket, so connections queue in
//! the kernel until one of them accepts.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::info;

use crate::error::{Error, Result};

/// Slot of the listener in the successor's fd table, after stdin, stdout
/// and stderr.
pub const INHERITED_LISTENER_FD: RawFd = 3;

/// What to execute as the successor.
#[derive(Debug, Clone)]
pub struct SuccessorCommand {
    program: PathBuf,
    arg0: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl SuccessorCommand {
    /// Run `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            arg0: program.clone().into_os_string(),
            program,
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable with the current arguments.
    pub fn current_process() -> io::Result<Self> {
        let program = std::env::current_exe()?;
        let mut argv = std::env::args_os();
        let arg0 = argv
            .next()
            .unwrap_or_else(|| program.clone().into_os_string());
        Ok(Self {
            program,
            arg0,
            args: argv.collect(),
            envs: Vec::new(),
        })
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Set an environment variable on top of the inherited environment.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments after argv[0].
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Value this command sets for `key`, if any.
    pub fn env_value(&self, key: &str) -> Option<&OsStr> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }
}

/// A successor that was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Successor {
    pub pid: u32,
}

/// Starts a successor process that inherits the listener.
///
/// This is the only platform-specific seam of the handoff.
pub trait SuccessorSpawner: Send + Sync + 'static {
    /// Start `command` with `listener` at [`INHERITED_LISTENER_FD`].
    ///
    /// Takes ownership of the exported descriptor; the parent's copy is
    /// closed once the child has its own.
    fn spawn(&self, command: &SuccessorCommand, listener: OwnedFd) -> Result<Successor>;
}

/// `fork` + `exec` spawner for Unix.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkExecSpawner;

impl SuccessorSpawner for ForkExecSpawner {
    fn spawn(&self, command: &SuccessorCommand, listener: OwnedFd) -> Result<Successor> {
        let source = listener.as_raw_fd();

        let mut cmd = Command::new(&command.program);
        cmd.arg0(&command.arg0)
            .args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the hook runs between fork and exec and only calls
        // dup2/fcntl, which are async-signal-safe.
        unsafe {
            cmd.pre_exec(move || install_listener(source, INHERITED_LISTENER_FD));
        }

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        info!(
            pid,
            program = %command.program.display(),
            source_fd = source,
            target_fd = INHERITED_LISTENER_FD,
            "Spawned successor"
        );

        drop(listener);
        Ok(Successor { pid })
    }
}

/// Place `source` at `target` in the current fd table with close-on-exec
/// cleared. Runs in the forked child.
fn install_listener(source: RawFd, target: RawFd) -> io::Result<()> {
    if source == target {
        // dup2 onto itself is a no-op that keeps FD_CLOEXEC.
        let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    if unsafe { libc::dup2(source, target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
