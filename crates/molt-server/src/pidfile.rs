//! PID file for the serving generation.
//!
//! After a handoff the file names the successor, so a supervisor reading it
//! always finds the generation that owns the listener.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// A PID file written by this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Record `pid` at `path`, replacing any previous content atomically.
    pub fn write(path: impl Into<PathBuf>, pid: u32) -> io::Result<Self> {
        let path = path.into();
        let tmp = temp_path(&path, pid);
        std::fs::write(&tmp, format!("{pid}\n"))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        debug!(path = %path.display(), pid, "PID file written");
        Ok(Self { path, pid })
    }

    /// Remove the file if it still names this process.
    ///
    /// Leaves it in place when a successor has already rewritten it.
    pub fn release(self) {
        match read(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
                }
            }
            Ok(_) => debug!(path = %self.path.display(), "PID file owned by another process, left in place"),
            Err(e) => debug!(path = %self.path.display(), error = %e, "PID file unreadable, left in place"),
        }
    }
}

/// Read the pid recorded at `path`. `Ok(None)` if the content is not a pid.
pub fn read(path: &Path) -> io::Result<Option<u32>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.trim().parse().ok())
}

fn temp_path(path: &Path, pid: u32) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{pid}.tmp"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("molt.pid");

        let pid_file = PidFile::write(&path, 1234).unwrap();
        assert_eq!(pid_file.pid, 1234);
        assert_eq!(read(&path).unwrap(), Some(1234));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("molt.pid");

        PidFile::write(&path, 1).unwrap();
        PidFile::write(&path, 2).unwrap();
        assert_eq!(read(&path).unwrap(), Some(2));
    }

    #[test]
    fn test_release_removes_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("molt.pid");

        PidFile::write(&path, 10).unwrap().release();
        assert!(!path.exists());
    }

    #[test]
    fn test_release_keeps_successor_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("molt.pid");

        let ours = PidFile::write(&path, 10).unwrap();
        PidFile::write(&path, 11).unwrap();
        ours.release();
        assert_eq!(read(&path).unwrap(), Some(11));
    }

    #[test]
    fn test_write_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("molt.pid");
        assert!(PidFile::write(&path, 1).is_err());
    }
}
