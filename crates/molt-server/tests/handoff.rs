//! End-to-end handoff tests against the real binary.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

const PAYLOAD: &[u8] = b"server-data";
const BIN: &str = env!("CARGO_BIN_EXE_molt-server");

struct Instance {
    child: Child,
    addr: SocketAddr,
    pid_file: PathBuf,
    _dir: tempfile::TempDir,
}

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn start(envs: &[(&str, &str)]) -> Instance {
    start_on(free_addr(), envs)
}

fn start_on(addr: SocketAddr, envs: &[(&str, &str)]) -> Instance {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("molt.toml");
    std::fs::write(&config, "").unwrap();
    let pid_file = dir.path().join("molt.pid");

    let child = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .arg("--address")
        .arg(addr.to_string())
        .arg("--pid-file")
        .arg(&pid_file)
        .env_remove("MOLT_GRACEFUL_RESTART")
        .env("RUST_LOG", "info")
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap();

    Instance {
        child,
        addr,
        pid_file,
        _dir: dir,
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

async fn wait_for_pid(path: &Path, accept: impl Fn(u32) -> bool) -> u32 {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(pid) = read_pid(path).filter(|pid| accept(*pid)) {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pid file never showed the expected pid")
}

async fn wait_for_removal(path: &Path) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pid file was never removed")
}

fn signal(pid: u32, sig: libc::c_int) {
    let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
    assert_eq!(ret, 0, "kill({pid}, {sig}) failed");
}

async fn fetch(addr: SocketAddr) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sighup_hands_off_without_refusals() {
    let mut instance = start(&[("MOLT_HANDLER__DELAY_MS", "300")]);
    let original = instance.child.id().unwrap();
    wait_for_pid(&instance.pid_file, |pid| pid == original).await;
    let addr = instance.addr;

    // In flight across the handoff.
    let first = tokio::spawn(fetch(addr));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stop = Arc::new(AtomicBool::new(false));
    let hammer = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut failures = 0usize;
            let mut reads = Vec::new();
            while !stop.load(Ordering::SeqCst) {
                match TcpStream::connect(addr).await {
                    Ok(mut stream) => reads.push(tokio::spawn(async move {
                        let mut buf = Vec::new();
                        stream.read_to_end(&mut buf).await.map(|_| buf)
                    })),
                    Err(_) => failures += 1,
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            (failures, reads)
        })
    };

    signal(original, libc::SIGHUP);

    let status = tokio::time::timeout(Duration::from_secs(10), instance.child.wait())
        .await
        .expect("original generation did not exit")
        .unwrap();
    assert!(status.success(), "original generation exited with {status}");
    assert_eq!(first.await.unwrap().unwrap(), PAYLOAD);

    let successor = wait_for_pid(&instance.pid_file, |pid| pid != original).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    stop.store(true, Ordering::SeqCst);
    let (failures, reads) = hammer.await.unwrap();
    assert_eq!(failures, 0, "connections were refused during the handoff");
    assert!(!reads.is_empty());
    for read in reads {
        assert_eq!(read.await.unwrap().unwrap(), PAYLOAD);
    }

    assert_eq!(fetch(addr).await.unwrap(), PAYLOAD);

    signal(successor, libc::SIGTERM);
    wait_for_removal(&instance.pid_file).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_sighup_spawns_one_successor() {
    let mut instance = start(&[]);
    let original = instance.child.id().unwrap();
    wait_for_pid(&instance.pid_file, |pid| pid == original).await;

    signal(original, libc::SIGHUP);
    signal(original, libc::SIGHUP);

    let status = tokio::time::timeout(Duration::from_secs(10), instance.child.wait())
        .await
        .expect("original generation did not exit")
        .unwrap();
    assert!(status.success());

    let successor = wait_for_pid(&instance.pid_file, |pid| pid != original).await;
    assert_eq!(fetch(instance.addr).await.unwrap(), PAYLOAD);

    signal(successor, libc::SIGTERM);
    wait_for_removal(&instance.pid_file).await;

    // A second successor would still hold the shared socket.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(instance.addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sigterm_shuts_down_without_successor() {
    let mut instance = start(&[]);
    let original = instance.child.id().unwrap();
    wait_for_pid(&instance.pid_file, |pid| pid == original).await;
    assert_eq!(fetch(instance.addr).await.unwrap(), PAYLOAD);

    signal(original, libc::SIGTERM);

    let status = tokio::time::timeout(Duration::from_secs(10), instance.child.wait())
        .await
        .expect("server did not exit")
        .unwrap();
    assert!(status.success());
    assert!(!instance.pid_file.exists());
    assert!(TcpStream::connect(instance.addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_inherited_listener_is_fatal() {
    let mut instance = start(&[("MOLT_GRACEFUL_RESTART", "true")]);

    let status = tokio::time::timeout(Duration::from_secs(10), instance.child.wait())
        .await
        .expect("server did not exit")
        .unwrap();
    assert!(!status.success());
    assert!(!instance.pid_file.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bind_failure_is_fatal() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut instance = start_on(occupied.local_addr().unwrap(), &[]);

    let status = tokio::time::timeout(Duration::from_secs(10), instance.child.wait())
        .await
        .expect("server did not exit")
        .unwrap();
    assert!(!status.success());
}

/// Whether `pid` has a handler installed for `sig`, per `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
fn catches(pid: u32, sig: libc::c_int) -> bool {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return false;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("SigCgt:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        .is_some_and(|mask| mask & (1 << (sig - 1)) != 0)
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn test_sighup_during_startup_is_not_fatal() {
    let mut instance = start(&[]);
    let original = instance.child.id().unwrap();

    // Sent as soon as the handler exists, before the generation is serving.
    tokio::time::timeout(Duration::from_secs(10), async {
        while !catches(original, libc::SIGHUP) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("SIGHUP handler never installed");
    signal(original, libc::SIGHUP);

    let status = tokio::time::timeout(Duration::from_secs(10), instance.child.wait())
        .await
        .expect("original generation did not exit")
        .unwrap();
    assert!(status.success(), "original generation exited with {status}");

    let successor = wait_for_pid(&instance.pid_file, |pid| pid != original).await;
    assert_eq!(fetch(instance.addr).await.unwrap(), PAYLOAD);

    signal(successor, libc::SIGTERM);
    wait_for_removal(&instance.pid_file).await;
}
