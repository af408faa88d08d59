//! Launches and stops detached VM daemons.
//!
//! The daemon is this same binary re-entered through the hidden
//! `run-daemon` verb, detached from the terminal. Foreground commands
//! rendezvous on `vm.pid` for plain starts and on `console.sock` when an
//! interactive attach follows.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::RunnerError;
use crate::store::VmStore;

/// How long `spawn_background` waits for a valid PID file.
pub const PID_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Console socket wait for a normal interactive start.
pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Console socket wait for a rescue boot (image conversion makes the
/// first boot slower).
pub const RESCUE_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default SIGTERM grace before SIGKILL in [`stop_daemon`].
pub const STOP_GRACE_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll tick for PID-file and socket waits.
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll tick while waiting for a signalled daemon to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A spawned daemon plus the console socket it serves.
#[derive(Debug)]
#[non_exhaustive]
pub struct SpawnedDaemon {
    /// Detached daemon process.
    pub process: Child,
    /// Console socket path, present once the VM is up.
    pub socket_path: PathBuf,
}

/// Builds the detached `run-daemon` child command for a VM.
pub fn daemon_command(
    name: &str,
    attach_iso: bool,
    rescue_target: Option<&std::path::Path>,
) -> std::io::Result<Command> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command.arg("run-daemon").arg(name);
    if attach_iso {
        command.arg("--iso");
    }
    if let Some(target) = rescue_target {
        command.arg("--rescue").arg("--target-disk").arg(target);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    Ok(command)
}

/// Spawns the daemon and waits for a valid PID file.
///
/// Returns the daemon PID recorded in the store (the direct child may
/// differ if the daemon ever re-execs).
pub async fn spawn_background(
    store: &VmStore,
    name: &str,
    mut command: Command,
) -> Result<i32, RunnerError> {
    let mut child = command
        .spawn()
        .map_err(|e| RunnerError::BootError(format!("failed to spawn daemon: {e}")))?;
    debug!(vm = name, child = child.id(), "daemon spawned");

    let deadline = tokio::time::Instant::now() + PID_WAIT_TIMEOUT;
    loop {
        if let Some(pid) = store.running_pid(name) {
            return Ok(pid);
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(boot_failure(store, name, status));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RunnerError::BootError("VM failed to start".into()));
        }
        tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
    }
}

/// Spawns the daemon and waits for the console socket to appear.
///
/// With `check_crash`, a child that exits before the socket shows up is
/// reported as a boot failure pointing at the log.
pub async fn spawn_and_wait_for_socket(
    store: &VmStore,
    name: &str,
    mut command: Command,
    timeout: Duration,
    check_crash: bool,
) -> Result<SpawnedDaemon, RunnerError> {
    let socket_path = store.console_socket_path(name);
    let mut child = command
        .spawn()
        .map_err(|e| RunnerError::BootError(format!("failed to spawn daemon: {e}")))?;
    debug!(vm = name, child = child.id(), "daemon spawned, waiting for console");

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if socket_path.exists() {
            return Ok(SpawnedDaemon {
                process: child,
                socket_path,
            });
        }
        if check_crash
            && let Ok(Some(status)) = child.try_wait()
        {
            return Err(boot_failure(store, name, status));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RunnerError::BootError(format!(
                "timed out waiting for VM console; check {}",
                store.log_path(name).display()
            )));
        }
        tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
    }
}

/// Sends SIGTERM to a daemon. A PID that is already gone is fine.
pub fn terminate_daemon(pid: i32) -> Result<(), RunnerError> {
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(RunnerError::RuntimeError(format!(
            "failed to signal daemon {pid}: {e}"
        ))),
    }
}

/// Sends SIGKILL to a daemon, best effort.
pub fn kill_daemon(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

/// Polls until the process is gone. Returns `false` on timeout.
pub async fn wait_for_death(pid: i32, timeout: Duration) -> bool {
    let target = Pid::from_raw(pid);
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if kill(target, None).is_err() {
            return true;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    kill(target, None).is_err()
}

/// Stops a daemon: SIGTERM, poll for exit, SIGKILL after `grace`.
pub async fn stop_daemon(pid: i32, grace: Duration) -> Result<(), RunnerError> {
    terminate_daemon(pid)?;
    if wait_for_death(pid, grace).await {
        return Ok(());
    }
    warn!(pid, "daemon ignored SIGTERM; killing");
    kill_daemon(pid);
    tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
    Ok(())
}

/// Builds the boot-failure error for an early daemon exit.
fn boot_failure(store: &VmStore, name: &str, status: std::process::ExitStatus) -> RunnerError {
    RunnerError::BootError(format!(
        "daemon exited during startup ({status}); check {}",
        store.log_path(name).display()
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::config::{MIN_DISK_SIZE, MIN_MEMORY_SIZE};

    fn test_store() -> (tempfile::TempDir, VmStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn spawn_background_times_out_without_pid_file() {
        let (_tmp, store) = test_store();
        store
            .create_vm(&VmConfig::new("slow", 1, MIN_MEMORY_SIZE, MIN_DISK_SIZE))
            .unwrap();

        // A child that sleeps past the timeout but never writes vm.pid.
        let mut command = Command::new("sleep");
        command.arg("30").stdin(Stdio::null()).stdout(Stdio::null());

        let started = std::time::Instant::now();
        let result = spawn_background(&store, "slow", command).await;
        match result {
            Err(RunnerError::BootError(msg)) => assert!(msg.contains("failed to start"), "{msg}"),
            other => panic!("expected BootError, got {other:?}"),
        }
        assert!(started.elapsed() >= PID_WAIT_TIMEOUT);
    }

    #[tokio::test]
    async fn socket_wait_reports_early_crash() {
        let (_tmp, store) = test_store();
        store
            .create_vm(&VmConfig::new("crash", 1, MIN_MEMORY_SIZE, MIN_DISK_SIZE))
            .unwrap();

        let mut command = Command::new("false");
        command.stdin(Stdio::null()).stdout(Stdio::null());

        let result =
            spawn_and_wait_for_socket(&store, "crash", command, Duration::from_secs(5), true)
                .await;
        match result {
            Err(RunnerError::BootError(msg)) => {
                assert!(msg.contains("exited during startup"), "{msg}");
                assert!(msg.contains("vm.log"), "{msg}");
            }
            other => panic!("expected BootError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn socket_wait_returns_once_socket_exists() {
        let (_tmp, store) = test_store();
        store
            .create_vm(&VmConfig::new("up", 1, MIN_MEMORY_SIZE, MIN_DISK_SIZE))
            .unwrap();
        // Socket already present: the wait returns immediately.
        std::fs::write(store.console_socket_path("up"), b"").unwrap();

        let mut command = Command::new("sleep");
        command.arg("5").stdin(Stdio::null()).stdout(Stdio::null());

        let mut spawned =
            spawn_and_wait_for_socket(&store, "up", command, Duration::from_secs(2), true)
                .await
                .unwrap();
        assert_eq!(spawned.socket_path, store.console_socket_path("up"));
        let _ = spawned.process.kill();
        let _ = spawned.process.wait();
    }

    #[tokio::test]
    async fn stop_daemon_terminates_a_live_process() {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let pid = child.id() as i32;

        stop_daemon(pid, Duration::from_secs(5)).await.unwrap();
        // Reap and confirm it is gone.
        let mut child = child;
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(kill(Pid::from_raw(pid), None).is_err());
    }

    #[tokio::test]
    async fn stop_daemon_is_fine_with_a_dead_pid() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        stop_daemon(pid, Duration::from_secs(1)).await.unwrap();
    }
}
