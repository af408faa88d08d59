//! The VM daemon: owns the engine, the console multiplexer, and the
//! guest-agent query loop for one running VM.
//!
//! Rendezvous contract: `vm.pid` is written before the engine starts and
//! the console socket appears only after it, so spawners waiting for an
//! interactive attach synchronize on the socket, not the PID file.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use signal_hook::consts::{SIGINT, SIGTERM};
use tokio::net::unix::pipe;
use tracing::{error, info, warn};

use crate::config::{StartOptions, VmConfig};
use crate::console::ConsoleListener;
use crate::engine::{EngineState, QemuConfig, QemuEngine, VmEngine};
use crate::error::{ManagerError, RunnerError};
use crate::store::{RESCUE_VM_NAME, RuntimeInfo, VmStore};
use crate::{agent, logging};

/// Monitor loop tick.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Flags of the hidden `run-daemon` verb.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Attach the configured install ISO.
    pub attach_iso: bool,
    /// Boot the reserved rescue VM.
    pub rescue: bool,
    /// Disk of the VM being rescued; required with `rescue`.
    pub target_disk: Option<PathBuf>,
}

/// Errors surfaced by the daemon entry point.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DaemonError {
    /// Store-level failure (missing VM, bad name, I/O).
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// Engine or runtime failure.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Checks the mode flags against the VM name.
///
/// Rescue mode requires the reserved rescue name and a readable target
/// disk; normal mode forbids both.
fn validate_mode(name: &str, options: &DaemonOptions) -> Result<(), RunnerError> {
    if options.rescue {
        if name != RESCUE_VM_NAME {
            return Err(RunnerError::ConfigurationError(format!(
                "rescue mode is reserved for the '{RESCUE_VM_NAME}' VM"
            )));
        }
        let Some(target) = &options.target_disk else {
            return Err(RunnerError::ConfigurationError(
                "rescue mode requires --target-disk".into(),
            ));
        };
        std::fs::File::open(target).map_err(|e| {
            RunnerError::ConfigurationError(format!(
                "target disk '{}' is not readable: {e}",
                target.display()
            ))
        })?;
    } else if options.target_disk.is_some() {
        return Err(RunnerError::ConfigurationError(
            "--target-disk requires --rescue".into(),
        ));
    }
    Ok(())
}

/// Checks that the images the run needs are present.
fn validate_images(
    store: &VmStore,
    config: &VmConfig,
    options: &DaemonOptions,
) -> Result<(), RunnerError> {
    let disk = store.disk_path(config);
    if !disk.exists() {
        return Err(RunnerError::ConfigurationError(format!(
            "disk image '{}' does not exist",
            disk.display()
        )));
    }
    if options.attach_iso {
        match &config.iso_path {
            Some(iso) if iso.exists() => {}
            Some(iso) => {
                return Err(RunnerError::ConfigurationError(format!(
                    "ISO '{}' does not exist",
                    iso.display()
                )));
            }
            None => {
                return Err(RunnerError::ConfigurationError(
                    "--iso requested but no iso_path is configured".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Removes the rendezvous files on every daemon exit path.
struct Cleanup<'a> {
    /// Store owning the files.
    store: &'a VmStore,
    /// VM name.
    name: &'a str,
    /// Rescue runs clear the target marker instead of network info.
    rescue: bool,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        self.store.remove_runtime_info(self.name);
        if self.rescue {
            let _ = std::fs::remove_file(self.store.vm_dir(self.name).join("rescue-target"));
        } else {
            self.store.remove_network_info(self.name);
        }
    }
}

/// Wraps the daemon's pipe ends into async handles and starts the
/// multiplexer on the VM's console socket.
fn start_console(
    store: &VmStore,
    name: &str,
    serial_in_write: std::os::fd::OwnedFd,
    serial_out_read: std::os::fd::OwnedFd,
) -> Result<ConsoleListener<pipe::Sender>, RunnerError> {
    let vm_in = pipe::Sender::from_owned_fd(serial_in_write)
        .map_err(|e| RunnerError::RuntimeError(format!("serial input pipe: {e}")))?;
    let vm_out = pipe::Receiver::from_owned_fd(serial_out_read)
        .map_err(|e| RunnerError::RuntimeError(format!("serial output pipe: {e}")))?;
    let mut console = ConsoleListener::new();
    console
        .start(store.console_socket_path(name), vm_in, vm_out)
        .map_err(|e| RunnerError::RuntimeError(e.to_string()))?;
    Ok(console)
}

/// Polls the engine until it stops, errors, or `exit` is set.
async fn monitor<E: VmEngine>(engine: &mut E, exit: &AtomicBool) -> EngineState {
    loop {
        let state = engine.state().await;
        if matches!(state, EngineState::Stopped | EngineState::Error) {
            return state;
        }
        if exit.load(Ordering::SeqCst) {
            return state;
        }
        tokio::time::sleep(MONITOR_INTERVAL).await;
    }
}

/// Runs one VM end-to-end: engine, console multiplexer, agent loop,
/// signal handling, rendezvous files.
pub async fn run(store: &VmStore, name: &str, options: &DaemonOptions) -> Result<(), DaemonError> {
    // Publish the log file first so every component logs into it. A VM
    // that does not exist yet has no directory to log into; fall back to
    // stderr and let the config load report VmNotFound.
    let log_path = store.log_path(name);
    if store.vm_dir(name).is_dir() {
        logging::init_daemon(&log_path).map_err(ManagerError::FileSystemError)?;
    } else {
        logging::init_cli();
    }

    validate_mode(name, options)?;

    let config = store.load_config(name)?;
    if store.running_pid(name).is_some() {
        return Err(RunnerError::AlreadyRunning(name.to_owned()).into());
    }
    validate_images(store, &config, options)?;

    // Serial plumbing: the engine reads its serial input from one pipe and
    // writes its serial output to the other; the multiplexer owns the
    // opposite ends.
    let (serial_in_read, serial_in_write) =
        nix::unistd::pipe().map_err(|e| RunnerError::ConfigurationError(format!("pipe: {e}")))?;
    let (serial_out_read, serial_out_write) =
        nix::unistd::pipe().map_err(|e| RunnerError::ConfigurationError(format!("pipe: {e}")))?;

    let start_options = if options.rescue {
        // validate_mode guarantees the target disk is present.
        StartOptions::rescue(options.target_disk.clone().unwrap_or_default())
    } else {
        StartOptions {
            attach_iso: options.attach_iso,
            ..StartOptions::default()
        }
    };

    let engine_config = QemuConfig::build(
        store,
        &config,
        &start_options,
        serial_in_read,
        serial_out_write,
    )?;
    let mut engine = QemuEngine::new(engine_config);

    store.save_runtime_info(
        name,
        &RuntimeInfo {
            pid: std::process::id() as i32,
            started_at: Utc::now(),
        },
    )?;
    if options.rescue
        && let Some(target) = &options.target_disk
    {
        let _ = std::fs::write(
            store.vm_dir(name).join("rescue-target"),
            target.display().to_string(),
        );
    }
    let _cleanup = Cleanup {
        store,
        name,
        rescue: options.rescue,
    };

    info!(vm = name, rescue = options.rescue, "starting engine");
    if let Err(e) = engine.start().await {
        error!(vm = name, error = %e, "engine failed to start");
        return Err(e.into());
    }

    // Console socket only exists once the engine is up. A multiplexer
    // that cannot start leaves no way to reach the guest, so take the
    // engine down with it.
    let mut console = match start_console(store, name, serial_in_write, serial_out_read) {
        Ok(console) => console,
        Err(e) => {
            error!(vm = name, error = %e, "console multiplexer failed to start");
            let _ = engine.force_stop().await;
            return Err(e.into());
        }
    };

    let exit = Arc::new(AtomicBool::new(false));
    let mut sig_ids = Vec::new();
    for sig in [SIGINT, SIGTERM] {
        match signal_hook::flag::register(sig, Arc::clone(&exit)) {
            Ok(id) => sig_ids.push(id),
            Err(e) => warn!(signal = sig, error = %e, "failed to install signal handler"),
        }
    }

    let agent_task = if options.rescue {
        None
    } else {
        engine.guest_agent_endpoint().map(|endpoint| {
            tokio::spawn(agent::run_network_query_loop(
                endpoint,
                store.clone(),
                name.to_owned(),
                Arc::clone(&exit),
            ))
        })
    };

    info!(vm = name, "entering monitor loop");
    let last_state = monitor(&mut engine, &exit).await;

    match last_state {
        EngineState::Stopped => info!(vm = name, "guest stopped"),
        EngineState::Error => error!(vm = name, "guest stopped with error"),
        _ => {
            info!(vm = name, "exit requested; stopping engine");
            if let Err(e) = engine.stop().await {
                warn!(vm = name, error = %e, "engine stop failed");
            }
        }
    }

    if let Some(task) = agent_task {
        task.abort();
    }
    console.stop().await;
    for id in sig_ids {
        signal_hook::low_level::unregister(id);
    }
    info!(vm = name, "daemon exiting");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::agent::VsockEndpoint;

    /// Engine whose state transitions are scripted.
    struct FakeEngine {
        states: Vec<EngineState>,
    }

    impl VmEngine for FakeEngine {
        async fn start(&mut self) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn force_stop(&mut self) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn pause(&mut self) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn resume(&mut self) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn wait_until_stopped(&mut self) {}
        async fn state(&mut self) -> EngineState {
            if self.states.len() > 1 {
                self.states.remove(0)
            } else {
                self.states[0]
            }
        }
        fn guest_agent_endpoint(&self) -> Option<VsockEndpoint> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_returns_on_natural_stop() {
        let mut engine = FakeEngine {
            states: vec![
                EngineState::Running,
                EngineState::Running,
                EngineState::Stopped,
            ],
        };
        let exit = AtomicBool::new(false);
        assert_eq!(monitor(&mut engine, &exit).await, EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_returns_on_engine_error() {
        let mut engine = FakeEngine {
            states: vec![EngineState::Running, EngineState::Error],
        };
        let exit = AtomicBool::new(false);
        assert_eq!(monitor(&mut engine, &exit).await, EngineState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_breaks_when_exit_flag_is_set() {
        let mut engine = FakeEngine {
            states: vec![EngineState::Running],
        };
        let exit = AtomicBool::new(true);
        assert_eq!(monitor(&mut engine, &exit).await, EngineState::Running);
    }

    #[test]
    fn rescue_mode_requires_reserved_name_and_target() {
        let ok_target = tempfile::NamedTempFile::new().unwrap();

        let mut options = DaemonOptions {
            rescue: true,
            target_disk: Some(ok_target.path().to_path_buf()),
            ..DaemonOptions::default()
        };
        validate_mode(RESCUE_VM_NAME, &options).unwrap();

        assert!(validate_mode("ubuntu", &options).is_err());

        options.target_disk = None;
        assert!(validate_mode(RESCUE_VM_NAME, &options).is_err());

        options.target_disk = Some(PathBuf::from("/nonexistent/disk.img"));
        assert!(validate_mode(RESCUE_VM_NAME, &options).is_err());
    }

    #[test]
    fn normal_mode_forbids_target_disk() {
        let options = DaemonOptions {
            rescue: false,
            target_disk: Some(PathBuf::from("/tmp/x.img")),
            ..DaemonOptions::default()
        };
        assert!(validate_mode("ubuntu", &options).is_err());
        assert!(validate_mode("ubuntu", &DaemonOptions::default()).is_ok());
    }
}
