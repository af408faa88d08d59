//! QEMU/KVM engine: argv composition, child lifecycle, QMP control.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::qmp::QmpClient;
use super::{EngineState, VmEngine};
use crate::agent::VsockEndpoint;
use crate::config::{StartOptions, VmConfig, is_valid_mac};
use crate::error::RunnerError;
use crate::store::VmStore;

/// Graceful stop budget before the engine forces termination.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll tick while waiting for a graceful stop.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long `start` waits for the QMP socket to appear.
const QMP_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Candidate EFI firmware code images, per architecture.
#[cfg(target_arch = "x86_64")]
const FIRMWARE_CODE_PATHS: &[&str] = &[
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/OVMF/OVMF_CODE_4M.fd",
    "/usr/share/edk2/x64/OVMF_CODE.4m.fd",
    "/usr/share/qemu/edk2-x86_64-code.fd",
];

/// Candidate EFI variable templates, per architecture.
#[cfg(target_arch = "x86_64")]
const FIRMWARE_VARS_PATHS: &[&str] = &[
    "/usr/share/OVMF/OVMF_VARS.fd",
    "/usr/share/OVMF/OVMF_VARS_4M.fd",
    "/usr/share/edk2/x64/OVMF_VARS.4m.fd",
    "/usr/share/qemu/edk2-i386-vars.fd",
];

#[cfg(target_arch = "aarch64")]
const FIRMWARE_CODE_PATHS: &[&str] = &[
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    "/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw",
    "/usr/share/qemu/edk2-aarch64-code.fd",
];

#[cfg(target_arch = "aarch64")]
const FIRMWARE_VARS_PATHS: &[&str] = &[
    "/usr/share/AAVMF/AAVMF_VARS.fd",
    "/usr/share/edk2/aarch64/vars-template-pflash.raw",
    "/usr/share/qemu/edk2-arm-vars.fd",
];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const FIRMWARE_CODE_PATHS: &[&str] = &[];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const FIRMWARE_VARS_PATHS: &[&str] = &[];

/// Hypervisor binary for this architecture.
fn qemu_binary() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "qemu-system-aarch64",
        _ => "qemu-system-x86_64",
    }
}

/// Machine type for this architecture.
fn machine_type() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "virt,accel=kvm:tcg"
    } else {
        "q35,accel=kvm:tcg"
    }
}

/// Resolved inputs for one engine run.
#[derive(Debug)]
struct Layout {
    /// VM name, used for `-name`.
    name: String,
    /// Virtual CPU count.
    cpu_count: u32,
    /// Guest memory in MiB.
    memory_mib: u64,
    /// MAC for the NAT device.
    mac_address: String,
    /// EFI code image.
    firmware_code: PathBuf,
    /// Per-VM EFI variable store.
    nvram: PathBuf,
    /// Main disk image.
    main_disk: PathBuf,
    /// Optional secondary disk (rescue target).
    secondary_disk: Option<PathBuf>,
    /// Optional install ISO.
    iso: Option<PathBuf>,
    /// Optional cloud-init ISO.
    cloud_init_iso: Option<PathBuf>,
    /// QMP control socket path.
    qmp_socket: PathBuf,
    /// Directory shared as `hostHome`, when sharing is enabled.
    share_dir: Option<PathBuf>,
    /// Whether the vsock device is attached.
    vsock: bool,
}

/// Validated engine configuration, ready to spawn.
#[derive(Debug)]
pub struct QemuConfig {
    /// Hypervisor binary.
    program: String,
    /// Composed argument vector.
    args: Vec<String>,
    /// Read end of the serial input pipe (child stdin).
    serial_in: OwnedFd,
    /// Write end of the serial output pipe (child stdout).
    serial_out: OwnedFd,
    /// QMP control socket path.
    qmp_socket: PathBuf,
    /// Log file receiving the hypervisor's stderr.
    log_path: PathBuf,
    /// Guest-agent endpoint, when the vsock device is attached.
    vsock: Option<VsockEndpoint>,
}

impl QemuConfig {
    /// Composes the engine configuration for one run.
    ///
    /// `serial_in` becomes the guest's serial input, `serial_out` its serial
    /// output. The NVRAM store is created from the firmware template on
    /// first boot. `validate` runs before returning.
    pub fn build(
        store: &VmStore,
        config: &VmConfig,
        options: &StartOptions,
        serial_in: OwnedFd,
        serial_out: OwnedFd,
    ) -> Result<Self, RunnerError> {
        config
            .validate()
            .map_err(|e| RunnerError::ConfigurationError(e.to_string()))?;

        let firmware_code = find_existing(FIRMWARE_CODE_PATHS).ok_or_else(|| {
            RunnerError::ConfigurationError("EFI firmware code image not found".into())
        })?;

        let nvram = store.nvram_path(&config.name);
        if !nvram.exists() {
            let vars = find_existing(FIRMWARE_VARS_PATHS).ok_or_else(|| {
                RunnerError::ConfigurationError("EFI variable template not found".into())
            })?;
            std::fs::copy(&vars, &nvram).map_err(|e| {
                RunnerError::ConfigurationError(format!("cannot create NVRAM store: {e}"))
            })?;
            debug!(nvram = %nvram.display(), "created NVRAM store from template");
        }

        let mac_address = if is_valid_mac(&config.mac_address) {
            config.mac_address.clone()
        } else {
            let mac = crate::config::generate_mac();
            warn!(bad = %config.mac_address, new = %mac, "replacing invalid MAC address");
            mac
        };

        let cloud_init_iso = store.cloud_init_iso_path(&config.name);
        let layout = Layout {
            name: config.name.clone(),
            cpu_count: config.cpu_count,
            memory_mib: config.memory_size >> 20,
            mac_address,
            firmware_code,
            nvram,
            main_disk: store.disk_path(config),
            secondary_disk: options.secondary_disk.clone(),
            iso: options.attach_iso.then(|| config.iso_path.clone()).flatten(),
            cloud_init_iso: cloud_init_iso.exists().then_some(cloud_init_iso),
            qmp_socket: store.vm_dir(&config.name).join("qmp.sock"),
            share_dir: options
                .enable_directory_sharing
                .then(dirs::home_dir)
                .flatten(),
            vsock: options.enable_guest_agent,
        };

        let built = Self {
            program: qemu_binary().to_owned(),
            args: compose_args(&layout),
            serial_in,
            serial_out,
            qmp_socket: layout.qmp_socket.clone(),
            log_path: store.log_path(&config.name),
            vsock: layout.vsock.then(VsockEndpoint::guest_agent),
        };
        built.validate(&layout)?;
        Ok(built)
    }

    /// Checks that everything the argv references actually exists.
    fn validate(&self, layout: &Layout) -> Result<(), RunnerError> {
        if find_in_path(&self.program).is_none() {
            return Err(RunnerError::ConfigurationError(format!(
                "hypervisor binary '{}' not found in PATH",
                self.program
            )));
        }
        if !layout.main_disk.exists() {
            return Err(RunnerError::ConfigurationError(format!(
                "disk image '{}' does not exist",
                layout.main_disk.display()
            )));
        }
        for disk in [&layout.secondary_disk, &layout.iso] {
            if let Some(path) = disk
                && !path.exists()
            {
                return Err(RunnerError::ConfigurationError(format!(
                    "'{}' does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Builds the QEMU argument vector from a resolved layout.
///
/// Block devices keep the fixed order: main disk, secondary disk, install
/// ISO, cloud-init ISO.
fn compose_args(layout: &Layout) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |parts: &[&str]| args.extend(parts.iter().map(|s| (*s).to_owned()));

    push(&["-name", &format!("{},process=vm-{}", layout.name, layout.name)]);
    push(&["-machine", machine_type()]);
    push(&["-cpu", "host"]);
    push(&["-smp", &layout.cpu_count.to_string()]);
    push(&["-m", &format!("{}M", layout.memory_mib)]);

    // EFI firmware pair: read-only code, writable per-VM variables.
    push(&[
        "-drive",
        &format!(
            "if=pflash,format=raw,readonly=on,file={}",
            layout.firmware_code.display()
        ),
    ]);
    push(&[
        "-drive",
        &format!("if=pflash,format=raw,file={}", layout.nvram.display()),
    ]);

    push(&[
        "-drive",
        &format!(
            "file={},format=raw,if=virtio,cache=writeback",
            layout.main_disk.display()
        ),
    ]);
    if let Some(secondary) = &layout.secondary_disk {
        push(&[
            "-drive",
            &format!("file={},format=raw,if=virtio", secondary.display()),
        ]);
    }
    if let Some(iso) = &layout.iso {
        push(&[
            "-drive",
            &format!("file={},media=cdrom,readonly=on", iso.display()),
        ]);
    }
    if let Some(ci) = &layout.cloud_init_iso {
        push(&[
            "-drive",
            &format!("file={},media=cdrom,readonly=on", ci.display()),
        ]);
    }

    push(&["-netdev", "user,id=net0"]);
    push(&[
        "-device",
        &format!("virtio-net-pci,netdev=net0,mac={}", layout.mac_address),
    ]);

    push(&["-object", "rng-random,id=rng0,filename=/dev/urandom"]);
    push(&["-device", "virtio-rng-pci,rng=rng0"]);
    push(&["-device", "virtio-balloon-pci"]);
    push(&["-device", "virtio-keyboard-pci"]);
    push(&["-device", "virtio-tablet-pci"]);

    if layout.vsock {
        push(&[
            "-device",
            &format!("vhost-vsock-pci,guest-cid={}", crate::agent::GUEST_CID),
        ]);
    }
    if let Some(share) = &layout.share_dir {
        push(&[
            "-virtfs",
            &format!(
                "local,path={},mount_tag=hostHome,security_model=mapped-xattr",
                share.display()
            ),
        ]);
    }

    push(&["-serial", "stdio"]);
    push(&["-display", "none"]);
    push(&["-monitor", "none"]);
    push(&[
        "-qmp",
        &format!("unix:{},server=on,wait=off", layout.qmp_socket.display()),
    ]);

    args
}

/// First existing path from a candidate list.
fn find_existing(candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Locates a binary on `PATH`.
fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Where the child process is in its lifecycle.
#[derive(Debug)]
enum Phase {
    /// Built but not started.
    Created,
    /// Child is (or was recently) alive.
    Spawned(Child),
    /// Child has exited.
    Exited(ExitStatus),
}

/// QEMU-backed [`VmEngine`].
#[derive(Debug)]
pub struct QemuEngine {
    /// Validated configuration; consumed by `start`.
    config: Option<QemuConfig>,
    /// QMP control channel.
    qmp: QmpClient,
    /// Guest-agent endpoint, when configured.
    vsock: Option<VsockEndpoint>,
    /// Child lifecycle phase.
    phase: Phase,
    /// Log path, used in boot error messages.
    log_path: PathBuf,
}

impl QemuEngine {
    /// Wraps a validated configuration.
    pub fn new(config: QemuConfig) -> Self {
        let qmp = QmpClient::new(&config.qmp_socket);
        let vsock = config.vsock;
        let log_path = config.log_path.clone();
        Self {
            config: Some(config),
            qmp,
            vsock,
            phase: Phase::Created,
            log_path,
        }
    }

    /// Records a finished child.
    fn mark_exited(&mut self, status: ExitStatus) {
        self.phase = Phase::Exited(status);
    }

    /// Reaps the child if it has exited since the last check.
    fn reap(&mut self) {
        if let Phase::Spawned(child) = &mut self.phase
            && let Ok(Some(status)) = child.try_wait()
        {
            info!(status = %status, "hypervisor exited");
            self.mark_exited(status);
        }
    }
}

impl VmEngine for QemuEngine {
    async fn start(&mut self) -> Result<(), RunnerError> {
        let Some(config) = self.config.take() else {
            return Err(RunnerError::RuntimeError("engine already started".into()));
        };

        // Stale control socket from a crashed run would break the handshake.
        if config.qmp_socket.exists() {
            let _ = std::fs::remove_file(&config.qmp_socket);
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
            .map_err(|e| RunnerError::BootError(format!("cannot open log file: {e}")))?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::from(config.serial_in))
            .stdout(Stdio::from(config.serial_out))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);

        debug!(program = %config.program, args = ?config.args, "spawning hypervisor");
        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::BootError(format!("failed to spawn hypervisor: {e}")))?;

        // Wait for the QMP socket; a child that dies first is a boot failure.
        let deadline = tokio::time::Instant::now() + QMP_WAIT_TIMEOUT;
        while !config.qmp_socket.exists() {
            if let Ok(Some(status)) = child.try_wait() {
                self.mark_exited(status);
                return Err(RunnerError::BootError(format!(
                    "hypervisor exited during startup ({status}); check {}",
                    self.log_path.display()
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(RunnerError::BootError(
                    "timed out waiting for hypervisor control socket".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.qmp
            .query_status()
            .await
            .map_err(|e| RunnerError::BootError(format!("QMP handshake failed: {e}")))?;

        info!(pid = ?child.id(), "hypervisor started");
        self.phase = Phase::Spawned(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RunnerError> {
        self.reap();
        if !matches!(self.phase, Phase::Spawned(_)) {
            return Ok(());
        }

        if let Err(e) = self.qmp.system_powerdown().await {
            warn!(error = %e, "graceful powerdown request failed");
        }

        let deadline = tokio::time::Instant::now() + GRACEFUL_STOP_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            self.reap();
            if matches!(self.phase, Phase::Exited(_)) {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        warn!("graceful stop timed out; forcing");
        self.force_stop().await
    }

    async fn force_stop(&mut self) -> Result<(), RunnerError> {
        if let Phase::Spawned(child) = &mut self.phase {
            let _ = child.start_kill();
            let status = child
                .wait()
                .await
                .map_err(|e| RunnerError::RuntimeError(e.to_string()))?;
            self.mark_exited(status);
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), RunnerError> {
        self.qmp
            .pause()
            .await
            .map_err(|e| RunnerError::RuntimeError(e.to_string()))
    }

    async fn resume(&mut self) -> Result<(), RunnerError> {
        self.qmp
            .resume()
            .await
            .map_err(|e| RunnerError::RuntimeError(e.to_string()))
    }

    async fn wait_until_stopped(&mut self) {
        if let Phase::Spawned(child) = &mut self.phase
            && let Ok(status) = child.wait().await
        {
            self.mark_exited(status);
        }
    }

    async fn state(&mut self) -> EngineState {
        self.reap();
        match &self.phase {
            Phase::Created => EngineState::Starting,
            Phase::Exited(status) => {
                if status.success() {
                    EngineState::Stopped
                } else {
                    EngineState::Error
                }
            }
            Phase::Spawned(_) => match self.qmp.query_status().await {
                Ok(status) => match status.as_str() {
                    "paused" | "suspended" | "prelaunch" => EngineState::Paused,
                    "shutdown" | "postmigrate" => EngineState::Stopped,
                    _ => EngineState::Running,
                },
                // The child is alive but QMP is momentarily unavailable.
                Err(_) => EngineState::Running,
            },
        }
    }

    fn guest_agent_endpoint(&self) -> Option<VsockEndpoint> {
        self.vsock
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_layout() -> Layout {
        Layout {
            name: "ubuntu".into(),
            cpu_count: 2,
            memory_mib: 4096,
            mac_address: "02:11:22:33:44:55".into(),
            firmware_code: PathBuf::from("/fw/CODE.fd"),
            nvram: PathBuf::from("/vmdir/nvram.bin"),
            main_disk: PathBuf::from("/vmdir/disk.img"),
            secondary_disk: None,
            iso: None,
            cloud_init_iso: Some(PathBuf::from("/vmdir/cloud-init.iso")),
            qmp_socket: PathBuf::from("/vmdir/qmp.sock"),
            share_dir: Some(PathBuf::from("/home/user")),
            vsock: true,
        }
    }

    fn arg_value<'a>(args: &'a [String], flag: &str, nth: usize) -> Option<&'a str> {
        args.iter()
            .enumerate()
            .filter(|(_, a)| *a == flag)
            .nth(nth)
            .map(|(i, _)| args[i + 1].as_str())
    }

    #[test]
    fn block_devices_keep_fixed_order() {
        let mut layout = test_layout();
        layout.secondary_disk = Some(PathBuf::from("/target/disk.img"));
        layout.iso = Some(PathBuf::from("/isos/install.iso"));
        let args = compose_args(&layout);

        // pflash pair first, then main, secondary, iso, cloud-init.
        let drives: Vec<_> = (0..)
            .map_while(|i| arg_value(&args, "-drive", i))
            .collect();
        assert_eq!(drives.len(), 6);
        assert!(drives[0].contains("readonly=on"), "{}", drives[0]);
        assert!(drives[1].contains("nvram.bin"));
        assert!(drives[2].starts_with("file=/vmdir/disk.img"));
        assert!(drives[3].starts_with("file=/target/disk.img"));
        assert!(drives[4].starts_with("file=/isos/install.iso"));
        assert!(drives[5].starts_with("file=/vmdir/cloud-init.iso"));
    }

    #[test]
    fn serial_goes_to_stdio_with_no_display() {
        let args = compose_args(&test_layout());
        assert_eq!(arg_value(&args, "-serial", 0), Some("stdio"));
        assert_eq!(arg_value(&args, "-display", 0), Some("none"));
        assert_eq!(arg_value(&args, "-monitor", 0), Some("none"));
    }

    #[test]
    fn nat_device_carries_configured_mac() {
        let args = compose_args(&test_layout());
        assert_eq!(arg_value(&args, "-netdev", 0), Some("user,id=net0"));
        let device = arg_value(&args, "-device", 0).unwrap();
        assert!(device.contains("mac=02:11:22:33:44:55"), "{device}");
    }

    #[test]
    fn vsock_and_share_are_optional() {
        let mut layout = test_layout();
        layout.vsock = false;
        layout.share_dir = None;
        let args = compose_args(&layout);
        assert!(!args.iter().any(|a| a.contains("vhost-vsock")));
        assert!(!args.contains(&"-virtfs".to_owned()));

        let with = compose_args(&test_layout());
        assert!(
            with.iter()
                .any(|a| a.contains(&format!("guest-cid={}", crate::agent::GUEST_CID)))
        );
        assert!(with.iter().any(|a| a.contains("mount_tag=hostHome")));
    }

    #[test]
    fn qmp_socket_is_a_server_that_does_not_wait() {
        let args = compose_args(&test_layout());
        assert_eq!(
            arg_value(&args, "-qmp", 0),
            Some("unix:/vmdir/qmp.sock,server=on,wait=off")
        );
    }
}
