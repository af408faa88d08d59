//! On-disk VM store: one directory per VM under `$HOME/.vm/`.
//!
//! ```text
//! ~/.vm/<name>/
//!   config.json        persistent configuration (sorted keys)
//!   disk.img           raw block image, or a symlink when imported in place
//!   nvram.bin          firmware variable store, created on first boot
//!   vm.pid             owning PID + start timestamp, pruned when stale
//!   console.sock       console multiplexer endpoint
//!   network-info.json  last known guest network state
//!   cloud-init.iso     provisioning ISO
//!   vm.log             daemon log
//!   ssh_config         generated ssh client config
//! ```
//!
//! The store is pure path arithmetic plus JSON I/O; the daemon owns the
//! runtime files (`vm.pid`, `console.sock`, `network-info.json`) and every
//! other process treats them as advisory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::agent::NetworkInfo;
use crate::config::VmConfig;
use crate::error::ManagerError;

/// Reserved name of the auxiliary rescue VM; hidden from listings.
pub const RESCUE_VM_NAME: &str = "rescue";

/// Returns `true` iff `name` matches `^[A-Za-z0-9][A-Za-z0-9_-]*$`.
pub fn validate_vm_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Runtime rendezvous info written to `vm.pid` by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RuntimeInfo {
    /// PID of the owning daemon process.
    pub pid: i32,
    /// When the daemon started.
    pub started_at: DateTime<Utc>,
}

/// Handle to the on-disk VM store.
#[derive(Debug, Clone)]
pub struct VmStore {
    /// Store root, normally `$HOME/.vm`.
    root: PathBuf,
}

impl VmStore {
    /// Opens the default store at `$HOME/.vm`, creating the root if needed.
    pub fn open() -> Result<Self, ManagerError> {
        let home = dirs::home_dir().ok_or_else(|| {
            ManagerError::ConfigurationError("cannot determine home directory".into())
        })?;
        Self::at(home.join(".vm"))
    }

    /// Opens a store rooted at an explicit path.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self, ManagerError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a single VM.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Path of `config.json`.
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("config.json")
    }

    /// Resolves the main disk image path for a configuration.
    pub fn disk_path(&self, config: &VmConfig) -> PathBuf {
        if config.disk_image_path.is_absolute() {
            config.disk_image_path.clone()
        } else {
            self.vm_dir(&config.name).join(&config.disk_image_path)
        }
    }

    /// Path of the firmware variable store.
    pub fn nvram_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("nvram.bin")
    }

    /// Path of the runtime PID file.
    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.pid")
    }

    /// Path of the console multiplexer socket.
    pub fn console_socket_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("console.sock")
    }

    /// Path of the persisted guest network state.
    pub fn network_info_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("network-info.json")
    }

    /// Path of the cloud-init provisioning ISO.
    pub fn cloud_init_iso_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("cloud-init.iso")
    }

    /// Path of the daemon log file.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.log")
    }

    /// Path of the generated ssh client configuration.
    pub fn ssh_config_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("ssh_config")
    }

    /// Creates a new VM directory and writes its configuration.
    ///
    /// Fails with [`ManagerError::VmAlreadyExists`] when the directory is
    /// already present.
    pub fn create_vm(&self, config: &VmConfig) -> Result<(), ManagerError> {
        ensure_valid_name(&config.name)?;
        let dir = self.vm_dir(&config.name);
        if dir.exists() {
            return Err(ManagerError::VmAlreadyExists(config.name.clone()));
        }
        std::fs::create_dir_all(&dir)?;
        self.save_config(config)
    }

    /// Loads a VM's configuration.
    pub fn load_config(&self, name: &str) -> Result<VmConfig, ManagerError> {
        ensure_valid_name(name)?;
        let path = self.config_path(name);
        if !path.exists() {
            return Err(ManagerError::VmNotFound(name.to_owned()));
        }
        read_json(&path)
    }

    /// Persists a configuration, bumping `modified_at` first.
    ///
    /// Output is byte-stable: keys are sorted, timestamps are ISO-8601.
    pub fn save_config(&self, config: &VmConfig) -> Result<(), ManagerError> {
        ensure_valid_name(&config.name)?;
        let mut config = config.clone();
        config.modified_at = Utc::now();
        write_json(&self.config_path(&config.name), &config)
    }

    /// Removes a VM and everything under its directory.
    ///
    /// Refuses while the VM's daemon is alive.
    pub fn delete_vm(&self, name: &str) -> Result<(), ManagerError> {
        ensure_valid_name(name)?;
        let dir = self.vm_dir(name);
        if !self.config_path(name).exists() {
            return Err(ManagerError::VmNotFound(name.to_owned()));
        }
        if self.running_pid(name).is_some() {
            return Err(ManagerError::ConfigurationError(format!(
                "VM '{name}' is currently running; stop it first"
            )));
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Names of all user VMs (subdirectories holding a `config.json`),
    /// sorted lexicographically. The rescue VM is excluded.
    pub fn list_vms(&self) -> Result<Vec<String>, ManagerError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name == RESCUE_VM_NAME {
                continue;
            }
            if self.config_path(&name).exists() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Writes `vm.pid` for the current daemon.
    pub fn save_runtime_info(&self, name: &str, info: &RuntimeInfo) -> Result<(), ManagerError> {
        write_json(&self.pid_path(name), info)
    }

    /// Loads raw runtime info without a liveness check.
    pub fn load_runtime_info(&self, name: &str) -> Option<RuntimeInfo> {
        read_json(&self.pid_path(name)).ok()
    }

    /// Returns the owning daemon PID when it is alive.
    ///
    /// A `vm.pid` pointing at a dead process is deleted and `None` is
    /// returned, so callers can treat presence as truth.
    pub fn running_pid(&self, name: &str) -> Option<i32> {
        let info = self.load_runtime_info(name)?;
        if is_pid_alive(info.pid) {
            Some(info.pid)
        } else {
            let _ = std::fs::remove_file(self.pid_path(name));
            None
        }
    }

    /// Removes `vm.pid`.
    pub fn remove_runtime_info(&self, name: &str) {
        let _ = std::fs::remove_file(self.pid_path(name));
    }

    /// Persists the last known guest network state.
    pub fn save_network_info(&self, name: &str, info: &NetworkInfo) -> Result<(), ManagerError> {
        write_json(&self.network_info_path(name), info)
    }

    /// Loads the last known guest network state, if any.
    pub fn load_network_info(&self, name: &str) -> Option<NetworkInfo> {
        read_json(&self.network_info_path(name)).ok()
    }

    /// Removes `network-info.json`.
    pub fn remove_network_info(&self, name: &str) {
        let _ = std::fs::remove_file(self.network_info_path(name));
    }
}

/// Validates a name or fails with [`ManagerError::InvalidVmName`].
pub fn ensure_valid_name(name: &str) -> Result<(), ManagerError> {
    if validate_vm_name(name) {
        Ok(())
    } else {
        Err(ManagerError::InvalidVmName(name.to_owned()))
    }
}

/// Checks process liveness via `kill(pid, 0)`.
pub fn is_pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Serializes through `serde_json::Value` so map keys come out sorted.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ManagerError> {
    let v = serde_json::to_value(value)
        .map_err(|e| ManagerError::ConfigurationError(e.to_string()))?;
    let mut out = serde_json::to_string_pretty(&v)
        .map_err(|e| ManagerError::ConfigurationError(e.to_string()))?;
    out.push('\n');
    std::fs::write(path, out)?;
    Ok(())
}

/// Reads and decodes a JSON file.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ManagerError> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| {
        ManagerError::ConfigurationError(format!("{}: {e}", path.display()))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{MIN_DISK_SIZE, MIN_MEMORY_SIZE};

    fn test_store() -> (tempfile::TempDir, VmStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path().join("vms")).unwrap();
        (dir, store)
    }

    fn test_config(name: &str) -> VmConfig {
        VmConfig::new(name, 1, MIN_MEMORY_SIZE, MIN_DISK_SIZE)
    }

    #[test]
    fn name_validation() {
        for ok in ["a", "ubuntu", "Ubuntu-22_04", "9lives", "x-y-z"] {
            assert!(validate_vm_name(ok), "{ok} should be valid");
        }
        for bad in ["", "-dash", "_under", "has space", "dot.name", "ü"] {
            assert!(!validate_vm_name(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn create_load_round_trip() {
        let (_tmp, store) = test_store();
        let config = test_config("ubuntu");
        store.create_vm(&config).unwrap();

        let loaded = store.load_config("ubuntu").unwrap();
        assert_eq!(loaded.name, "ubuntu");
        assert_eq!(loaded.cpu_count, config.cpu_count);
        assert_eq!(loaded.mac_address, config.mac_address);
    }

    #[test]
    fn create_refuses_existing_dir() {
        let (_tmp, store) = test_store();
        let config = test_config("dup");
        store.create_vm(&config).unwrap();
        match store.create_vm(&config) {
            Err(ManagerError::VmAlreadyExists(n)) => assert_eq!(n, "dup"),
            other => panic!("expected VmAlreadyExists, got {other:?}"),
        }
    }

    #[test]
    fn load_missing_is_not_found() {
        let (_tmp, store) = test_store();
        assert!(matches!(
            store.load_config("ghost"),
            Err(ManagerError::VmNotFound(_))
        ));
    }

    #[test]
    fn config_encoding_is_byte_stable() {
        let (_tmp, store) = test_store();
        let config = test_config("stable");
        store.create_vm(&config).unwrap();

        let first = std::fs::read(store.config_path("stable")).unwrap();
        let loaded = store.load_config("stable").unwrap();

        // Re-encode without the modified_at bump: identical bytes.
        let v = serde_json::to_value(&loaded).unwrap();
        let mut again = serde_json::to_string_pretty(&v).unwrap();
        again.push('\n');
        assert_eq!(first, again.into_bytes());

        // Keys in the file are sorted.
        let text = String::from_utf8(first).unwrap();
        let keys: Vec<_> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"')?.split('"').next())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn stale_pid_file_is_pruned() {
        let (_tmp, store) = test_store();
        store.create_vm(&test_config("stale")).unwrap();

        // A PID from the ephemeral range that cannot be alive for long;
        // spawn-and-reap guarantees it is dead.
        let child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as i32;
        let mut child = child;
        child.wait().unwrap();

        store
            .save_runtime_info(
                "stale",
                &RuntimeInfo {
                    pid: dead_pid,
                    started_at: Utc::now(),
                },
            )
            .unwrap();

        assert_eq!(store.running_pid("stale"), None);
        assert!(!store.pid_path("stale").exists(), "stale vm.pid must be deleted");
    }

    #[test]
    fn live_pid_is_reported() {
        let (_tmp, store) = test_store();
        store.create_vm(&test_config("live")).unwrap();
        let me = std::process::id() as i32;
        store
            .save_runtime_info(
                "live",
                &RuntimeInfo {
                    pid: me,
                    started_at: Utc::now(),
                },
            )
            .unwrap();
        assert_eq!(store.running_pid("live"), Some(me));
    }

    #[test]
    fn delete_refuses_running_vm() {
        let (_tmp, store) = test_store();
        store.create_vm(&test_config("busy")).unwrap();
        store
            .save_runtime_info(
                "busy",
                &RuntimeInfo {
                    pid: std::process::id() as i32,
                    started_at: Utc::now(),
                },
            )
            .unwrap();
        match store.delete_vm("busy") {
            Err(ManagerError::ConfigurationError(msg)) => {
                assert!(msg.contains("currently running"), "{msg}");
            }
            other => panic!("expected ConfigurationError, got {other:?}"),
        }

        store.remove_runtime_info("busy");
        store.delete_vm("busy").unwrap();
        assert!(!store.vm_dir("busy").exists());
    }

    #[test]
    fn listing_is_sorted_and_hides_rescue() {
        let (_tmp, store) = test_store();
        for name in ["zeta", "alpha", RESCUE_VM_NAME] {
            store.create_vm(&test_config(name)).unwrap();
        }
        // A stray directory without config.json is ignored.
        std::fs::create_dir(store.root().join("not-a-vm")).unwrap();

        assert_eq!(store.list_vms().unwrap(), vec!["alpha", "zeta"]);
    }
}
