//! Persistent VM configuration and ephemeral start options.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;

/// Minimum guest memory (512 MiB).
pub const MIN_MEMORY_SIZE: u64 = 512 << 20;

/// Minimum disk size (1 GiB).
pub const MIN_DISK_SIZE: u64 = 1 << 30;

/// Persistent per-VM configuration, stored as `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmConfig {
    /// VM name; also the store directory name.
    pub name: String,
    /// Number of virtual CPUs.
    pub cpu_count: u32,
    /// Guest memory in bytes.
    pub memory_size: u64,
    /// Main disk image, relative to the VM directory or absolute.
    pub disk_image_path: PathBuf,
    /// Main disk size in bytes.
    pub disk_size: u64,
    /// Optional install ISO, absolute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso_path: Option<PathBuf>,
    /// Locally administered unicast MAC, `xx:xx:xx:xx:xx:xx`.
    pub mac_address: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp; bumped on every save.
    pub modified_at: DateTime<Utc>,
}

impl VmConfig {
    /// Builds a configuration with freshly stamped timestamps and a
    /// generated MAC address.
    pub fn new(name: impl Into<String>, cpu_count: u32, memory_size: u64, disk_size: u64) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            cpu_count,
            memory_size,
            disk_image_path: PathBuf::from("disk.img"),
            disk_size,
            iso_path: None,
            mac_address: generate_mac(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Checks the configuration against host resources and size floors.
    pub fn validate(&self) -> Result<(), ManagerError> {
        let host_cpus = host_cpu_count();
        if self.cpu_count == 0 || self.cpu_count > host_cpus {
            return Err(ManagerError::ConfigurationError(format!(
                "cpu_count must be between 1 and {host_cpus}, got {}",
                self.cpu_count
            )));
        }
        let host_mem = host_memory_size();
        if self.memory_size < MIN_MEMORY_SIZE || self.memory_size > host_mem {
            return Err(ManagerError::ConfigurationError(format!(
                "memory_size must be between {MIN_MEMORY_SIZE} and {host_mem} bytes, got {}",
                self.memory_size
            )));
        }
        if self.disk_size < MIN_DISK_SIZE {
            return Err(ManagerError::ConfigurationError(format!(
                "disk_size must be at least {MIN_DISK_SIZE} bytes, got {}",
                self.disk_size
            )));
        }
        if !is_valid_mac(&self.mac_address) {
            return Err(ManagerError::ConfigurationError(format!(
                "mac_address '{}' is not a locally administered unicast address",
                self.mac_address
            )));
        }
        Ok(())
    }
}

/// Ephemeral options for one daemon run; never persisted.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StartOptions {
    /// Attach the configured install ISO.
    pub attach_iso: bool,
    /// Attach an extra raw disk (rescue target).
    pub secondary_disk: Option<PathBuf>,
    /// Expose the vsock device for the guest agent.
    pub enable_guest_agent: bool,
    /// Share the host home directory with the guest.
    pub enable_directory_sharing: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            attach_iso: false,
            secondary_disk: None,
            enable_guest_agent: true,
            enable_directory_sharing: true,
        }
    }
}

impl StartOptions {
    /// Preset for rescue boots: no ISO, no agent, no sharing, the target
    /// VM's disk attached as a secondary device.
    pub fn rescue(target_disk: PathBuf) -> Self {
        Self {
            attach_iso: false,
            secondary_disk: Some(target_disk),
            enable_guest_agent: false,
            enable_directory_sharing: false,
        }
    }
}

/// Number of logical CPUs on the host.
pub fn host_cpu_count() -> u32 {
    std::thread::available_parallelism().map_or(1, |n| n.get() as u32)
}

/// Total physical memory on the host in bytes, from `/proc/meminfo`.
pub fn host_memory_size() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return u64::MAX;
    };
    meminfo
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            Some(kib * 1024)
        })
        .unwrap_or(u64::MAX)
}

/// Generates a random locally administered unicast MAC address.
pub fn generate_mac() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    let bytes = h.finish().to_be_bytes();

    let mut mac = [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]];
    // Clear multicast, set locally-administered.
    mac[0] = (mac[0] & !0x03) | 0x02;
    mac.map(|b| format!("{b:02x}")).join(":")
}

/// Returns `true` for a well-formed locally administered unicast MAC.
pub fn is_valid_mac(s: &str) -> bool {
    let octets: Vec<_> = s.split(':').collect();
    if octets.len() != 6 {
        return false;
    }
    let mut parsed = [0u8; 6];
    for (i, o) in octets.iter().enumerate() {
        if o.len() != 2 {
            return false;
        }
        match u8::from_str_radix(o, 16) {
            Ok(b) => parsed[i] = b,
            Err(_) => return false,
        }
    }
    parsed[0] & 0x03 == 0x02
}
