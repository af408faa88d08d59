//! Cloud-init seed ISO and ssh_config production.
//!
//! The seed provisions a default user, installs the guest agent, and
//! points it at the vsock port the daemon polls. The ISO is generated
//! with whichever of genisoimage/mkisofs/xorrisofs is installed.

use std::path::PathBuf;

use tracing::debug;

use crate::agent::{AGENT_PORT, GUEST_CID};
use crate::store::VmStore;

/// Default user provisioned inside guests.
pub const GUEST_USER: &str = "vm";

/// ISO generation tools probed in order.
const ISO_TOOLS: &[&str] = &["genisoimage", "mkisofs", "xorrisofs"];

/// Errors raised while producing the cloud-init seed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CloudInitError {
    /// None of the ISO generation tools is installed.
    #[error("no ISO tool found (tried genisoimage, mkisofs, xorrisofs)")]
    ToolNotFound,

    /// The ISO tool ran but failed.
    #[error("ISO generation failed: {0}")]
    GenerationFailed(String),

    /// Reading or writing seed files failed.
    #[error("cloud-init I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders the `user-data` document for a VM.
///
/// The guest agent is reconfigured to listen on the vsock port the daemon
/// polls instead of its default virtio-serial channel.
pub fn user_data(name: &str, ssh_key: Option<&str>) -> String {
    let mut doc = format!(
        "\
#cloud-config
hostname: {name}
users:
  - name: {GUEST_USER}
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash
    lock_passwd: false
"
    );
    if let Some(key) = ssh_key {
        doc.push_str(&format!(
            "    ssh_authorized_keys:\n      - {}\n",
            key.trim()
        ));
    }
    doc.push_str(&format!(
        "\
packages:
  - qemu-guest-agent
write_files:
  - path: /etc/systemd/system/qemu-guest-agent.service.d/vsock.conf
    content: |
      [Service]
      ExecStart=
      ExecStart=/usr/bin/qemu-ga --method=vsock-listen --path={GUEST_CID}:{AGENT_PORT}
runcmd:
  - [systemctl, daemon-reload]
  - [systemctl, enable, --now, qemu-guest-agent]
"
    ));
    doc
}

/// Renders the `meta-data` document for a VM.
pub fn meta_data(name: &str) -> String {
    format!("instance-id: ovm-{name}\nlocal-hostname: {name}\n")
}

/// First readable public key under `~/.ssh`, if any.
pub fn host_ssh_key() -> Option<String> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    for candidate in ["id_ed25519.pub", "id_rsa.pub", "id_ecdsa.pub"] {
        if let Ok(key) = std::fs::read_to_string(ssh_dir.join(candidate)) {
            return Some(key.trim().to_owned());
        }
    }
    None
}

/// Locates an installed ISO generation tool.
fn find_iso_tool() -> Option<&'static str> {
    let path = std::env::var_os("PATH")?;
    for tool in ISO_TOOLS {
        if std::env::split_paths(&path).any(|dir| dir.join(tool).is_file()) {
            return Some(tool);
        }
    }
    None
}

/// `true` if an ISO generation tool is available on this host.
pub fn iso_tool_available() -> bool {
    find_iso_tool().is_some()
}

/// Writes the seed files and joins them into `cloud-init.iso` with the
/// `cidata` volume id.
pub async fn create_seed_iso(store: &VmStore, name: &str) -> Result<PathBuf, CloudInitError> {
    let tool = find_iso_tool().ok_or(CloudInitError::ToolNotFound)?;

    let vm_dir = store.vm_dir(name);
    let iso_path = store.cloud_init_iso_path(name);
    let user_data_path = vm_dir.join("user-data");
    let meta_data_path = vm_dir.join("meta-data");

    std::fs::write(&user_data_path, user_data(name, host_ssh_key().as_deref()))?;
    std::fs::write(&meta_data_path, meta_data(name))?;

    let output = tokio::process::Command::new(tool)
        .arg("-output")
        .arg(&iso_path)
        .args(["-volid", "cidata", "-joliet", "-rock"])
        .arg(&user_data_path)
        .arg(&meta_data_path)
        .output()
        .await?;

    // The rendered inputs are baked into the ISO; drop them either way.
    let _ = std::fs::remove_file(&user_data_path);
    let _ = std::fs::remove_file(&meta_data_path);

    if !output.status.success() {
        return Err(CloudInitError::GenerationFailed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    debug!(iso = %iso_path.display(), tool, "created cloud-init seed ISO");
    Ok(iso_path)
}

/// Renders the per-VM `ssh_config`. The `Hostname` line is only present
/// once a guest address is known.
fn render_ssh_config(name: &str, ip: Option<&str>) -> String {
    let mut config = format!(
        "\
# Generated for VM '{name}'. Host keys churn across reinstalls, so
# verification is disabled.
Host {name}
"
    );
    if let Some(ip) = ip {
        config.push_str(&format!("  Hostname {ip}\n"));
    }
    config.push_str(&format!(
        "\
  User {GUEST_USER}
  StrictHostKeyChecking no
  UserKnownHostsFile /dev/null
  LogLevel ERROR
"
    ));
    config
}

/// Writes the initial per-VM `ssh_config` at creation time; the guest has
/// no address yet.
pub fn write_ssh_config(store: &VmStore, name: &str) -> std::io::Result<PathBuf> {
    let path = store.ssh_config_path(name);
    std::fs::write(&path, render_ssh_config(name, None))?;
    Ok(path)
}

/// Rewrites the per-VM `ssh_config` with the guest's current address.
///
/// `vm ssh` calls this just before exec so the `Host <name>` stanza always
/// carries the last known IP.
pub fn refresh_ssh_config(store: &VmStore, name: &str, ip: &str) -> std::io::Result<PathBuf> {
    let path = store.ssh_config_path(name);
    std::fs::write(&path, render_ssh_config(name, Some(ip)))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_provisions_agent_over_vsock() {
        let doc = user_data("ubuntu", None);
        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("hostname: ubuntu"));
        assert!(doc.contains("qemu-guest-agent"));
        assert!(doc.contains(&format!("--path={GUEST_CID}:{AGENT_PORT}")));
        assert!(!doc.contains("ssh_authorized_keys"));
    }

    #[test]
    fn user_data_includes_ssh_key_when_present() {
        let doc = user_data("ubuntu", Some("ssh-ed25519 AAAA test@host\n"));
        assert!(doc.contains("ssh_authorized_keys"));
        assert!(doc.contains("ssh-ed25519 AAAA test@host"));
    }

    #[test]
    fn meta_data_names_the_instance() {
        let doc = meta_data("dev");
        assert!(doc.contains("instance-id: ovm-dev"));
        assert!(doc.contains("local-hostname: dev"));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn ssh_config_disables_host_key_checks() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path()).unwrap();
        std::fs::create_dir_all(store.vm_dir("box")).unwrap();
        let path = write_ssh_config(&store, "box").unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("Host box"));
        assert!(text.contains("StrictHostKeyChecking no"));
        assert!(text.contains(&format!("User {GUEST_USER}")));
        assert!(!text.contains("Hostname"), "no address is known at creation");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn refresh_fills_the_hostname_from_the_guest_address() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path()).unwrap();
        std::fs::create_dir_all(store.vm_dir("box")).unwrap();
        write_ssh_config(&store, "box").unwrap();

        let path = refresh_ssh_config(&store, "box", "192.168.64.7").unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("Host box"));
        assert!(text.contains("  Hostname 192.168.64.7"));
        assert!(text.contains(&format!("User {GUEST_USER}")));
    }
}
