//! Rescue image cache: download, verify, convert, reuse.
//!
//! The rescue VM boots a Fedora Cloud Base image whose disk is attached
//! next to the target VM's disk. Images are fetched per architecture,
//! verified against the published `CHECKSUM` file, converted from qcow2
//! to raw with `qemu-img`, and cached under the store root.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::VmConfig;
use crate::error::ManagerError;
use crate::store::{RESCUE_VM_NAME, VmStore};

/// Fedora release the rescue image comes from.
const RESCUE_RELEASE: &str = "40";

/// Image build within the release.
const RESCUE_BUILD: &str = "40-1.14";

/// Download chunk size.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Errors raised by the rescue image cache.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RescueCacheError {
    /// A download failed or networking was required in offline mode.
    #[error("rescue image download failed: {0}")]
    NetworkError(String),

    /// The downloaded image did not match the published digest.
    #[error("rescue image checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch {
        /// Digest from the CHECKSUM file.
        expected: String,
        /// Digest of the downloaded bytes.
        actual: String,
    },

    /// The CHECKSUM file had no usable entry.
    #[error("cannot parse rescue image checksum: {0}")]
    ParseError(String),

    /// Cache directory or file I/O failed.
    #[error("rescue cache I/O error: {0}")]
    FileSystemError(#[from] std::io::Error),

    /// No rescue image is published for this architecture.
    #[error("no rescue image for architecture '{0}'")]
    UnsupportedArchitecture(String),

    /// qcow2 → raw conversion failed.
    #[error("rescue image conversion failed: {0}")]
    ConversionError(String),
}

/// Architectures the rescue image is published for.
fn supported_arch() -> Result<&'static str, RescueCacheError> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x86_64"),
        "aarch64" => Ok("aarch64"),
        other => Err(RescueCacheError::UnsupportedArchitecture(other.to_owned())),
    }
}

/// Extracts the SHA256 hex digest for `filename` from a Fedora CHECKSUM
/// file (`SHA256 (name) = hex` lines).
fn parse_sha256(text: &str, filename: &str) -> Result<String, RescueCacheError> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SHA256 (")
            && let Some((name, hex)) = rest.split_once(") = ")
            && name == filename
        {
            let hex = hex.trim();
            if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Ok(hex.to_ascii_lowercase());
            }
            return Err(RescueCacheError::ParseError(format!(
                "malformed digest for {filename}"
            )));
        }
    }
    Err(RescueCacheError::ParseError(format!(
        "no SHA256 entry for {filename}"
    )))
}

/// On-disk cache of converted rescue images.
#[derive(Debug)]
pub struct RescueCache {
    /// Cache directory, `<store root>/.cache/rescue`.
    cache_dir: PathBuf,
}

impl RescueCache {
    /// Creates a cache handle under the store root.
    pub fn new(store: &VmStore) -> Self {
        Self {
            cache_dir: store.root().join(".cache").join("rescue"),
        }
    }

    /// Path of the converted raw image for this architecture.
    pub fn image_path(&self) -> Result<PathBuf, RescueCacheError> {
        let arch = supported_arch()?;
        Ok(self
            .cache_dir
            .join(format!("rescue-{RESCUE_BUILD}.{arch}.raw")))
    }

    /// Returns the cached raw image, downloading / verifying / converting
    /// as needed.
    ///
    /// `force_download` ignores an existing cache entry; `offline` refuses
    /// to touch the network and requires one.
    pub fn ensure_image(
        &self,
        force_download: bool,
        offline: bool,
        mut progress: impl FnMut(&str),
    ) -> Result<PathBuf, RescueCacheError> {
        let arch = supported_arch()?;
        let raw_path = self.image_path()?;

        if raw_path.exists() && !force_download {
            debug!(image = %raw_path.display(), "using cached rescue image");
            return Ok(raw_path);
        }
        if offline {
            return Err(RescueCacheError::NetworkError(
                "offline mode requested but no cached rescue image exists".into(),
            ));
        }
        std::fs::create_dir_all(&self.cache_dir)?;

        let image_name = format!("Fedora-Cloud-Base-Generic.{arch}-{RESCUE_BUILD}.qcow2");
        let base_url = format!(
            "https://download.fedoraproject.org/pub/fedora/linux/releases/{RESCUE_RELEASE}/Cloud/{arch}/images"
        );
        let checksum_name = format!("Fedora-Cloud-{RESCUE_BUILD}-{arch}-CHECKSUM");

        progress("Fetching rescue image checksum");
        let checksum_text = fetch_string(&format!("{base_url}/{checksum_name}"))?;
        let expected = parse_sha256(&checksum_text, &image_name)?;

        progress("Downloading rescue image (this can take a while)");
        let qcow2_tmp = self.cache_dir.join(format!("{image_name}.partial"));
        let actual = download_to(&format!("{base_url}/{image_name}"), &qcow2_tmp)?;
        if actual != expected {
            let _ = std::fs::remove_file(&qcow2_tmp);
            return Err(RescueCacheError::ChecksumMismatch { expected, actual });
        }

        progress("Converting rescue image to raw");
        let raw_tmp = self.cache_dir.join(format!("{image_name}.raw.partial"));
        convert_to_raw(&qcow2_tmp, &raw_tmp)?;
        std::fs::rename(&raw_tmp, &raw_path)?;
        let _ = std::fs::remove_file(&qcow2_tmp);

        info!(image = %raw_path.display(), "rescue image ready");
        Ok(raw_path)
    }
}

/// Fetches a small text resource.
fn fetch_string(url: &str) -> Result<String, RescueCacheError> {
    let response = ureq::get(url)
        .call()
        .map_err(|e| RescueCacheError::NetworkError(e.to_string()))?;
    let mut text = String::new();
    response
        .into_body()
        .into_reader()
        .read_to_string(&mut text)
        .map_err(|e| RescueCacheError::NetworkError(e.to_string()))?;
    Ok(text)
}

/// Streams a download to disk, returning its SHA256 hex digest.
fn download_to(url: &str, dest: &Path) -> Result<String, RescueCacheError> {
    let response = ureq::get(url)
        .call()
        .map_err(|e| RescueCacheError::NetworkError(e.to_string()))?;
    let mut reader = response.into_body().into_reader();

    let mut file = std::fs::File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DOWNLOAD_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| RescueCacheError::NetworkError(e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        std::io::Write::write_all(&mut file, &buf[..n])?;
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>())
}

/// Converts a qcow2 image to raw via `qemu-img`.
fn convert_to_raw(src: &Path, dest: &Path) -> Result<(), RescueCacheError> {
    let output = std::process::Command::new("qemu-img")
        .args(["convert", "-f", "qcow2", "-O", "raw"])
        .arg(src)
        .arg(dest)
        .output()
        .map_err(|e| RescueCacheError::ConversionError(format!("cannot run qemu-img: {e}")))?;
    if !output.status.success() {
        return Err(RescueCacheError::ConversionError(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

/// Copies the cached image into the rescue VM's directory and writes (or
/// refreshes) its configuration, so every rescue boots a pristine disk.
///
/// The configuration is validated before it is persisted; an image below
/// the disk-size floor is rejected rather than stored.
pub fn prepare_rescue_vm(store: &VmStore, image: &Path) -> Result<VmConfig, ManagerError> {
    let vm_dir = store.vm_dir(RESCUE_VM_NAME);
    std::fs::create_dir_all(&vm_dir)?;

    let disk = vm_dir.join("disk.img");
    std::fs::copy(image, &disk)?;
    let disk_size = std::fs::metadata(&disk)?.len();

    let config = match store.load_config(RESCUE_VM_NAME) {
        Ok(mut existing) => {
            existing.disk_size = disk_size;
            existing
        }
        Err(ManagerError::VmNotFound(_)) => {
            // Fit the allocation to the host so small machines can still
            // run a rescue.
            let cpus = crate::config::host_cpu_count().min(2);
            let memory = (4u64 << 30)
                .min(crate::config::host_memory_size())
                .max(crate::config::MIN_MEMORY_SIZE);
            let mut c = VmConfig::new(RESCUE_VM_NAME, cpus, memory, disk_size);
            c.disk_image_path = PathBuf::from("disk.img");
            c
        }
        Err(e) => return Err(e),
    };
    config.validate()?;
    store.save_config(&config)?;
    store.load_config(RESCUE_VM_NAME)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CHECKSUM_FILE: &str = "\
# Fedora-Cloud-40-1.14-x86_64-CHECKSUM
# The image checksum:
SHA256 (Fedora-Cloud-Base-Generic.x86_64-40-1.14.qcow2) = 0b4b1b3c40e9d2b4d0e6f287ca4a8fbfb3f1a4e3e9e7a3d2c1b0a99887766554
SHA256 (Fedora-Cloud-Base-AmazonEC2.x86_64-40-1.14.raw.xz) = ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff
";

    #[test]
    fn parses_matching_checksum_line() {
        let digest = parse_sha256(
            CHECKSUM_FILE,
            "Fedora-Cloud-Base-Generic.x86_64-40-1.14.qcow2",
        )
        .unwrap();
        assert_eq!(
            digest,
            "0b4b1b3c40e9d2b4d0e6f287ca4a8fbfb3f1a4e3e9e7a3d2c1b0a99887766554"
        );
    }

    #[test]
    fn missing_entry_is_a_parse_error() {
        assert!(matches!(
            parse_sha256(CHECKSUM_FILE, "nope.qcow2"),
            Err(RescueCacheError::ParseError(_))
        ));
    }

    #[test]
    fn malformed_digest_is_a_parse_error() {
        let text = "SHA256 (img.qcow2) = nothex";
        assert!(matches!(
            parse_sha256(text, "img.qcow2"),
            Err(RescueCacheError::ParseError(_))
        ));
    }

    #[test]
    fn offline_without_cache_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path()).unwrap();
        let cache = RescueCache::new(&store);
        match cache.ensure_image(false, true, |_| {}) {
            Err(RescueCacheError::NetworkError(msg)) => {
                assert!(msg.contains("offline"), "{msg}");
            }
            other => panic!("expected NetworkError, got {other:?}"),
        }
    }

    #[test]
    fn cached_image_is_reused_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path()).unwrap();
        let cache = RescueCache::new(&store);

        let path = cache.image_path().unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"raw image").unwrap();

        let got = cache.ensure_image(false, true, |_| {}).unwrap();
        assert_eq!(got, path);
    }

    #[test]
    fn prepare_rescue_vm_copies_a_fresh_disk() {
        use crate::config::MIN_DISK_SIZE;

        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path()).unwrap();

        // Sparse image at exactly the disk-size floor.
        let image = dir.path().join("image.raw");
        let file = std::fs::File::create(&image).unwrap();
        file.set_len(MIN_DISK_SIZE).unwrap();

        let config = prepare_rescue_vm(&store, &image).unwrap();
        assert_eq!(config.name, RESCUE_VM_NAME);
        assert_eq!(config.disk_size, MIN_DISK_SIZE);
        assert!(store.vm_dir(RESCUE_VM_NAME).join("disk.img").exists());

        // A second run refreshes the disk and keeps the config.
        file.set_len(MIN_DISK_SIZE + 4096).unwrap();
        let again = prepare_rescue_vm(&store, &image).unwrap();
        assert_eq!(again.disk_size, MIN_DISK_SIZE + 4096);
        assert_eq!(again.mac_address, config.mac_address);
    }

    #[test]
    fn prepare_rescue_vm_rejects_an_undersized_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::at(dir.path()).unwrap();

        let image = dir.path().join("tiny.raw");
        std::fs::write(&image, vec![7u8; 4096]).unwrap();

        match prepare_rescue_vm(&store, &image) {
            Err(ManagerError::ConfigurationError(msg)) => {
                assert!(msg.contains("disk_size"), "{msg}");
            }
            other => panic!("expected ConfigurationError, got {other:?}"),
        }
        // Nothing was persisted.
        assert!(!store.config_path(RESCUE_VM_NAME).exists());
    }
}
