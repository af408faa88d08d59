//! Raw disk image management: sparse creation, import, grow-only resize.

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::DiskError;

/// Creates a sparse raw image of `size` bytes at `path`.
pub fn create_image(path: &Path, size: u64) -> Result<(), DiskError> {
    if path.exists() {
        return Err(DiskError::DiskAlreadyExists(path.to_path_buf()));
    }
    let file = std::fs::File::create(path).map_err(DiskError::CreationFailed)?;
    file.set_len(size).map_err(DiskError::CreationFailed)?;
    Ok(())
}

/// Copies an existing image into the store.
pub fn copy_image(src: &Path, dst: &Path) -> Result<u64, DiskError> {
    if !src.exists() {
        return Err(DiskError::FileNotFound(src.to_path_buf()));
    }
    if dst.exists() {
        return Err(DiskError::DiskAlreadyExists(dst.to_path_buf()));
    }
    std::fs::copy(src, dst).map_err(DiskError::CopyFailed)
}

/// Links an existing image into the store without copying.
pub fn link_image(src: &Path, dst: &Path) -> Result<(), DiskError> {
    if !src.exists() {
        return Err(DiskError::FileNotFound(src.to_path_buf()));
    }
    if dst.exists() {
        return Err(DiskError::DiskAlreadyExists(dst.to_path_buf()));
    }
    let abs = src
        .canonicalize()
        .map_err(|_| DiskError::FileNotFound(src.to_path_buf()))?;
    std::os::unix::fs::symlink(abs, dst).map_err(DiskError::CreationFailed)
}

/// Grows an image to `new_size` bytes. Shrinking is refused.
pub fn resize_image(path: &Path, new_size: u64) -> Result<(), DiskError> {
    if !path.exists() {
        return Err(DiskError::FileNotFound(path.to_path_buf()));
    }
    let current = std::fs::metadata(path)
        .map_err(|e| DiskError::ResizeFailed(e.to_string()))?
        .len();
    if new_size <= current {
        return Err(DiskError::ResizeFailed(format!(
            "disk can only grow (current {current} bytes, requested {new_size})"
        )));
    }
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| DiskError::ResizeFailed(e.to_string()))?;
    file.set_len(new_size)
        .map_err(|e| DiskError::ResizeFailed(e.to_string()))
}

/// Size of an image in bytes as seen by the guest.
pub fn image_size(path: &Path) -> Result<u64, DiskError> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|_| DiskError::FileNotFound(path.to_path_buf()))
}
