//! Boot disk and seed directory assembly.
//!
//! The boot disk starts life as a tar archive written to a raw image. The
//! guest's first-boot automount script finds the sentinel entry, formats the
//! disk, and extracts the rest of the archive into the persistent volume.
//!
//! ```text
//! boot2docker, please format-me      sentinel (name == content)
//! .ssh/                              0700
//! .ssh/authorized_keys               0644, public key
//! .ssh/authorized_keys2              0644, public key
//! ```

use std::path::{Path, PathBuf};

use machine::MachineError;
use tar::{Builder, EntryType, Header};
use tracing::{debug, info};

use crate::command::exec;
use crate::paths::{USER_DATA_DIR, USER_DATA_FILE, with_suffix};

/// Tells the guest's automount script to format the disk on first boot.
pub const FORMAT_SENTINEL: &str = "boot2docker, please format-me";

const SSH_DIR: &str = ".ssh";
const AUTHORIZED_KEYS: &[&str] = &[".ssh/authorized_keys", ".ssh/authorized_keys2"];

/// Build the in-memory boot archive for a public key.
pub fn build_archive(public_key: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    // Sentinel first so the automount script sees it before anything else.
    let mut header = file_header(FORMAT_SENTINEL.len(), 0o644);
    builder.append_data(&mut header, FORMAT_SENTINEL, FORMAT_SENTINEL.as_bytes())?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o700);
    builder.append_data(&mut header, SSH_DIR, std::io::empty())?;

    for name in AUTHORIZED_KEYS {
        let mut header = file_header(public_key.len(), 0o644);
        builder.append_data(&mut header, name, public_key)?;
    }

    builder.into_inner()
}

fn file_header(len: usize, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(len as u64);
    header.set_mode(mode);
    header
}

/// Wraps the image tool (`qemu-img`).
#[derive(Debug, Clone)]
pub struct ImageTool {
    program: String,
}

impl ImageTool {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_string_lossy().into_owned(),
        }
    }

    /// Build the qcow2 boot disk at `disk` with `size_mb` of added capacity.
    ///
    /// The raw archive is left next to the disk as `<disk>.raw`. Partial
    /// artifacts are not removed on failure.
    pub async fn build_boot_disk(
        &self,
        disk: &Path,
        public_key: &[u8],
        size_mb: u64,
    ) -> Result<(), MachineError> {
        info!(disk = %disk.display(), size_mb, "creating boot disk");

        let archive = build_archive(public_key)
            .map_err(|e| MachineError::BuildFailed(format!("write archive: {e}")))?;

        let raw = with_suffix(disk, ".raw");
        tokio::fs::write(&raw, &archive)
            .await
            .map_err(|e| MachineError::BuildFailed(format!("write {}: {e}", raw.display())))?;

        // Resize only after conversion: qcow2 grows, the raw tar must not.
        self.convert(&raw, disk).await?;
        self.resize(disk, size_mb).await?;

        debug!(raw = %raw.display(), disk = %disk.display(), "boot disk written");
        Ok(())
    }

    async fn convert(&self, raw: &Path, disk: &Path) -> Result<(), MachineError> {
        let raw_str = raw.display().to_string();
        let disk_str = disk.display().to_string();
        exec(
            &self.program,
            &["convert", "-f", "raw", "-O", "qcow2", &raw_str, &disk_str],
        )
        .await
        .map_err(|e| e.into_build_error())?;
        Ok(())
    }

    async fn resize(&self, disk: &Path, size_mb: u64) -> Result<(), MachineError> {
        let disk_str = disk.display().to_string();
        let delta = format!("+{size_mb}M");
        exec(&self.program, &["resize", &disk_str, &delta])
            .await
            .map_err(|e| e.into_build_error())?;
        Ok(())
    }

    /// Virtual size of an image in bytes, as reported by `qemu-img info`.
    pub async fn virtual_size(&self, image: &Path) -> Result<u64, MachineError> {
        let image_str = image.display().to_string();
        let output = exec(&self.program, &["info", "--output=json", &image_str])
            .await
            .map_err(|e| e.into_build_error())?;
        let info: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| MachineError::BuildFailed(format!("parse image info: {e}")))?;
        info.get("virtual-size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| MachineError::BuildFailed("image info has no virtual-size".into()))
    }
}

/// Write the seed directory `<root>/openstack/latest/user_data`.
///
/// The bytes are copied verbatim. Returns the seed root, which is later
/// exported read-only to the guest.
pub async fn build_seed(root: &Path, userdata: &[u8]) -> Result<PathBuf, MachineError> {
    let dir = root.join(USER_DATA_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| MachineError::BuildFailed(format!("mkdir {}: {e}", dir.display())))?;

    let file = dir.join(USER_DATA_FILE);
    tokio::fs::write(&file, userdata)
        .await
        .map_err(|e| MachineError::BuildFailed(format!("write {}: {e}", file.display())))?;

    info!(root = %root.display(), bytes = userdata.len(), "seed directory written");
    Ok(root.to_path_buf())
}
