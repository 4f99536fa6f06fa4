use std::path::{Path, PathBuf};

/// Seed directory layout read by the guest's config-drive datasource.
pub const USER_DATA_DIR: &str = "openstack/latest";
pub const USER_DATA_FILE: &str = "user_data";

/// Per-machine paths under `<store>/machines/<name>/`.
///
/// Every path is a pure function of the store path and machine name, so the
/// control socket of a machine can be found again by any later process.
#[derive(Debug, Clone)]
pub struct MachinePaths {
    dir: PathBuf,
}

impl MachinePaths {
    pub fn new(store_path: &Path, name: &str) -> Self {
        Self {
            dir: store_path.join("machines").join(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persisted instance description.
    pub fn config(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    /// Lock file serializing lifecycle operations across processes.
    pub fn lock(&self) -> PathBuf {
        self.dir.join("lock")
    }

    /// Boot media staged from the configured base image.
    pub fn boot_media(&self) -> PathBuf {
        self.dir.join("boot2docker.iso")
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join("disk.qcow2")
    }

    /// Raw tar image written before conversion to qcow2.
    pub fn raw_disk(&self) -> PathBuf {
        with_suffix(&self.disk(), ".raw")
    }

    /// QMP control socket.
    pub fn monitor(&self) -> PathBuf {
        self.dir.join("monitor")
    }

    pub fn ssh_key(&self) -> PathBuf {
        self.dir.join("id_rsa")
    }

    pub fn ssh_public_key(&self) -> PathBuf {
        with_suffix(&self.ssh_key(), ".pub")
    }

    /// Root of the read-only config-drive passthrough directory.
    pub fn seed_root(&self) -> PathBuf {
        self.dir.join("cloud-config")
    }
}

/// Append a suffix to the full file name (`disk.qcow2` -> `disk.qcow2.raw`).
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
