//! Free-space probe backed by the OS disk list

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{StorageQuota, VolumeSpace},
};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

/// Reports space on the disk that holds the cache database.
///
/// The disk is the one whose mount point is the longest prefix of the
/// configured path. When nothing matches, the first listed disk is used.
#[derive(Debug, Clone)]
pub struct DiskStorageQuota {
    path: PathBuf,
}

impl DiskStorageQuota {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn probe(path: &Path) -> Result<VolumeSpace> {
        let disks = Disks::new_with_refreshed_list();

        let best = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .or_else(|| disks.list().first());

        let disk = best.ok_or_else(|| {
            BridgeError::NotAvailable("No disks reported by the operating system".to_string())
        })?;

        let space = VolumeSpace::new(disk.total_space(), disk.available_space());
        debug!(
            path = %path.display(),
            mount = %disk.mount_point().display(),
            total = space.total_bytes,
            available = space.available_bytes,
            "Probed disk space"
        );
        Ok(space)
    }
}

#[async_trait]
impl StorageQuota for DiskStorageQuota {
    async fn volume_space(&self) -> Result<VolumeSpace> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::probe(&path))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Disk probe panicked: {}", e)))?
    }
}
