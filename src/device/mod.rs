//! Node-local block device discovery, mounting and formatting.
//!
//! The node service only talks to these traits; [`os`] provides the
//! implementations that run the system utilities.

pub mod os;

use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use tracing::debug;

use crate::error::{DriverError, DriverResult};

pub use os::{LsblkDeviceLister, MkfsFormatter, SystemMounter};

/// Filesystems the node plugin can create.
pub const SUPPORTED_FILESYSTEMS: &[&str] = &["ext4", "xfs"];
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// A block device as seen by the guest OS.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockDevice {
    pub serial: String,
    pub path: String,
    /// Filesystem found on the device, if any.
    pub fs_type: Option<String>,
}

impl BlockDevice {
    pub fn has_filesystem(&self) -> bool {
        self.fs_type.as_deref().is_some_and(|fs| !fs.is_empty())
    }
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait DeviceLister: Send + Sync {
    async fn list_block_devices(&self) -> DriverResult<Vec<BlockDevice>>;
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` on `target`. An empty `fs_type` lets mount(8) decide,
    /// which is what bind mounts use.
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> DriverResult<()>;
    async fn unmount(&self, target: &str) -> DriverResult<()>;
    async fn is_mount_point(&self, target: &str) -> DriverResult<bool>;
    async fn path_exists(&self, path: &str) -> DriverResult<bool>;
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait FsMaker: Send + Sync {
    async fn make_filesystem(&self, device: &str, fs_type: &str) -> DriverResult<()>;
}

/// Pick the filesystem for a mount request, rejecting anything unsupported.
pub fn filesystem_for(requested: &str) -> DriverResult<&str> {
    if requested.is_empty() {
        return Ok(DEFAULT_FILESYSTEM);
    }
    SUPPORTED_FILESYSTEMS.iter().copied().find(|fs| *fs == requested).ok_or_else(|| {
        DriverError::InvalidArgument(format!(
            "unsupported filesystem type {}, expected one of {}",
            requested,
            SUPPORTED_FILESYSTEMS.join(", ")
        ))
    })
}

/// Find the one device carrying `serial`.
///
/// No match means the hotplug has not reached the guest yet. More than one
/// match is never resolved by guessing.
pub async fn resolve_device<L: DeviceLister + ?Sized>(
    lister: &L,
    serial: &str,
) -> DriverResult<BlockDevice> {
    if serial.is_empty() {
        return Err(DriverError::InvalidArgument(
            "volume context does not carry a device serial".to_string(),
        ));
    }

    let mut matches: Vec<BlockDevice> =
        lister.list_block_devices().await?.into_iter().filter(|d| d.serial == serial).collect();

    match matches.len() {
        0 => Err(DriverError::FailedPrecondition(format!(
            "no block device with serial {} is visible yet",
            serial
        ))),
        1 => {
            let device = matches.remove(0);
            debug!(serial = %serial, path = %device.path, fs = ?device.fs_type, "resolved device");
            Ok(device)
        }
        n => Err(DriverError::FailedPrecondition(format!(
            "{} block devices share serial {}: {}",
            n,
            serial,
            matches.iter().map(|d| d.path.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}
