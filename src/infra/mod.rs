//! Access to the infra cluster hosting the tenant's virtual machines.
//!
//! [`InfraCluster`] exposes the primitive reads and writes the driver needs;
//! [`resolve`] builds the idempotent, policy-aware operations on top of it.

pub mod kubernetes;
pub mod models;
pub mod resolve;

use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::error::DriverResult;
use crate::node_identity::InstanceRef;

pub use kubernetes::{ApiServerProbe, KubeInfraCluster};
pub use models::*;

/// Primitive operations against the infra cluster API.
///
/// Lookups return `Ok(None)` for missing objects. Implementations carry no
/// per-request state and are shared between concurrent requests.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait InfraCluster: Send + Sync {
    async fn get_storage_class(&self, name: &str) -> DriverResult<Option<StorageClassInfo>>;
    async fn list_storage_classes(&self) -> DriverResult<Vec<StorageClassInfo>>;

    async fn get_snapshot_class(&self, name: &str) -> DriverResult<Option<SnapshotClassInfo>>;
    async fn list_snapshot_classes(&self) -> DriverResult<Vec<SnapshotClassInfo>>;

    async fn get_claim(&self, namespace: &str, name: &str) -> DriverResult<Option<ClaimInfo>>;
    async fn get_persistent_volume(&self, name: &str)
    -> DriverResult<Option<PersistentVolumeInfo>>;

    async fn get_data_volume(&self, namespace: &str, name: &str)
    -> DriverResult<Option<RemoteVolume>>;
    async fn create_data_volume(
        &self,
        namespace: &str,
        volume: &NewRemoteVolume,
    ) -> DriverResult<RemoteVolume>;
    /// Returns false when there was nothing to delete.
    async fn delete_data_volume(&self, namespace: &str, name: &str) -> DriverResult<bool>;

    async fn list_instances(&self, namespace: &str) -> DriverResult<Vec<InstanceInfo>>;

    /// Names of the volumes hotplugged, or being hotplugged, into a VM.
    async fn list_hotplugged_volumes(&self, instance: &InstanceRef) -> DriverResult<Vec<String>>;
    async fn add_volume(&self, instance: &InstanceRef, attachment: &Attachment)
    -> DriverResult<()>;
    async fn remove_volume(&self, instance: &InstanceRef, disk_name: &str) -> DriverResult<()>;

    async fn get_snapshot(&self, namespace: &str, name: &str)
    -> DriverResult<Option<RemoteSnapshot>>;
    async fn list_snapshots(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> DriverResult<Vec<RemoteSnapshot>>;
    async fn create_snapshot(
        &self,
        namespace: &str,
        snapshot: &NewRemoteSnapshot,
    ) -> DriverResult<RemoteSnapshot>;
    /// Returns false when there was nothing to delete.
    async fn delete_snapshot(&self, namespace: &str, name: &str) -> DriverResult<bool>;
}

/// Liveness check of a cluster API server.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> DriverResult<()>;
}
