//! Idempotent, policy-aware operations built from [`InfraCluster`] primitives.

use tracing::{debug, info, warn};

use super::InfraCluster;
use super::models::*;
use crate::error::{DriverError, DriverResult};
use crate::node_identity::InstanceRef;
use crate::policy::{SnapshotClassDecision, StorageClassEnforcement};

/// Find the snapshot class backing `storage_class`.
///
/// An explicit class must share the storage class provisioner. With no
/// explicit class, the single default class of that provisioner is used.
pub async fn resolve_snapshot_class<C: InfraCluster + ?Sized>(
    infra: &C,
    storage_class: &str,
    requested: &str,
) -> DriverResult<SnapshotClassBinding> {
    let sc = infra
        .get_storage_class(storage_class)
        .await?
        .ok_or_else(|| DriverError::not_found("StorageClass", storage_class))?;

    if !requested.is_empty() {
        let vsc = infra
            .get_snapshot_class(requested)
            .await?
            .ok_or_else(|| DriverError::not_found("VolumeSnapshotClass", requested))?;
        if vsc.driver != sc.provisioner {
            return Err(DriverError::FailedPrecondition(format!(
                "provisioner mismatch: volume snapshot class {} uses {} but storage class {} uses {}",
                vsc.name, vsc.driver, sc.name, sc.provisioner
            )));
        }
        return Ok(SnapshotClassBinding {
            storage_class: sc.name,
            provisioner: sc.provisioner,
            snapshot_class: vsc.name,
        });
    }

    let defaults: Vec<SnapshotClassInfo> = infra
        .list_snapshot_classes()
        .await?
        .into_iter()
        .filter(|vsc| vsc.is_default && vsc.driver == sc.provisioner)
        .collect();

    match defaults.as_slice() {
        [] => Err(DriverError::not_found(
            "default VolumeSnapshotClass for provisioner",
            sc.provisioner.clone(),
        )),
        [only] => Ok(SnapshotClassBinding {
            storage_class: sc.name.clone(),
            provisioner: sc.provisioner.clone(),
            snapshot_class: only.name.clone(),
        }),
        many => Err(DriverError::FailedPrecondition(format!(
            "{} volume snapshot classes are marked default for provisioner {}: {}",
            many.len(),
            sc.provisioner,
            many.iter().map(|vsc| vsc.name.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Resolve and police the snapshot class for a snapshot of a volume stored
/// in `storage_class`.
pub async fn choose_snapshot_class<C: InfraCluster + ?Sized>(
    infra: &C,
    policy: &StorageClassEnforcement,
    storage_class: &str,
    requested: &str,
) -> DriverResult<SnapshotClassBinding> {
    match policy.check_snapshot_class(storage_class, requested)? {
        SnapshotClassDecision::Use(name) => {
            resolve_snapshot_class(infra, storage_class, &name).await
        }
        SnapshotClassDecision::ResolveDefault(restriction) => {
            let binding = resolve_snapshot_class(infra, storage_class, "").await?;
            if !restriction.permits(&binding.snapshot_class) {
                return Err(DriverError::PermissionDenied(format!(
                    "default volume snapshot class {} is not permitted for storage class {}",
                    binding.snapshot_class, storage_class
                )));
            }
            Ok(binding)
        }
    }
}

/// Name of the PersistentVolume bound to a claim.
///
/// An unbound claim is reported as `FailedPrecondition` so the caller retries.
pub async fn resolve_volume_name_from_claim<C: InfraCluster + ?Sized>(
    infra: &C,
    namespace: &str,
    claim: &str,
) -> DriverResult<String> {
    let pvc = infra
        .get_claim(namespace, claim)
        .await?
        .ok_or_else(|| DriverError::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, claim)))?;

    pvc.volume_name.ok_or_else(|| {
        DriverError::FailedPrecondition(format!(
            "PersistentVolumeClaim {}/{} is not bound to a volume yet",
            namespace, claim
        ))
    })
}

/// Storage class of the volume behind a claim, walking claim, bound volume
/// and its class.
pub async fn storage_class_for_claim<C: InfraCluster + ?Sized>(
    infra: &C,
    namespace: &str,
    claim: &str,
) -> DriverResult<String> {
    let volume_name = resolve_volume_name_from_claim(infra, namespace, claim).await?;

    if let Some(pv) = infra.get_persistent_volume(&volume_name).await? {
        if let Some(storage_class) = pv.storage_class {
            return Ok(storage_class);
        }
    }

    infra
        .get_claim(namespace, claim)
        .await?
        .and_then(|pvc| pvc.storage_class)
        .ok_or_else(|| {
            DriverError::FailedPrecondition(format!(
                "no storage class recorded for PersistentVolumeClaim {}/{}",
                namespace, claim
            ))
        })
}

/// Whether `storage_class` is the cluster default. An empty name stands for
/// the default class itself.
pub async fn is_default_storage_class<C: InfraCluster + ?Sized>(
    infra: &C,
    storage_class: &str,
) -> DriverResult<bool> {
    if storage_class.is_empty() {
        return Ok(true);
    }
    Ok(infra.get_storage_class(storage_class).await?.map(|sc| sc.is_default).unwrap_or(false))
}

/// Apply the enforcement policy to a storage class, looking up the cluster
/// default only when the answer depends on it.
pub async fn enforce_storage_class<C: InfraCluster + ?Sized>(
    infra: &C,
    policy: &StorageClassEnforcement,
    storage_class: &str,
) -> DriverResult<()> {
    let is_default = if policy.needs_default_lookup(storage_class) {
        is_default_storage_class(infra, storage_class).await?
    } else {
        false
    };
    policy.check_storage_class(storage_class, is_default)
}

/// Create a DataVolume unless one with the same name exists.
///
/// An existing volume with the same size, storage class and content source
/// is returned as is; anything else is `AlreadyExists`.
pub async fn ensure_remote_volume<C: InfraCluster + ?Sized>(
    infra: &C,
    namespace: &str,
    volume: &NewRemoteVolume,
) -> DriverResult<RemoteVolume> {
    if let Some(existing) = infra.get_data_volume(namespace, &volume.name).await? {
        if existing.size_bytes != volume.size_bytes {
            return Err(DriverError::already_exists(
                "DataVolume",
                &volume.name,
                format!("size is {} bytes, requested {}", existing.size_bytes, volume.size_bytes),
            ));
        }
        if volume.storage_class.is_some() && existing.storage_class != volume.storage_class {
            return Err(DriverError::already_exists(
                "DataVolume",
                &volume.name,
                format!(
                    "storage class is {}, requested {}",
                    existing.storage_class.as_deref().unwrap_or("<default>"),
                    volume.storage_class.as_deref().unwrap_or("<default>")
                ),
            ));
        }
        // Source namespaces default to the DataVolume's own namespace.
        let own_namespace =
            if existing.namespace.is_empty() { namespace } else { existing.namespace.as_str() };
        let existing_source = existing.source.or_namespace(own_namespace);
        if existing_source != volume.source.or_namespace(namespace) {
            return Err(DriverError::already_exists(
                "DataVolume",
                &volume.name,
                format!("content source is {:?}, requested {:?}", existing_source, volume.source),
            ));
        }
        debug!(namespace = %namespace, name = %volume.name, "DataVolume already exists");
        return Ok(existing);
    }

    infra.create_data_volume(namespace, volume).await
}

pub async fn delete_remote_volume<C: InfraCluster + ?Sized>(
    infra: &C,
    namespace: &str,
    name: &str,
) -> DriverResult<()> {
    if !infra.delete_data_volume(namespace, name).await? {
        debug!(namespace = %namespace, name = %name, "DataVolume not found, nothing to delete");
    }
    Ok(())
}

/// Hotplug a volume unless a disk with the same name is already present.
pub async fn attach_volume<C: InfraCluster + ?Sized>(
    infra: &C,
    instance: &InstanceRef,
    attachment: &Attachment,
) -> DriverResult<()> {
    let attached = infra.list_hotplugged_volumes(instance).await?;
    if attached.iter().any(|name| name == &attachment.disk_name) {
        debug!(vm = %instance, disk = %attachment.disk_name, "volume already attached");
        return Ok(());
    }
    infra.add_volume(instance, attachment).await
}

/// Unplug a disk if it is present.
pub async fn detach_volume<C: InfraCluster + ?Sized>(
    infra: &C,
    instance: &InstanceRef,
    disk_name: &str,
) -> DriverResult<()> {
    let attached = match infra.list_hotplugged_volumes(instance).await {
        Ok(attached) => attached,
        // A VM that is gone has nothing attached.
        Err(DriverError::NotFound { .. }) => {
            warn!(vm = %instance, disk = %disk_name, "VM not found, treating volume as detached");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if !attached.iter().any(|name| name == disk_name) {
        debug!(vm = %instance, disk = %disk_name, "volume already detached");
        return Ok(());
    }
    infra.remove_volume(instance, disk_name).await
}

/// Find the VMI whose firmware UUID equals `hardware_id`, ignoring case.
pub async fn find_instance_by_hardware_id<C: InfraCluster + ?Sized>(
    infra: &C,
    namespace: &str,
    hardware_id: &str,
) -> DriverResult<InstanceRef> {
    let instance = infra
        .list_instances(namespace)
        .await?
        .into_iter()
        .find(|vmi| {
            vmi.hardware_id.as_deref().is_some_and(|id| id.eq_ignore_ascii_case(hardware_id))
        })
        .ok_or_else(|| DriverError::not_found("VirtualMachineInstance with firmware uuid", hardware_id))?;

    info!(hardware_id = %hardware_id, vm = %instance.name, "resolved legacy node id");
    Ok(InstanceRef::new(instance.namespace, instance.name))
}

/// Map a CSI node ID onto an infra VM. `namespace/name` IDs are taken
/// verbatim; anything else is treated as a legacy firmware UUID.
pub async fn resolve_instance<C: InfraCluster + ?Sized>(
    infra: &C,
    namespace: &str,
    node_id: &str,
) -> DriverResult<InstanceRef> {
    if node_id.is_empty() {
        return Err(DriverError::InvalidArgument("node id is required".to_string()));
    }
    match InstanceRef::parse(node_id) {
        Some(instance) => Ok(instance),
        None => find_instance_by_hardware_id(infra, namespace, node_id).await,
    }
}
