// In-memory stand-ins for the infra cluster and the node OS, shared by the
// integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use kubevirt_csi::device::{BlockDevice, DeviceLister, FsMaker, Mounter};
use kubevirt_csi::error::{DriverError, DriverResult};
use kubevirt_csi::infra::*;
use kubevirt_csi::node_identity::InstanceRef;

pub const INFRA_NAMESPACE: &str = "infra";

#[derive(Default)]
struct InfraState {
    storage_classes: Vec<StorageClassInfo>,
    snapshot_classes: Vec<SnapshotClassInfo>,
    volumes: BTreeMap<String, RemoteVolume>,
    snapshots: BTreeMap<String, RemoteSnapshot>,
    instances: Vec<InstanceInfo>,
    /// Disk names hotplugged into each VM, keyed by `namespace/name`.
    hotplugged: HashMap<String, BTreeSet<String>>,
}

/// Fake infra cluster keeping its objects in memory and counting mutations.
#[derive(Default)]
pub struct FakeInfraCluster {
    state: Mutex<InfraState>,
    pub add_volume_calls: Mutex<u32>,
    pub remove_volume_calls: Mutex<u32>,
    pub create_data_volume_calls: Mutex<u32>,
    /// DataVolumes actually removed, not counting deletes of absent names.
    pub deleted_data_volumes: Mutex<u32>,
}

impl FakeInfraCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage_class(self, name: &str, provisioner: &str, is_default: bool) -> Self {
        self.state.lock().unwrap().storage_classes.push(StorageClassInfo {
            name: name.to_string(),
            provisioner: provisioner.to_string(),
            is_default,
        });
        self
    }

    pub fn with_snapshot_class(self, name: &str, driver: &str, is_default: bool) -> Self {
        self.state.lock().unwrap().snapshot_classes.push(SnapshotClassInfo {
            name: name.to_string(),
            driver: driver.to_string(),
            is_default,
        });
        self
    }

    pub fn with_instance(self, namespace: &str, name: &str, hardware_id: Option<&str>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.instances.push(InstanceInfo {
                namespace: namespace.to_string(),
                name: name.to_string(),
                hardware_id: hardware_id.map(str::to_string),
            });
            state.hotplugged.entry(format!("{}/{}", namespace, name)).or_default();
        }
        self
    }

    pub fn volume(&self, name: &str) -> Option<RemoteVolume> {
        self.state.lock().unwrap().volumes.get(name).cloned()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }

    pub fn attached(&self, instance: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .hotplugged
            .get(instance)
            .map(|disks| disks.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_volume_calls(&self) -> u32 {
        *self.add_volume_calls.lock().unwrap()
    }

    pub fn remove_volume_calls(&self) -> u32 {
        *self.remove_volume_calls.lock().unwrap()
    }

    pub fn create_data_volume_calls(&self) -> u32 {
        *self.create_data_volume_calls.lock().unwrap()
    }

    pub fn deleted_data_volumes(&self) -> u32 {
        *self.deleted_data_volumes.lock().unwrap()
    }
}

#[async_trait]
impl InfraCluster for FakeInfraCluster {
    async fn get_storage_class(&self, name: &str) -> DriverResult<Option<StorageClassInfo>> {
        Ok(self.state.lock().unwrap().storage_classes.iter().find(|sc| sc.name == name).cloned())
    }

    async fn list_storage_classes(&self) -> DriverResult<Vec<StorageClassInfo>> {
        Ok(self.state.lock().unwrap().storage_classes.clone())
    }

    async fn get_snapshot_class(&self, name: &str) -> DriverResult<Option<SnapshotClassInfo>> {
        Ok(self.state.lock().unwrap().snapshot_classes.iter().find(|c| c.name == name).cloned())
    }

    async fn list_snapshot_classes(&self) -> DriverResult<Vec<SnapshotClassInfo>> {
        Ok(self.state.lock().unwrap().snapshot_classes.clone())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> DriverResult<Option<ClaimInfo>> {
        let state = self.state.lock().unwrap();
        // CDI creates a bound claim named after every DataVolume.
        Ok(state.volumes.get(name).map(|dv| ClaimInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            volume_name: Some(format!("pv-{}", dv.uid)),
            storage_class: dv.storage_class.clone(),
        }))
    }

    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> DriverResult<Option<PersistentVolumeInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state.volumes.values().find(|dv| format!("pv-{}", dv.uid) == name).map(|dv| {
            PersistentVolumeInfo { name: name.to_string(), storage_class: dv.storage_class.clone() }
        }))
    }

    async fn get_data_volume(
        &self,
        _namespace: &str,
        name: &str,
    ) -> DriverResult<Option<RemoteVolume>> {
        Ok(self.volume(name))
    }

    async fn create_data_volume(
        &self,
        namespace: &str,
        volume: &NewRemoteVolume,
    ) -> DriverResult<RemoteVolume> {
        *self.create_data_volume_calls.lock().unwrap() += 1;
        let mut state = self.state.lock().unwrap();
        if state.volumes.contains_key(&volume.name) {
            return Err(DriverError::already_exists("DataVolume", &volume.name, "name taken"));
        }
        let created = RemoteVolume {
            name: volume.name.clone(),
            namespace: namespace.to_string(),
            uid: uuid::Uuid::new_v4().to_string(),
            storage_class: volume.storage_class.clone(),
            size_bytes: volume.size_bytes,
            labels: volume.labels.clone(),
            source: volume.source.clone(),
        };
        state.volumes.insert(volume.name.clone(), created.clone());
        Ok(created)
    }

    async fn delete_data_volume(&self, _namespace: &str, name: &str) -> DriverResult<bool> {
        let removed = self.state.lock().unwrap().volumes.remove(name).is_some();
        // Let concurrent deletes of the same name interleave.
        tokio::task::yield_now().await;
        if removed {
            *self.deleted_data_volumes.lock().unwrap() += 1;
        }
        Ok(removed)
    }

    async fn list_instances(&self, namespace: &str) -> DriverResult<Vec<InstanceInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .iter()
            .filter(|i| i.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_hotplugged_volumes(&self, instance: &InstanceRef) -> DriverResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        state
            .hotplugged
            .get(&instance.to_string())
            .map(|disks| disks.iter().cloned().collect())
            .ok_or_else(|| DriverError::not_found("VirtualMachine", instance.to_string()))
    }

    async fn add_volume(&self, instance: &InstanceRef, attachment: &Attachment) -> DriverResult<()> {
        *self.add_volume_calls.lock().unwrap() += 1;
        let mut state = self.state.lock().unwrap();
        let disks = state
            .hotplugged
            .get_mut(&instance.to_string())
            .ok_or_else(|| DriverError::not_found("VirtualMachine", instance.to_string()))?;
        disks.insert(attachment.disk_name.clone());
        Ok(())
    }

    async fn remove_volume(&self, instance: &InstanceRef, disk_name: &str) -> DriverResult<()> {
        *self.remove_volume_calls.lock().unwrap() += 1;
        let mut state = self.state.lock().unwrap();
        let disks = state
            .hotplugged
            .get_mut(&instance.to_string())
            .ok_or_else(|| DriverError::not_found("VirtualMachine", instance.to_string()))?;
        disks.remove(disk_name);
        Ok(())
    }

    async fn get_snapshot(
        &self,
        _namespace: &str,
        name: &str,
    ) -> DriverResult<Option<RemoteSnapshot>> {
        Ok(self.state.lock().unwrap().snapshots.get(name).cloned())
    }

    async fn list_snapshots(
        &self,
        _namespace: &str,
        _label_selector: &str,
    ) -> DriverResult<Vec<RemoteSnapshot>> {
        Ok(self.state.lock().unwrap().snapshots.values().cloned().collect())
    }

    async fn create_snapshot(
        &self,
        namespace: &str,
        snapshot: &NewRemoteSnapshot,
    ) -> DriverResult<RemoteSnapshot> {
        let mut state = self.state.lock().unwrap();
        let size = state.volumes.get(&snapshot.source_volume).map(|dv| dv.size_bytes);
        let created = RemoteSnapshot {
            name: snapshot.name.clone(),
            namespace: namespace.to_string(),
            source_volume: snapshot.source_volume.clone(),
            snapshot_class: Some(snapshot.snapshot_class.clone()),
            ready_to_use: true,
            restore_size_bytes: size,
            creation_time: None,
        };
        state.snapshots.insert(snapshot.name.clone(), created.clone());
        Ok(created)
    }

    async fn delete_snapshot(&self, _namespace: &str, name: &str) -> DriverResult<bool> {
        Ok(self.state.lock().unwrap().snapshots.remove(name).is_some())
    }
}

/// Block devices visible to a fake guest.
#[derive(Default)]
pub struct FakeDevices {
    pub devices: Mutex<Vec<BlockDevice>>,
}

impl FakeDevices {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self { devices: Mutex::new(devices) }
    }
}

#[async_trait]
impl DeviceLister for FakeDevices {
    async fn list_block_devices(&self) -> DriverResult<Vec<BlockDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

/// Records mounts instead of performing them.
#[derive(Default)]
pub struct FakeMounter {
    pub mounts: Mutex<HashMap<String, (String, String, Vec<String>)>>,
}

impl FakeMounter {
    pub fn mount_of(&self, target: &str) -> Option<(String, String, Vec<String>)> {
        self.mounts.lock().unwrap().get(target).cloned()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> DriverResult<()> {
        self.mounts
            .lock()
            .unwrap()
            .insert(target.to_string(), (source.to_string(), fs_type.to_string(), options.to_vec()));
        Ok(())
    }

    async fn unmount(&self, target: &str) -> DriverResult<()> {
        self.mounts.lock().unwrap().remove(target);
        Ok(())
    }

    async fn is_mount_point(&self, target: &str) -> DriverResult<bool> {
        Ok(self.mounts.lock().unwrap().contains_key(target))
    }

    async fn path_exists(&self, path: &str) -> DriverResult<bool> {
        Ok(std::path::Path::new(path).exists())
    }
}

/// Formats devices by remembering which ones it was asked to format.
#[derive(Default)]
pub struct FakeFsMaker {
    pub formatted: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl FsMaker for FakeFsMaker {
    async fn make_filesystem(&self, device: &str, fs_type: &str) -> DriverResult<()> {
        self.formatted.lock().unwrap().push((device.to_string(), fs_type.to_string()));
        Ok(())
    }
}
