//! [`InfraCluster`] backed by the infra cluster's Kubernetes API.
//!
//! Core resources use the typed `k8s_openapi` structs; CDI, KubeVirt and
//! snapshot CRDs go through `DynamicObject`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::models::*;
use super::{ConnectivityProbe, InfraCluster};
use crate::error::{DriverError, DriverResult};
use crate::node_identity::InstanceRef;

const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";
const DEFAULT_SNAPSHOT_CLASS_ANNOTATION: &str = "snapshot.storage.kubernetes.io/is-default-class";
const KUBEVIRT_SUBRESOURCES: &str = "/apis/subresources.kubevirt.io/v1";

fn data_volume_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("cdi.kubevirt.io", "v1beta1", "DataVolume"),
        "datavolumes",
    )
}

fn virtual_machine_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine"),
        "virtualmachines",
    )
}

fn virtual_machine_instance_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachineInstance"),
        "virtualmachineinstances",
    )
}

fn volume_snapshot_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshot"),
        "volumesnapshots",
    )
}

fn volume_snapshot_class_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshotClass"),
        "volumesnapshotclasses",
    )
}

fn annotated_true(annotations: &std::collections::BTreeMap<String, String>, key: &str) -> bool {
    annotations.get(key).map(|v| v == "true").unwrap_or(false)
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Real infra cluster client.
#[derive(Clone)]
pub struct KubeInfraCluster {
    client: Client,
}

impl KubeInfraCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    async fn put_subresource(
        &self,
        instance: &InstanceRef,
        subresource: &str,
        body: Value,
    ) -> DriverResult<()> {
        let url = format!(
            "{}/namespaces/{}/virtualmachines/{}/{}",
            KUBEVIRT_SUBRESOURCES, instance.namespace, instance.name, subresource
        );
        let body = serde_json::to_vec(&body).map_err(|e| DriverError::Internal(e.to_string()))?;
        let request = http::Request::put(url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|e| DriverError::Internal(format!("invalid {} request: {}", subresource, e)))?;

        self.client
            .request_text(request)
            .await
            .map_err(|e| DriverError::kube(format!("{} on VM {}", subresource, instance), e))?;
        Ok(())
    }

    fn to_remote_volume(obj: DynamicObject) -> DriverResult<RemoteVolume> {
        // CDI accepts both the storage API and the older pvc API.
        let spec = obj
            .data
            .get("spec")
            .and_then(|spec| spec.get("storage").or_else(|| spec.get("pvc")))
            .cloned()
            .unwrap_or(Value::Null);
        let source = obj.data.pointer("/spec/source").cloned().unwrap_or(Value::Null);

        let source = if let Some(name) = str_at(&source, "/snapshot/name") {
            VolumeSource::Snapshot {
                namespace: str_at(&source, "/snapshot/namespace").unwrap_or_default().to_string(),
                name: name.to_string(),
            }
        } else if let Some(name) = str_at(&source, "/pvc/name") {
            VolumeSource::Claim {
                namespace: str_at(&source, "/pvc/namespace").unwrap_or_default().to_string(),
                name: name.to_string(),
            }
        } else {
            VolumeSource::Blank
        };

        let size_bytes = match str_at(&spec, "/resources/requests/storage") {
            Some(quantity) => parse_quantity(quantity).ok_or_else(|| {
                DriverError::Internal(format!(
                    "DataVolume {} requests unparsable storage quantity {:?}",
                    obj.name_any(),
                    quantity
                ))
            })?,
            None => 0,
        };

        Ok(RemoteVolume {
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            uid: obj.uid().unwrap_or_default(),
            storage_class: str_at(&spec, "/storageClassName").map(str::to_string),
            size_bytes,
            labels: obj.labels().clone(),
            source,
        })
    }

    fn to_remote_snapshot(obj: DynamicObject) -> RemoteSnapshot {
        let creation_time = str_at(&obj.data, "/status/creationTime")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        RemoteSnapshot {
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            source_volume: str_at(&obj.data, "/spec/source/persistentVolumeClaimName")
                .unwrap_or_default()
                .to_string(),
            snapshot_class: str_at(&obj.data, "/spec/volumeSnapshotClassName").map(str::to_string),
            ready_to_use: obj
                .data
                .pointer("/status/readyToUse")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            restore_size_bytes: str_at(&obj.data, "/status/restoreSize").and_then(parse_quantity),
            creation_time,
        }
    }

    fn to_snapshot_class(obj: DynamicObject) -> SnapshotClassInfo {
        SnapshotClassInfo {
            is_default: annotated_true(obj.annotations(), DEFAULT_SNAPSHOT_CLASS_ANNOTATION),
            driver: str_at(&obj.data, "/driver").unwrap_or_default().to_string(),
            name: obj.name_any(),
        }
    }

    fn to_storage_class(sc: StorageClass) -> StorageClassInfo {
        StorageClassInfo {
            is_default: annotated_true(sc.annotations(), DEFAULT_STORAGE_CLASS_ANNOTATION),
            name: sc.name_any(),
            provisioner: sc.provisioner,
        }
    }

    fn data_volume_body(volume: &NewRemoteVolume) -> Value {
        let source = match &volume.source {
            VolumeSource::Blank => json!({ "blank": {} }),
            VolumeSource::Snapshot { namespace, name } => {
                json!({ "snapshot": { "namespace": namespace, "name": name } })
            }
            VolumeSource::Claim { namespace, name } => {
                json!({ "pvc": { "namespace": namespace, "name": name } })
            }
        };

        let mut storage = json!({
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": volume.size_bytes.to_string() } },
        });
        if let Some(storage_class) = &volume.storage_class {
            storage["storageClassName"] = json!(storage_class);
        }

        json!({ "spec": { "source": source, "storage": storage } })
    }
}

#[async_trait]
impl InfraCluster for KubeInfraCluster {
    async fn get_storage_class(&self, name: &str) -> DriverResult<Option<StorageClassInfo>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let sc = api
            .get_opt(name)
            .await
            .map_err(|e| DriverError::kube(format!("get StorageClass {}", name), e))?;
        Ok(sc.map(Self::to_storage_class))
    }

    async fn list_storage_classes(&self) -> DriverResult<Vec<StorageClassInfo>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DriverError::kube("list StorageClasses", e))?;
        Ok(list.items.into_iter().map(Self::to_storage_class).collect())
    }

    async fn get_snapshot_class(&self, name: &str) -> DriverResult<Option<SnapshotClassInfo>> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &volume_snapshot_class_resource());
        let vsc = api
            .get_opt(name)
            .await
            .map_err(|e| DriverError::kube(format!("get VolumeSnapshotClass {}", name), e))?;
        Ok(vsc.map(Self::to_snapshot_class))
    }

    async fn list_snapshot_classes(&self) -> DriverResult<Vec<SnapshotClassInfo>> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &volume_snapshot_class_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DriverError::kube("list VolumeSnapshotClasses", e))?;
        Ok(list.items.into_iter().map(Self::to_snapshot_class).collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> DriverResult<Option<ClaimInfo>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = api.get_opt(name).await.map_err(|e| {
            DriverError::kube(format!("get PersistentVolumeClaim {}/{}", namespace, name), e)
        })?;

        Ok(pvc.map(|pvc| {
            let spec = pvc.spec.clone().unwrap_or_default();
            ClaimInfo {
                namespace: namespace.to_string(),
                name: pvc.name_any(),
                volume_name: spec.volume_name.filter(|v| !v.is_empty()),
                storage_class: spec.storage_class_name.filter(|v| !v.is_empty()),
            }
        }))
    }

    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> DriverResult<Option<PersistentVolumeInfo>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let pv = api
            .get_opt(name)
            .await
            .map_err(|e| DriverError::kube(format!("get PersistentVolume {}", name), e))?;

        Ok(pv.map(|pv| PersistentVolumeInfo {
            storage_class: pv
                .spec
                .as_ref()
                .and_then(|spec| spec.storage_class_name.clone())
                .filter(|v| !v.is_empty()),
            name: pv.name_any(),
        }))
    }

    async fn get_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> DriverResult<Option<RemoteVolume>> {
        let dv = self
            .dynamic(namespace, &data_volume_resource())
            .get_opt(name)
            .await
            .map_err(|e| DriverError::kube(format!("get DataVolume {}/{}", namespace, name), e))?;
        dv.map(Self::to_remote_volume).transpose()
    }

    async fn create_data_volume(
        &self,
        namespace: &str,
        volume: &NewRemoteVolume,
    ) -> DriverResult<RemoteVolume> {
        let resource = data_volume_resource();
        let mut obj = DynamicObject::new(&volume.name, &resource)
            .within(namespace)
            .data(Self::data_volume_body(volume));
        obj.metadata.labels = Some(volume.labels.clone());

        let created = self
            .dynamic(namespace, &resource)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| {
                DriverError::kube(format!("create DataVolume {}/{}", namespace, volume.name), e)
            })?;

        info!(namespace = %namespace, name = %volume.name, uid = ?created.uid(), "created DataVolume");
        Self::to_remote_volume(created)
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> DriverResult<bool> {
        let api = self.dynamic(namespace, &data_volume_resource());
        let op = format!("delete DataVolume {}/{}", namespace, name);

        if api.get_opt(name).await.map_err(|e| DriverError::kube(&op, e))?.is_none() {
            debug!(namespace = %namespace, name = %name, "DataVolume already gone");
            return Ok(false);
        }
        if let Err(e) = api.delete(name, &DeleteParams::default()).await {
            // Lost a race with another delete: the outcome is what was asked for.
            if api.get_opt(name).await.map_err(|e| DriverError::kube(&op, e))?.is_none() {
                return Ok(true);
            }
            return Err(DriverError::kube(op, e));
        }

        info!(namespace = %namespace, name = %name, "deleted DataVolume");
        Ok(true)
    }

    async fn list_instances(&self, namespace: &str) -> DriverResult<Vec<InstanceInfo>> {
        let list = self
            .dynamic(namespace, &virtual_machine_instance_resource())
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                DriverError::kube(format!("list VirtualMachineInstances in {}", namespace), e)
            })?;

        Ok(list
            .items
            .into_iter()
            .map(|vmi| InstanceInfo {
                hardware_id: str_at(&vmi.data, "/spec/domain/firmware/uuid").map(str::to_string),
                namespace: vmi.namespace().unwrap_or_else(|| namespace.to_string()),
                name: vmi.name_any(),
            })
            .collect())
    }

    async fn list_hotplugged_volumes(&self, instance: &InstanceRef) -> DriverResult<Vec<String>> {
        let vm = self
            .dynamic(&instance.namespace, &virtual_machine_resource())
            .get_opt(&instance.name)
            .await
            .map_err(|e| DriverError::kube(format!("get VirtualMachine {}", instance), e))?
            .ok_or_else(|| DriverError::not_found("VirtualMachine", instance.to_string()))?;

        let mut names: Vec<String> = vm
            .data
            .pointer("/spec/template/spec/volumes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|v| str_at(v, "/name").map(str::to_string))
            .collect();

        // Requests not yet reconciled into the VM spec.
        let requests =
            vm.data.pointer("/status/volumeRequests").and_then(Value::as_array).cloned();
        for request in requests.unwrap_or_default() {
            if let Some(name) = str_at(&request, "/addVolumeOptions/name") {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
            if let Some(name) = str_at(&request, "/removeVolumeOptions/name") {
                names.retain(|n| n != name);
            }
        }

        Ok(names)
    }

    async fn add_volume(&self, instance: &InstanceRef, attachment: &Attachment) -> DriverResult<()> {
        let body = json!({
            "name": attachment.disk_name,
            "disk": {
                "name": attachment.disk_name,
                "serial": attachment.serial,
                "disk": { "bus": attachment.bus.as_str() },
            },
            "volumeSource": {
                "dataVolume": { "name": attachment.volume_name, "hotpluggable": true },
            },
        });

        self.put_subresource(instance, "addvolume", body).await?;
        info!(vm = %instance, disk = %attachment.disk_name, bus = %attachment.bus, "hotplugged volume");
        Ok(())
    }

    async fn remove_volume(&self, instance: &InstanceRef, disk_name: &str) -> DriverResult<()> {
        self.put_subresource(instance, "removevolume", json!({ "name": disk_name })).await?;
        info!(vm = %instance, disk = %disk_name, "unplugged volume");
        Ok(())
    }

    async fn get_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> DriverResult<Option<RemoteSnapshot>> {
        let vs = self
            .dynamic(namespace, &volume_snapshot_resource())
            .get_opt(name)
            .await
            .map_err(|e| {
                DriverError::kube(format!("get VolumeSnapshot {}/{}", namespace, name), e)
            })?;
        Ok(vs.map(Self::to_remote_snapshot))
    }

    async fn list_snapshots(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> DriverResult<Vec<RemoteSnapshot>> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        let list = self
            .dynamic(namespace, &volume_snapshot_resource())
            .list(&params)
            .await
            .map_err(|e| DriverError::kube(format!("list VolumeSnapshots in {}", namespace), e))?;
        Ok(list.items.into_iter().map(Self::to_remote_snapshot).collect())
    }

    async fn create_snapshot(
        &self,
        namespace: &str,
        snapshot: &NewRemoteSnapshot,
    ) -> DriverResult<RemoteSnapshot> {
        let resource = volume_snapshot_resource();
        let mut obj = DynamicObject::new(&snapshot.name, &resource).within(namespace).data(json!({
            "spec": {
                "source": { "persistentVolumeClaimName": snapshot.source_volume },
                "volumeSnapshotClassName": snapshot.snapshot_class,
            }
        }));
        obj.metadata.labels = Some(snapshot.labels.clone());

        let created = self
            .dynamic(namespace, &resource)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| {
                DriverError::kube(format!("create VolumeSnapshot {}/{}", namespace, snapshot.name), e)
            })?;

        info!(
            namespace = %namespace,
            name = %snapshot.name,
            source = %snapshot.source_volume,
            class = %snapshot.snapshot_class,
            "created VolumeSnapshot"
        );
        Ok(Self::to_remote_snapshot(created))
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> DriverResult<bool> {
        let api = self.dynamic(namespace, &volume_snapshot_resource());
        let op = format!("delete VolumeSnapshot {}/{}", namespace, name);

        if api.get_opt(name).await.map_err(|e| DriverError::kube(&op, e))?.is_none() {
            return Ok(false);
        }
        if let Err(e) = api.delete(name, &DeleteParams::default()).await {
            if api.get_opt(name).await.map_err(|e| DriverError::kube(&op, e))?.is_none() {
                return Ok(true);
            }
            return Err(DriverError::kube(op, e));
        }

        info!(namespace = %namespace, name = %name, "deleted VolumeSnapshot");
        Ok(true)
    }
}

/// Probes an API server by asking for its version.
#[derive(Clone)]
pub struct ApiServerProbe {
    client: Client,
}

impl ApiServerProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConnectivityProbe for ApiServerProbe {
    async fn check(&self) -> DriverResult<()> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| DriverError::kube("query api server version", e))?;
        debug!(version = %version.git_version, "api server reachable");
        Ok(())
    }
}
