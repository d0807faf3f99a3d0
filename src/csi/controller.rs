use crate::csi::metrics::{CsiMetrics, observe};
use crate::csi::proto::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerModifyVolumeRequest,
    ControllerModifyVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest, DeleteSnapshotResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest, GetCapacityResponse,
    ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest, ListVolumesResponse,
    Snapshot, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
    VolumeCapability, VolumeContentSource, controller_server::Controller, list_snapshots_response,
    validate_volume_capabilities_response::Confirmed, volume_capability::access_mode::Mode,
    volume_content_source,
};
use crate::error::{DriverError, DriverResult};
use crate::infra::{
    Attachment, Bus, InfraCluster, NewRemoteSnapshot, NewRemoteVolume, RemoteSnapshot,
    VolumeSource, disk_name, resolve,
};
use crate::policy::StorageClassEnforcement;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// StorageClass parameter naming the infra storage class.
pub const PARAM_INFRA_STORAGE_CLASS: &str = "infraStorageClassName";
/// StorageClass parameter selecting the disk bus.
pub const PARAM_BUS: &str = "bus";
/// VolumeSnapshotClass parameter naming the infra snapshot class.
pub const PARAM_INFRA_SNAPSHOT_CLASS: &str = "infraSnapshotClassName";

pub const CONTEXT_BUS: &str = "bus";
pub const CONTEXT_SERIAL: &str = "serial";

/// Where and how the controller manages infra resources.
#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    /// Namespace holding the DataVolumes and VolumeSnapshots.
    pub infra_namespace: String,
    /// Labels stamped on every infra object this driver creates.
    pub infra_cluster_labels: BTreeMap<String, String>,
    pub enforcement: StorageClassEnforcement,
}

impl ControllerSettings {
    fn label_selector(&self) -> String {
        self.infra_cluster_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Controller Service implementation
///
/// Handles volume lifecycle against the infra cluster: create, delete,
/// hotplug, snapshot.
#[derive(Clone)]
pub struct ControllerService {
    infra: Arc<dyn InfraCluster>,
    settings: Arc<ControllerSettings>,
    metrics: Option<Arc<CsiMetrics>>,
}

fn is_single_node(mode: i32) -> bool {
    matches!(
        Mode::try_from(mode),
        Ok(Mode::SingleNodeWriter
            | Mode::SingleNodeReaderOnly
            | Mode::SingleNodeSingleWriter
            | Mode::SingleNodeMultiWriter)
    )
}

/// Check a capability list, returning the reason it is unsupported.
fn unsupported_capability(capabilities: &[VolumeCapability]) -> Option<String> {
    if capabilities.is_empty() {
        return Some("volume capabilities are required".to_string());
    }
    for capability in capabilities {
        if capability.access_type.is_none() {
            return Some("volume capability must be either block or mount".to_string());
        }
        let mode = capability.access_mode.as_ref().map(|m| m.mode).unwrap_or_default();
        if !is_single_node(mode) {
            return Some(format!(
                "access mode {:?} is not supported, only single node access is",
                Mode::try_from(mode).unwrap_or(Mode::Unknown)
            ));
        }
    }
    None
}

fn timestamp(snapshot: &RemoteSnapshot) -> prost_types::Timestamp {
    let time = snapshot.creation_time.unwrap_or_else(Utc::now);
    prost_types::Timestamp { seconds: time.timestamp(), nanos: time.timestamp_subsec_nanos() as i32 }
}

fn to_csi_snapshot(snapshot: &RemoteSnapshot) -> Snapshot {
    Snapshot {
        size_bytes: snapshot.restore_size_bytes.unwrap_or_default(),
        snapshot_id: snapshot.name.clone(),
        source_volume_id: snapshot.source_volume.clone(),
        creation_time: Some(timestamp(snapshot)),
        ready_to_use: snapshot.ready_to_use,
        group_snapshot_id: String::new(),
    }
}

impl ControllerService {
    pub fn new(infra: Arc<dyn InfraCluster>, settings: ControllerSettings) -> Self {
        Self { infra, settings: Arc::new(settings), metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<CsiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn namespace(&self) -> &str {
        &self.settings.infra_namespace
    }

    fn content_source(&self, source: Option<&VolumeContentSource>) -> DriverResult<VolumeSource> {
        let namespace = self.namespace().to_string();
        Ok(match source.and_then(|s| s.r#type.as_ref()) {
            None => VolumeSource::Blank,
            Some(volume_content_source::Type::Snapshot(s)) if !s.snapshot_id.is_empty() => {
                VolumeSource::Snapshot { namespace, name: s.snapshot_id.clone() }
            }
            Some(volume_content_source::Type::Volume(v)) if !v.volume_id.is_empty() => {
                VolumeSource::Claim { namespace, name: v.volume_id.clone() }
            }
            Some(_) => {
                return Err(DriverError::InvalidArgument(
                    "volume content source must name a snapshot or a volume".to_string(),
                ));
            }
        })
    }

    async fn check_source_exists(&self, source: &VolumeSource) -> DriverResult<()> {
        match source {
            VolumeSource::Blank => Ok(()),
            VolumeSource::Snapshot { namespace, name } => {
                self.infra
                    .get_snapshot(namespace, name)
                    .await?
                    .ok_or_else(|| DriverError::not_found("VolumeSnapshot", name.clone()))?;
                Ok(())
            }
            VolumeSource::Claim { namespace, name } => {
                self.infra
                    .get_data_volume(namespace, name)
                    .await?
                    .ok_or_else(|| DriverError::not_found("DataVolume", name.clone()))?;
                Ok(())
            }
        }
    }

    async fn create(&self, req: CreateVolumeRequest) -> DriverResult<CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(DriverError::InvalidArgument("volume name is required".to_string()));
        }
        if let Some(reason) = unsupported_capability(&req.volume_capabilities) {
            return Err(DriverError::InvalidArgument(reason));
        }

        let size_bytes = req
            .capacity_range
            .as_ref()
            .map(|r| if r.required_bytes > 0 { r.required_bytes } else { r.limit_bytes })
            .unwrap_or_default();
        if size_bytes <= 0 {
            return Err(DriverError::InvalidArgument(format!(
                "volume {} needs a positive capacity",
                req.name
            )));
        }

        let bus: Bus = match req.parameters.get(PARAM_BUS).filter(|b| !b.is_empty()) {
            Some(bus) => bus.parse()?,
            None => Bus::default(),
        };
        let storage_class =
            req.parameters.get(PARAM_INFRA_STORAGE_CLASS).cloned().unwrap_or_default();

        // Policy first: a denied request must not touch the infra cluster.
        resolve::enforce_storage_class(
            self.infra.as_ref(),
            &self.settings.enforcement,
            &storage_class,
        )
        .await?;

        let source = self.content_source(req.volume_content_source.as_ref())?;
        self.check_source_exists(&source).await?;

        let desired = NewRemoteVolume {
            name: req.name.clone(),
            size_bytes,
            storage_class: Some(storage_class).filter(|sc| !sc.is_empty()),
            labels: self.settings.infra_cluster_labels.clone(),
            source,
        };
        let volume = resolve::ensure_remote_volume(self.infra.as_ref(), self.namespace(), &desired)
            .await?;

        info!(volume = %volume.name, uid = %volume.uid, size = size_bytes, bus = %bus, "volume ready");

        let volume_context = HashMap::from([
            (CONTEXT_BUS.to_string(), bus.to_string()),
            (CONTEXT_SERIAL.to_string(), volume.uid.clone()),
        ]);
        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: size_bytes,
                volume_id: volume.name,
                volume_context,
                content_source: req.volume_content_source,
                accessible_topology: vec![],
            }),
        })
    }

    async fn publish(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> DriverResult<ControllerPublishVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument("volume id is required".to_string()));
        }
        if req.volume_capability.is_none() {
            return Err(DriverError::InvalidArgument("volume capability is required".to_string()));
        }
        let instance =
            resolve::resolve_instance(self.infra.as_ref(), self.namespace(), &req.node_id).await?;

        let volume = self
            .infra
            .get_data_volume(self.namespace(), &req.volume_id)
            .await?
            .ok_or_else(|| DriverError::not_found("DataVolume", req.volume_id.clone()))?;

        let serial = req
            .volume_context
            .get(CONTEXT_SERIAL)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or(volume.uid);
        let bus = match req.volume_context.get(CONTEXT_BUS).filter(|b| !b.is_empty()) {
            Some(bus) => bus.parse()?,
            None => Bus::default(),
        };

        let attachment = Attachment {
            disk_name: disk_name(&req.volume_id),
            volume_name: req.volume_id.clone(),
            serial,
            bus,
        };
        resolve::attach_volume(self.infra.as_ref(), &instance, &attachment).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_hotplug("attach");
        }

        Ok(ControllerPublishVolumeResponse { publish_context: HashMap::new() })
    }

    async fn unpublish(&self, req: ControllerUnpublishVolumeRequest) -> DriverResult<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument("volume id is required".to_string()));
        }
        let instance =
            match resolve::resolve_instance(self.infra.as_ref(), self.namespace(), &req.node_id)
                .await
            {
                Ok(instance) => instance,
                // No such VM left, so nothing is attached to it.
                Err(DriverError::NotFound { .. }) => {
                    debug!(node = %req.node_id, "node not found, volume treated as detached");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

        resolve::detach_volume(self.infra.as_ref(), &instance, &disk_name(&req.volume_id))
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_hotplug("detach");
        }
        Ok(())
    }

    async fn validate(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> DriverResult<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument("volume id is required".to_string()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume capabilities are required".to_string(),
            ));
        }
        self.infra
            .get_data_volume(self.namespace(), &req.volume_id)
            .await?
            .ok_or_else(|| DriverError::not_found("DataVolume", req.volume_id.clone()))?;

        if let Some(reason) = unsupported_capability(&req.volume_capabilities) {
            return Ok(ValidateVolumeCapabilitiesResponse { confirmed: None, message: reason });
        }
        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        })
    }

    async fn snapshot(&self, req: CreateSnapshotRequest) -> DriverResult<CreateSnapshotResponse> {
        if req.name.is_empty() {
            return Err(DriverError::InvalidArgument("snapshot name is required".to_string()));
        }
        if req.source_volume_id.is_empty() {
            return Err(DriverError::InvalidArgument("source volume id is required".to_string()));
        }

        if let Some(existing) = self.infra.get_snapshot(self.namespace(), &req.name).await? {
            if existing.source_volume != req.source_volume_id {
                return Err(DriverError::already_exists(
                    "VolumeSnapshot",
                    &req.name,
                    format!("it was taken from volume {}", existing.source_volume),
                ));
            }
            debug!(snapshot = %req.name, "snapshot already exists");
            return Ok(CreateSnapshotResponse { snapshot: Some(to_csi_snapshot(&existing)) });
        }

        let storage_class = resolve::storage_class_for_claim(
            self.infra.as_ref(),
            self.namespace(),
            &req.source_volume_id,
        )
        .await?;
        resolve::enforce_storage_class(
            self.infra.as_ref(),
            &self.settings.enforcement,
            &storage_class,
        )
        .await?;

        let requested = req.parameters.get(PARAM_INFRA_SNAPSHOT_CLASS).cloned().unwrap_or_default();
        let binding = resolve::choose_snapshot_class(
            self.infra.as_ref(),
            &self.settings.enforcement,
            &storage_class,
            &requested,
        )
        .await?;

        let snapshot = self
            .infra
            .create_snapshot(
                self.namespace(),
                &NewRemoteSnapshot {
                    name: req.name.clone(),
                    source_volume: req.source_volume_id.clone(),
                    snapshot_class: binding.snapshot_class,
                    labels: self.settings.infra_cluster_labels.clone(),
                },
            )
            .await?;

        Ok(CreateSnapshotResponse { snapshot: Some(to_csi_snapshot(&snapshot)) })
    }

    async fn list_snapshot_entries(
        &self,
        req: &ListSnapshotsRequest,
    ) -> DriverResult<Vec<RemoteSnapshot>> {
        let wanted_source =
            |s: &RemoteSnapshot| req.source_volume_id.is_empty() || s.source_volume == req.source_volume_id;

        if !req.snapshot_id.is_empty() {
            let found = self.infra.get_snapshot(self.namespace(), &req.snapshot_id).await?;
            return Ok(found.into_iter().filter(|s| wanted_source(s)).collect());
        }

        let mut snapshots =
            self.infra.list_snapshots(self.namespace(), &self.settings.label_selector()).await?;
        snapshots.retain(|s| wanted_source(s));
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}

/// Apply `max_entries`/`starting_token` paging, the token being an offset.
fn paginate<T>(
    items: Vec<T>,
    max_entries: i32,
    starting_token: &str,
) -> Result<(Vec<T>, String), Status> {
    let start = if starting_token.is_empty() {
        0
    } else {
        starting_token
            .parse::<usize>()
            .ok()
            .filter(|start| *start <= items.len())
            .ok_or_else(|| Status::aborted(format!("invalid starting token {}", starting_token)))?
    };
    let total = items.len();
    let page: Vec<T> = if max_entries > 0 {
        items.into_iter().skip(start).take(max_entries as usize).collect()
    } else {
        items.into_iter().skip(start).collect()
    };
    let end = start + page.len();
    let next = if end < total { end.to_string() } else { String::new() };
    Ok((page, next))
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "CreateVolume", async {
            Ok(Response::new(self.create(req).await?))
        })
        .await
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "DeleteVolume", async {
            if req.volume_id.is_empty() {
                return Err(Status::invalid_argument("volume id is required"));
            }
            resolve::delete_remote_volume(self.infra.as_ref(), self.namespace(), &req.volume_id)
                .await?;
            Ok(Response::new(DeleteVolumeResponse {}))
        })
        .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "ControllerPublishVolume", async {
            Ok(Response::new(self.publish(req).await?))
        })
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "ControllerUnpublishVolume", async {
            self.unpublish(req).await?;
            Ok(Response::new(ControllerUnpublishVolumeResponse {}))
        })
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "ValidateVolumeCapabilities", async {
            Ok(Response::new(self.validate(req).await?))
        })
        .await
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        Err(DriverError::Unimplemented("ListVolumes").into())
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(DriverError::Unimplemented("GetCapacity").into())
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        use crate::csi::proto::controller_service_capability::{Rpc, rpc::Type};

        let capabilities = vec![
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
            Type::CloneVolume,
        ]
        .into_iter()
        .map(|t| ControllerServiceCapability {
            r#type: Some(crate::csi::proto::controller_service_capability::Type::Rpc(Rpc {
                r#type: t as i32,
            })),
        })
        .collect();

        Ok(Response::new(ControllerGetCapabilitiesResponse { capabilities }))
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "CreateSnapshot", async {
            Ok(Response::new(self.snapshot(req).await?))
        })
        .await
    }

    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "DeleteSnapshot", async {
            if req.snapshot_id.is_empty() {
                return Err(Status::invalid_argument("snapshot id is required"));
            }
            if !self.infra.delete_snapshot(self.namespace(), &req.snapshot_id).await? {
                debug!(snapshot = %req.snapshot_id, "snapshot not found, nothing to delete");
            }
            Ok(Response::new(DeleteSnapshotResponse {}))
        })
        .await
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "ListSnapshots", async {
            if req.max_entries < 0 {
                return Err(Status::invalid_argument(format!(
                    "max entries must not be negative, got {}",
                    req.max_entries
                )));
            }
            let snapshots = self.list_snapshot_entries(&req).await?;
            let (page, next_token) = paginate(snapshots, req.max_entries, &req.starting_token)?;
            let entries = page
                .iter()
                .map(|s| list_snapshots_response::Entry { snapshot: Some(to_csi_snapshot(s)) })
                .collect();
            Ok(Response::new(ListSnapshotsResponse { entries, next_token }))
        })
        .await
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(DriverError::Unimplemented("ControllerExpandVolume").into())
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        Err(DriverError::Unimplemented("ControllerGetVolume").into())
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<ControllerModifyVolumeRequest>,
    ) -> Result<Response<ControllerModifyVolumeResponse>, Status> {
        Err(DriverError::Unimplemented("ControllerModifyVolume").into())
    }
}
