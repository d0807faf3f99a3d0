use crate::csi::controller::CONTEXT_SERIAL;
use crate::csi::metrics::{CsiMetrics, observe};
use crate::csi::proto::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, VolumeCapability, VolumeUsage, node_server::Node,
    volume_capability::AccessType, volume_usage::Unit,
};
use crate::device::{self, DeviceLister, FsMaker, Mounter};
use crate::error::{DriverError, DriverResult};
use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncSeekExt;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Node Service implementation
///
/// Finds the hotplugged disk by serial, formats it once and mounts it for
/// pods.
#[derive(Clone)]
pub struct NodeService {
    node_id: String,
    devices: Arc<dyn DeviceLister>,
    mounter: Arc<dyn Mounter>,
    fs_maker: Arc<dyn FsMaker>,
    metrics: Option<Arc<CsiMetrics>>,
}

fn required<'a>(value: &'a str, what: &str) -> DriverResult<&'a str> {
    if value.is_empty() {
        return Err(DriverError::InvalidArgument(format!("{} is required", what)));
    }
    Ok(value)
}

fn access_type(capability: Option<&VolumeCapability>) -> DriverResult<&AccessType> {
    capability.and_then(|c| c.access_type.as_ref()).ok_or_else(|| {
        DriverError::InvalidArgument("volume capability must be either block or mount".to_string())
    })
}

fn serial(context: &HashMap<String, String>) -> &str {
    context.get(CONTEXT_SERIAL).map(String::as_str).unwrap_or_default()
}

impl NodeService {
    pub fn new(
        node_id: String,
        devices: Arc<dyn DeviceLister>,
        mounter: Arc<dyn Mounter>,
        fs_maker: Arc<dyn FsMaker>,
    ) -> Self {
        Self { node_id, devices, mounter, fs_maker, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<CsiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn stage(&self, req: NodeStageVolumeRequest) -> DriverResult<()> {
        required(&req.volume_id, "volume id")?;
        required(&req.staging_target_path, "staging target path")?;
        let access = access_type(req.volume_capability.as_ref())?;

        // Reject the filesystem before looking at any device.
        let fs_type = match access {
            AccessType::Mount(mount) => Some(device::filesystem_for(&mount.fs_type)?),
            AccessType::Block(_) => None,
        };

        let device = device::resolve_device(self.devices.as_ref(), serial(&req.volume_context)).await?;

        match fs_type {
            Some(_) if device.has_filesystem() => {
                debug!(
                    volume = %req.volume_id,
                    device = %device.path,
                    fs = ?device.fs_type,
                    "device already has a filesystem"
                );
            }
            Some(fs_type) => {
                self.fs_maker.make_filesystem(&device.path, fs_type).await?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_format(fs_type);
                }
            }
            None => {}
        }

        info!(volume = %req.volume_id, device = %device.path, "volume staged");
        Ok(())
    }

    async fn publish(&self, req: NodePublishVolumeRequest) -> DriverResult<()> {
        required(&req.volume_id, "volume id")?;
        let target = required(&req.target_path, "target path")?;
        let access = access_type(req.volume_capability.as_ref())?;

        let device = device::resolve_device(self.devices.as_ref(), serial(&req.volume_context)).await?;

        if self.mounter.is_mount_point(target).await? {
            debug!(volume = %req.volume_id, target = %target, "already published");
            return Ok(());
        }

        let (fs_type, mut options) = match access {
            AccessType::Block(_) => {
                if let Some(parent) = Path::new(target).parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| DriverError::io(format!("create {}", parent.display()), e))?;
                }
                if !self.mounter.path_exists(target).await? {
                    tokio::fs::File::create(target)
                        .await
                        .map_err(|e| DriverError::io(format!("create {}", target), e))?;
                }
                (String::new(), vec!["bind".to_string()])
            }
            AccessType::Mount(mount) => {
                tokio::fs::create_dir_all(target)
                    .await
                    .map_err(|e| DriverError::io(format!("create {}", target), e))?;
                let fs_type = match device.fs_type.as_deref().filter(|fs| !fs.is_empty()) {
                    Some(found) => found.to_string(),
                    None => device::filesystem_for(&mount.fs_type)?.to_string(),
                };
                (fs_type, mount.mount_flags.clone())
            }
        };
        if req.readonly {
            options.push("ro".to_string());
        }

        self.mounter.mount(&device.path, target, &fs_type, &options).await?;
        info!(volume = %req.volume_id, device = %device.path, target = %target, "volume published");
        Ok(())
    }

    async fn unpublish(&self, req: NodeUnpublishVolumeRequest) -> DriverResult<()> {
        required(&req.volume_id, "volume id")?;
        let target = required(&req.target_path, "target path")?;

        if self.mounter.is_mount_point(target).await? {
            self.mounter.unmount(target).await?;
        } else {
            debug!(volume = %req.volume_id, target = %target, "target not mounted");
        }

        if self.mounter.path_exists(target).await? {
            let metadata = tokio::fs::metadata(target)
                .await
                .map_err(|e| DriverError::io(format!("stat {}", target), e))?;
            let removed = if metadata.is_dir() {
                tokio::fs::remove_dir(target).await
            } else {
                tokio::fs::remove_file(target).await
            };
            removed.map_err(|e| DriverError::io(format!("remove {}", target), e))?;
        }
        Ok(())
    }

    async fn stats(&self, req: NodeGetVolumeStatsRequest) -> DriverResult<NodeGetVolumeStatsResponse> {
        required(&req.volume_id, "volume id")?;
        let path = required(&req.volume_path, "volume path")?;

        if !self.mounter.path_exists(path).await? {
            return Err(DriverError::not_found("volume path", path));
        }
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DriverError::io(format!("stat {}", path), e))?;

        if metadata.file_type().is_block_device() {
            let mut file = tokio::fs::File::open(path)
                .await
                .map_err(|e| DriverError::io(format!("open {}", path), e))?;
            let size = file
                .seek(std::io::SeekFrom::End(0))
                .await
                .map_err(|e| DriverError::io(format!("size {}", path), e))?;
            return Ok(NodeGetVolumeStatsResponse {
                usage: vec![VolumeUsage {
                    total: size as i64,
                    available: 0,
                    used: 0,
                    unit: Unit::Bytes as i32,
                }],
                volume_condition: None,
            });
        }

        let stats = nix::sys::statvfs::statvfs(path)
            .map_err(|e| DriverError::io(format!("statvfs {}", path), e.into()))?;

        let block_size = stats.fragment_size() as i64;
        let total_bytes = stats.blocks() as i64 * block_size;
        let available_bytes = stats.blocks_available() as i64 * block_size;
        let used_bytes = total_bytes - stats.blocks_free() as i64 * block_size;

        let total_inodes = stats.files() as i64;
        let available_inodes = stats.files_available() as i64;
        let used_inodes = total_inodes - stats.files_free() as i64;

        Ok(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    total: total_bytes,
                    available: available_bytes,
                    used: used_bytes,
                    unit: Unit::Bytes as i32,
                },
                VolumeUsage {
                    total: total_inodes,
                    available: available_inodes,
                    used: used_inodes,
                    unit: Unit::Inodes as i32,
                },
            ],
            volume_condition: None,
        })
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "NodeStageVolume", async {
            self.stage(req).await?;
            Ok(Response::new(NodeStageVolumeResponse {}))
        })
        .await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        // The filesystem stays on the device so a later stage finds it again.
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "NodeUnstageVolume", async {
            required(&req.volume_id, "volume id")?;
            required(&req.staging_target_path, "staging target path")?;
            Ok(Response::new(NodeUnstageVolumeResponse {}))
        })
        .await
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "NodePublishVolume", async {
            self.publish(req).await?;
            Ok(Response::new(NodePublishVolumeResponse {}))
        })
        .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "NodeUnpublishVolume", async {
            self.unpublish(req).await?;
            Ok(Response::new(NodeUnpublishVolumeResponse {}))
        })
        .await
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        observe(self.metrics.as_deref(), "NodeGetVolumeStats", async {
            Ok(Response::new(self.stats(req).await?))
        })
        .await
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(DriverError::Unimplemented("NodeExpandVolume").into())
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        use crate::csi::proto::node_service_capability::{Rpc, rpc::Type};

        let capabilities = vec![Type::StageUnstageVolume, Type::GetVolumeStats]
            .into_iter()
            .map(|t| crate::csi::proto::NodeServiceCapability {
                r#type: Some(crate::csi::proto::node_service_capability::Type::Rpc(Rpc {
                    r#type: t as i32,
                })),
            })
            .collect();

        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::proto::volume_capability::{self, BlockVolume, MountVolume};
    use crate::device::{BlockDevice, MockDeviceLister, MockFsMaker, MockMounter};

    fn mount_capability(fs_type: &str) -> Option<VolumeCapability> {
        Some(VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: fs_type.into(),
                ..Default::default()
            })),
            access_mode: Some(volume_capability::AccessMode { mode: 1 }),
        })
    }

    fn lister(devices: Vec<BlockDevice>) -> MockDeviceLister {
        let mut lister = MockDeviceLister::new();
        lister.expect_list_block_devices().returning(move || Ok(devices.clone()));
        lister
    }

    fn stage_request(capability: Option<VolumeCapability>) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "pvc-1".into(),
            staging_target_path: "/staging/pvc-1".into(),
            volume_capability: capability,
            volume_context: HashMap::from([(CONTEXT_SERIAL.to_string(), "S".to_string())]),
            ..Default::default()
        }
    }

    fn service(
        lister: MockDeviceLister,
        mounter: MockMounter,
        fs_maker: MockFsMaker,
    ) -> NodeService {
        NodeService::new("ns/vm".into(), Arc::new(lister), Arc::new(mounter), Arc::new(fs_maker))
    }

    #[tokio::test]
    async fn test_stage_formats_blank_device() {
        let mut fs_maker = MockFsMaker::new();
        fs_maker
            .expect_make_filesystem()
            .withf(|device, fs| device == "/dev/sdb" && fs == "xfs")
            .times(1)
            .returning(|_, _| Ok(()));
        let svc = service(
            lister(vec![BlockDevice { serial: "S".into(), path: "/dev/sdb".into(), fs_type: None }]),
            MockMounter::new(),
            fs_maker,
        );

        svc.node_stage_volume(Request::new(stage_request(mount_capability("xfs")))).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_keeps_existing_filesystem() {
        let mut fs_maker = MockFsMaker::new();
        fs_maker.expect_make_filesystem().never();
        let svc = service(
            lister(vec![BlockDevice {
                serial: "S".into(),
                path: "/dev/sdb".into(),
                fs_type: Some("ext4".into()),
            }]),
            MockMounter::new(),
            fs_maker,
        );

        svc.node_stage_volume(Request::new(stage_request(mount_capability("")))).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_block_never_formats() {
        let mut fs_maker = MockFsMaker::new();
        fs_maker.expect_make_filesystem().never();
        let svc = service(
            lister(vec![BlockDevice { serial: "S".into(), path: "/dev/sdb".into(), fs_type: None }]),
            MockMounter::new(),
            fs_maker,
        );
        let block = Some(VolumeCapability {
            access_type: Some(AccessType::Block(BlockVolume {})),
            access_mode: Some(volume_capability::AccessMode { mode: 1 }),
        });

        svc.node_stage_volume(Request::new(stage_request(block))).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_rejects_unsupported_filesystem_first() {
        let mut devices = MockDeviceLister::new();
        devices.expect_list_block_devices().never();
        let svc = service(devices, MockMounter::new(), MockFsMaker::new());

        let status = svc
            .node_stage_volume(Request::new(stage_request(mount_capability("ntfs"))))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_publish_skips_existing_mount() {
        let mut mounter = MockMounter::new();
        mounter.expect_is_mount_point().returning(|_| Ok(true));
        mounter.expect_mount().never();
        let svc = service(
            lister(vec![BlockDevice {
                serial: "S".into(),
                path: "/dev/sdb".into(),
                fs_type: Some("ext4".into()),
            }]),
            mounter,
            MockFsMaker::new(),
        );

        svc.node_publish_volume(Request::new(NodePublishVolumeRequest {
            volume_id: "pvc-1".into(),
            target_path: "/target".into(),
            volume_capability: mount_capability("ext4"),
            volume_context: HashMap::from([(CONTEXT_SERIAL.to_string(), "S".to_string())]),
            ..Default::default()
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_publish_mounts_readonly() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mount").to_str().unwrap().to_string();

        let mut mounter = MockMounter::new();
        mounter.expect_is_mount_point().returning(|_| Ok(false));
        let expected = target.clone();
        mounter
            .expect_mount()
            .withf(move |source, t, fs, options| {
                source == "/dev/sdb" && t == expected && fs == "ext4" && options == ["ro".to_string()]
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let svc = service(
            lister(vec![BlockDevice {
                serial: "S".into(),
                path: "/dev/sdb".into(),
                fs_type: Some("ext4".into()),
            }]),
            mounter,
            MockFsMaker::new(),
        );

        svc.node_publish_volume(Request::new(NodePublishVolumeRequest {
            volume_id: "pvc-1".into(),
            target_path: target.clone(),
            volume_capability: mount_capability(""),
            readonly: true,
            volume_context: HashMap::from([(CONTEXT_SERIAL.to_string(), "S".to_string())]),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert!(Path::new(&target).is_dir());
    }

    #[tokio::test]
    async fn test_unpublish_not_mounted() {
        let mut mounter = MockMounter::new();
        mounter.expect_is_mount_point().returning(|_| Ok(false));
        mounter.expect_unmount().never();
        mounter.expect_path_exists().returning(|_| Ok(false));
        let svc = service(MockDeviceLister::new(), mounter, MockFsMaker::new());

        svc.node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: "pvc-1".into(),
            target_path: "/target".into(),
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_volume_stats_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut mounter = MockMounter::new();
        mounter.expect_path_exists().returning(|_| Ok(true));
        let svc = service(MockDeviceLister::new(), mounter, MockFsMaker::new());

        let stats = svc
            .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
                volume_id: "pvc-1".into(),
                volume_path: dir.path().to_str().unwrap().into(),
                staging_target_path: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(stats.usage.len(), 2);
        assert!(stats.usage[0].total > 0);
        assert_eq!(stats.usage[0].unit, Unit::Bytes as i32);
    }

    #[tokio::test]
    async fn test_volume_stats_missing_path() {
        let mut mounter = MockMounter::new();
        mounter.expect_path_exists().returning(|_| Ok(false));
        let svc = service(MockDeviceLister::new(), mounter, MockFsMaker::new());

        let status = svc
            .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
                volume_id: "pvc-1".into(),
                volume_path: "/nope".into(),
                staging_target_path: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_unstage_and_stats_are_measured() {
        let mut mounter = MockMounter::new();
        mounter.expect_path_exists().returning(|_| Ok(false));
        let metrics = Arc::new(CsiMetrics::new(Arc::new(prometheus::Registry::new())).unwrap());
        let svc = service(MockDeviceLister::new(), mounter, MockFsMaker::new())
            .with_metrics(metrics.clone());

        svc.node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "pvc-1".into(),
            staging_target_path: "/staging/pvc-1".into(),
        }))
        .await
        .unwrap();
        let status = svc
            .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
                volume_id: String::new(),
                staging_target_path: "/staging/pvc-1".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        svc.node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
            volume_id: "pvc-1".into(),
            volume_path: "/nope".into(),
            staging_target_path: String::new(),
        }))
        .await
        .unwrap_err();

        let ops = |method: &str| metrics.operations_total.with_label_values(&[method]).get();
        assert_eq!(ops("NodeUnstageVolume"), 2.0);
        assert_eq!(ops("NodeGetVolumeStats"), 1.0);
        let errors = &metrics.operation_errors;
        assert_eq!(errors.with_label_values(&["NodeUnstageVolume", "InvalidArgument"]).get(), 1.0);
        assert_eq!(errors.with_label_values(&["NodeGetVolumeStats", "NotFound"]).get(), 1.0);
    }

    #[tokio::test]
    async fn test_node_info() {
        let svc = service(MockDeviceLister::new(), MockMounter::new(), MockFsMaker::new());
        let info =
            svc.node_get_info(Request::new(NodeGetInfoRequest {})).await.unwrap().into_inner();
        assert_eq!(info.node_id, "ns/vm");
    }
}
