use crate::csi::proto::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
    identity_server::Identity,
};
use crate::infra::ConnectivityProbe;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub const PLUGIN_NAME: &str = "csi.kubevirt.io";
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity Service implementation
///
/// Reports ready only while the infra cluster API answers.
#[derive(Clone)]
pub struct IdentityService {
    name: String,
    version: String,
    probe: Option<Arc<dyn ConnectivityProbe>>,
}

impl IdentityService {
    pub fn new(probe: Option<Arc<dyn ConnectivityProbe>>) -> Self {
        Self { name: PLUGIN_NAME.to_string(), version: PLUGIN_VERSION.to_string(), probe }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        use crate::csi::proto::plugin_capability::{Service, service::Type};

        let capabilities = vec![PluginCapability {
            r#type: Some(crate::csi::proto::plugin_capability::Type::Service(Service {
                r#type: Type::ControllerService as i32,
            })),
        }];

        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        if let Some(probe) = &self.probe {
            if let Err(e) = probe.check().await {
                tracing::warn!(error = %e, "infra cluster unreachable");
                return Err(Status::failed_precondition(format!(
                    "infra cluster unreachable: {}",
                    e
                )));
            }
        }
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}
