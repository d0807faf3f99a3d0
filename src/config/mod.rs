use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::policy::StorageClassEnforcement;

/// Which CSI services this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Controller,
    Node,
    All,
}

impl Mode {
    pub fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn runs_node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }

    /// Whether a client for the infra cluster is built and probed at startup.
    /// The node plugin only works inside its guest.
    pub fn needs_infra_cluster(self) -> bool {
        self.runs_controller()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "kubevirt-csi", version, about = "CSI driver for KubeVirt tenant clusters")]
pub struct Cli {
    /// CSI endpoint, unix:// or tcp://
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    pub endpoint: String,

    #[arg(long, env = "DRIVER_MODE", value_enum, default_value_t = Mode::All)]
    pub mode: Mode,

    /// Tenant node this plugin runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Kubeconfig for the infra cluster, used by the controller; in-cluster
    /// config when unset
    #[arg(long, env = "INFRA_CLUSTER_KUBECONFIG")]
    pub infra_cluster_kubeconfig: Option<PathBuf>,

    /// Namespace holding data volumes and virtual machines
    #[arg(long, env = "INFRA_CLUSTER_NAMESPACE")]
    pub infra_cluster_namespace: Option<String>,

    /// Labels put on infra objects, as k=v,k2=v2
    #[arg(long, env = "INFRA_CLUSTER_LABELS", default_value = "")]
    pub infra_cluster_labels: String,

    /// Storage class enforcement document
    #[arg(long, env = "DRIVER_CONFIG")]
    pub driver_config: Option<PathBuf>,

    #[arg(long, env = "METRICS_ADDRESS")]
    pub metrics_address: Option<SocketAddr>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn labels(&self) -> anyhow::Result<BTreeMap<String, String>> {
        parse_labels(&self.infra_cluster_labels)
    }
}

/// Parse `k=v,k2=v2`. Empty input is an empty map.
pub fn parse_labels(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("label {} is not in key=value form", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("label {} has an empty key", pair);
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}

/// Contents of the driver config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(
        default,
        rename = "infraStorageClassEnforcement",
        alias = "infrastorageclassenforcement"
    )]
    pub enforcement: StorageClassEnforcement,
}

impl DriverConfig {
    /// Load from `path`. No path, or a path that does not exist, allows everything.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::info!(path = %path.display(), "driver config not found, allowing all storage classes");
            return Ok(Self::default());
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
