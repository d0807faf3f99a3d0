use anyhow::{Context, Result, bail};
use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use prometheus::Registry;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use kubevirt_csi::config::{Cli, DriverConfig, LogFormat};
use kubevirt_csi::csi::metrics::serve_metrics;
use kubevirt_csi::csi::{
    ControllerService, ControllerSettings, CsiMetrics, CsiServer, Endpoint, IdentityService,
    NodeService,
};
use kubevirt_csi::device::{LsblkDeviceLister, MkfsFormatter, SystemMounter};
use kubevirt_csi::infra::{ApiServerProbe, ConnectivityProbe, KubeInfraCluster};
use kubevirt_csi::node_identity::resolve_node_identity;

fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "kubevirt_csi=debug,info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn infra_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default().await.context("failed to build in-cluster infra client");
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read infra kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("invalid infra kubeconfig")?;
    Client::try_from(config).context("failed to build infra client")
}

/// Node ID of this plugin: the infra VM backing the tenant node.
async fn node_id(node_name: &str) -> Result<String> {
    let tenant = Client::try_default().await.context("failed to build tenant client")?;
    let node = Api::<Node>::all(tenant)
        .get(node_name)
        .await
        .with_context(|| format!("failed to fetch tenant node {}", node_name))?;

    let provider_id = node.spec.as_ref().and_then(|spec| spec.provider_id.as_deref());
    let annotations = node.metadata.annotations.clone().unwrap_or_default();
    let instance = resolve_node_identity(provider_id, &annotations)?;
    Ok(instance.to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cli.mode,
        endpoint = %cli.endpoint,
        "Starting KubeVirt CSI driver"
    );

    let endpoint = Endpoint::parse(&cli.endpoint)?;
    let labels = cli.labels()?;

    // Node-only plugins never reach the infra cluster, so their Probe is
    // always ready.
    let infra = if cli.mode.needs_infra_cluster() {
        let client = infra_client(cli.infra_cluster_kubeconfig.as_deref()).await?;
        let probe = Arc::new(ApiServerProbe::new(client.clone()));
        probe.check().await.context("infra cluster is unreachable")?;
        Some((client, probe))
    } else {
        None
    };

    let (metrics, registry) = match cli.metrics_address {
        Some(_) => {
            let registry = Arc::new(Registry::new());
            let metrics = Arc::new(CsiMetrics::new(registry.clone())?);
            (Some(metrics), Some(registry))
        }
        None => (None, None),
    };

    let controller = if let Some((client, _)) = &infra {
        let Some(namespace) = cli.infra_cluster_namespace.clone() else {
            bail!("--infra-cluster-namespace is required in controller mode");
        };
        let driver_config = DriverConfig::load(cli.driver_config.as_deref())?;
        let settings = ControllerSettings {
            infra_namespace: namespace,
            infra_cluster_labels: labels,
            enforcement: driver_config.enforcement,
        };
        let infra_cluster = Arc::new(KubeInfraCluster::new(client.clone()));
        let service = ControllerService::new(infra_cluster, settings);
        Some(match &metrics {
            Some(metrics) => service.with_metrics(metrics.clone()),
            None => service,
        })
    } else {
        None
    };

    let node = if cli.mode.runs_node() {
        let Some(node_name) = cli.node_name.as_deref() else {
            bail!("--node-name is required in node mode");
        };
        let node_id = node_id(node_name).await?;
        tracing::info!(node = %node_name, node_id = %node_id, "resolved infra VM for node");
        let service = NodeService::new(
            node_id,
            Arc::new(LsblkDeviceLister),
            Arc::new(SystemMounter),
            Arc::new(MkfsFormatter),
        );
        Some(match &metrics {
            Some(metrics) => service.with_metrics(metrics.clone()),
            None => service,
        })
    } else {
        None
    };

    let (metrics_stop, metrics_task) = match (cli.metrics_address, registry) {
        (Some(addr), Some(registry)) => {
            let (tx, rx) = oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                let shutdown = async move {
                    let _ = rx.await;
                };
                if let Err(e) = serve_metrics(addr, registry, shutdown).await {
                    tracing::error!(error = %e, "metrics server failed");
                }
            });
            (Some(tx), Some(task))
        }
        _ => (None, None),
    };

    let identity = IdentityService::new(
        infra.map(|(_, probe)| probe as Arc<dyn ConnectivityProbe>),
    );
    let mut server = CsiServer::new(identity, controller, node).start(&endpoint).await?;

    shutdown_signal().await;
    tracing::info!("Shutting down");

    server.stop();
    server.wait().await?;
    if let Some(tx) = metrics_stop {
        let _ = tx.send(());
    }
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    tracing::info!("CSI driver stopped");
    Ok(())
}
