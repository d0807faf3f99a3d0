use crate::csi::proto::{
    controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer,
};
use crate::csi::{ControllerService, IdentityService, NodeService};
use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::Server;

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                bail!("unix endpoint {} has no socket path", endpoint);
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let addr = addr.parse().with_context(|| format!("invalid tcp endpoint {}", endpoint))?;
            return Ok(Self::Tcp(addr));
        }
        bail!("endpoint {} must start with unix:// or tcp://", endpoint)
    }
}

/// CSI gRPC server
pub struct CsiServer {
    identity: IdentityService,
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

/// A running server.
pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl CsiServer {
    pub fn new(
        identity: IdentityService,
        controller: Option<ControllerService>,
        node: Option<NodeService>,
    ) -> Self {
        Self { identity, controller, node }
    }

    /// Bind `endpoint` and serve in the background.
    pub async fn start(self, endpoint: &Endpoint) -> Result<ServerHandle> {
        let (tx, rx) = oneshot::channel::<()>();
        let shutdown = async {
            let _ = rx.await;
        };

        let router = Server::builder()
            .add_service(IdentityServer::new(self.identity))
            .add_optional_service(self.controller.map(ControllerServer::new))
            .add_optional_service(self.node.map(NodeServer::new));

        let task = match endpoint {
            Endpoint::Unix(path) => {
                // Remove existing socket if it exists
                if path.exists() {
                    std::fs::remove_file(path).context("Failed to remove existing socket")?;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
                }

                let uds = tokio::net::UnixListener::bind(path).context("Failed to bind Unix socket")?;
                let incoming = tokio_stream::wrappers::UnixListenerStream::new(uds);
                tracing::info!(endpoint = %path.display(), "CSI server listening");

                tokio::spawn(async move {
                    router
                        .serve_with_incoming_shutdown(incoming, shutdown)
                        .await
                        .context("gRPC server error")
                })
            }
            Endpoint::Tcp(addr) => {
                let listener =
                    tokio::net::TcpListener::bind(addr).await.context("Failed to bind TCP socket")?;
                let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
                tracing::info!(endpoint = %addr, "CSI server listening");

                tokio::spawn(async move {
                    router
                        .serve_with_incoming_shutdown(incoming, shutdown)
                        .await
                        .context("gRPC server error")
                })
            }
        };

        Ok(ServerHandle { shutdown: Some(tx), task })
    }
}

impl ServerHandle {
    /// Ask the server to finish in-flight requests and exit.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the server to exit.
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("gRPC server task panicked")?
    }
}
