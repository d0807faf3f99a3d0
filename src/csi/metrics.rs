use axum::{Router, extract::State, http::StatusCode, http::header, routing::get};
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tonic::Status;
use tower_http::trace::TraceLayer;

/// CSI metrics collector
pub struct CsiMetrics {
    /// Total CSI operations
    pub operations_total: CounterVec,
    /// CSI operation duration in seconds
    pub operation_duration: HistogramVec,
    /// CSI operation errors, by gRPC code
    pub operation_errors: CounterVec,
    /// Attach and detach requests handled by the controller
    pub hotplug_total: CounterVec,
    /// Devices formatted by the node plugin
    pub format_total: CounterVec,
}

impl CsiMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let operations_total = CounterVec::new(
            Opts::new("kubevirt_csi_operations_total", "Total CSI operations"),
            &["method"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "kubevirt_csi_operation_duration_seconds",
                "CSI operation duration in seconds",
            ),
            &["method"],
        )?;

        let operation_errors = CounterVec::new(
            Opts::new("kubevirt_csi_operation_errors_total", "CSI operation errors"),
            &["method", "code"],
        )?;

        let hotplug_total = CounterVec::new(
            Opts::new("kubevirt_csi_hotplug_total", "Volume attach and detach requests handled"),
            &["action"],
        )?;

        let format_total = CounterVec::new(
            Opts::new("kubevirt_csi_format_total", "Block devices formatted"),
            &["fs_type"],
        )?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(operation_errors.clone()))?;
        registry.register(Box::new(hotplug_total.clone()))?;
        registry.register(Box::new(format_total.clone()))?;

        Ok(Self { operations_total, operation_duration, operation_errors, hotplug_total, format_total })
    }

    /// Record an operation
    pub fn record_operation(&self, method: &str, duration_secs: f64, error: Option<tonic::Code>) {
        self.operations_total.with_label_values(&[method]).inc();
        self.operation_duration.with_label_values(&[method]).observe(duration_secs);
        if let Some(code) = error {
            let code = format!("{:?}", code);
            self.operation_errors.with_label_values(&[method, code.as_str()]).inc();
        }
    }

    pub fn record_hotplug(&self, action: &str) {
        self.hotplug_total.with_label_values(&[action]).inc();
    }

    pub fn record_format(&self, fs_type: &str) {
        self.format_total.with_label_values(&[fs_type]).inc();
    }
}

/// Run an RPC body, recording its outcome when metrics are enabled.
pub async fn observe<T, F>(
    metrics: Option<&CsiMetrics>,
    method: &'static str,
    body: F,
) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    let started = Instant::now();
    let result = body.await;
    if let Some(metrics) = metrics {
        let error = result.as_ref().err().map(Status::code);
        metrics.record_operation(method, started.elapsed().as_secs_f64(), error);
    }
    result
}

async fn render(
    State(registry): State<Arc<Registry>>,
) -> Result<([(header::HeaderName, String); 1], Vec<u8>), StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer).map_err(|e| {
        tracing::warn!(error = %e, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer))
}

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
}

/// Serve `/metrics` until `shutdown` resolves.
pub async fn serve_metrics(
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "metrics listening");
    axum::serve(listener, router(registry)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csi_metrics_creation() {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry).unwrap();

        metrics.record_operation("CreateVolume", 1.5, None);
        assert_eq!(metrics.operations_total.with_label_values(&["CreateVolume"]).get(), 1.0);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Arc::new(Registry::new());
        let _first = CsiMetrics::new(registry.clone()).unwrap();
        assert!(CsiMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn test_observe_records_errors() {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry).unwrap();

        let result: Result<(), Status> =
            observe(Some(&metrics), "DeleteVolume", async { Err(Status::internal("boom")) }).await;
        assert!(result.is_err());
        assert_eq!(
            metrics.operation_errors.with_label_values(&["DeleteVolume", "Internal"]).get(),
            1.0
        );

        observe(Some(&metrics), "DeleteVolume", async { Ok(()) }).await.unwrap();
        assert_eq!(metrics.operations_total.with_label_values(&["DeleteVolume"]).get(), 2.0);
    }

    #[test]
    fn test_hotplug_metrics() {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry.clone()).unwrap();

        metrics.record_hotplug("attach");
        metrics.record_hotplug("attach");
        assert_eq!(metrics.hotplug_total.with_label_values(&["attach"]).get(), 2.0);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("kubevirt_csi_hotplug_total{action=\"attach\"} 2"));
    }
}
