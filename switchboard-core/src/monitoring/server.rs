//! HTTP server for metrics and health
//!
//! Serves Prometheus text at the configured metrics path and a JSON
//! [`HealthSnapshot`](crate::resilience::HealthSnapshot) at `/health`.

use super::MetricsRegistry;
use crate::config::MonitoringConfig;
use crate::resilience::HealthReporter;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Configuration for metrics HTTP server
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:9090")
    pub listen_addr: SocketAddr,
    /// Path to serve metrics (default: "/metrics")
    pub metrics_path: String,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

impl MetricsServerConfig {
    pub fn from_monitoring(config: &MonitoringConfig) -> Result<Self> {
        let listen_addr = config
            .metrics_addr
            .parse()
            .with_context(|| format!("Invalid metrics address '{}'", config.metrics_addr))?;
        Ok(Self {
            listen_addr,
            metrics_path: config.metrics_path.clone(),
        })
    }
}

struct RouteContext {
    registry: Arc<MetricsRegistry>,
    health: Option<HealthReporter>,
    metrics_path: String,
}

pub struct MetricsServer {
    config: MetricsServerConfig,
    ctx: Arc<RouteContext>,
}

impl MetricsServer {
    pub fn new(
        config: MetricsServerConfig,
        registry: Arc<MetricsRegistry>,
        health: Option<HealthReporter>,
    ) -> Self {
        let ctx = Arc::new(RouteContext {
            registry,
            health,
            metrics_path: config.metrics_path.clone(),
        });
        Self { config, ctx }
    }

    /// Serve until `shutdown` flips to true.
    ///
    /// Should be spawned in a separate tokio task.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .context("Failed to bind metrics server")?;

        info!(
            "Metrics server listening on http://{}{}",
            self.config.listen_addr, self.config.metrics_path
        );

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.changed() => {
                    info!("Metrics server shutting down");
                    return Ok(());
                }
            };

            let ctx = self.ctx.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let ctx = ctx.clone();
                    async move { Ok::<_, Infallible>(route(req.uri().path(), &ctx)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

fn route(path: &str, ctx: &RouteContext) -> Response<Full<Bytes>> {
    debug!("Status request: {}", path);

    if path == ctx.metrics_path {
        return match encode_metrics(&ctx.registry) {
            Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => {
                error!("Failed to encode metrics: {:#}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("Error: {}", e),
                )
            }
        };
    }

    if path == "/health" || path == "/healthz" {
        let Some(reporter) = &ctx.health else {
            return respond(StatusCode::OK, "text/plain", "OK".to_string());
        };
        return match serde_json::to_string(&reporter.snapshot()) {
            Ok(json) => respond(StatusCode::OK, "application/json", json),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("Error: {}", e),
            ),
        };
    }

    if path == "/" {
        let help = format!(
            "Switchboard Gateway\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Health snapshot (JSON)\n",
            ctx.metrics_path
        );
        return respond(StatusCode::OK, "text/plain", help);
    }

    warn!("Unknown status endpoint requested: {}", path);
    respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string())
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics(registry: &MetricsRegistry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.registry().gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;

    String::from_utf8(buffer).context("Invalid UTF-8 in metrics")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn ctx(health: Option<HealthReporter>) -> RouteContext {
        RouteContext {
            registry: Arc::new(MetricsRegistry::new().unwrap()),
            health,
            metrics_path: "/metrics".to_string(),
        }
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_config_from_monitoring() {
        let config = MetricsServerConfig::from_monitoring(&MonitoringConfig::default()).unwrap();
        assert_eq!(config.listen_addr.port(), 9090);
        assert_eq!(config.metrics_path, "/metrics");

        let bad = MonitoringConfig {
            metrics_addr: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(MetricsServerConfig::from_monitoring(&bad).is_err());
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let ctx = ctx(None);
        ctx.registry.connection().conflicts_total.inc();

        let response = route("/metrics", &ctx);
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("switchboard_connection_conflicts_total 1"));
    }

    #[tokio::test]
    async fn test_health_without_reporter() {
        let response = route("/health", &ctx(None));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");
    }

    #[test]
    fn test_unknown_path() {
        assert_eq!(route("/nope", &ctx(None)).status(), StatusCode::NOT_FOUND);
    }
}
