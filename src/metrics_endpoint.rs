//! Metrics HTTP Endpoint
//!
//! Exposes the edge metrics in Prometheus text format on a separate port,
//! next to a trivial health check.

use crate::metrics::EdgeMetrics;
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<EdgeMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Arguments
    /// * `metrics` - Shared metrics collector
    /// * `addr` - Address to bind the HTTP server to
    pub fn new(metrics: Arc<EdgeMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        info!("Metrics endpoint listening on http://{}", local);
        info!("Metrics available at http://{}/metrics", local);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let metrics = Arc::clone(&metrics);
                    async move { Ok::<_, Infallible>(route(&req, &metrics)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

fn route<B>(req: &Request<B>, metrics: &EdgeMetrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => metrics_response(metrics),
        "/health" => plain(StatusCode::OK, "text/plain", "OK"),
        _ => plain(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

fn metrics_response(metrics: &EdgeMetrics) -> Response<Full<Bytes>> {
    match metrics.encode() {
        Ok(body) => plain(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            body,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "Internal Server Error",
            )
        }
    }
}

fn plain(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
