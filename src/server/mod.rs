//! HTTP exposition endpoint.
//!
//! - `GET /metrics` renders the shared sink in the Prometheus text format
//! - `GET /health` is a plain liveness probe

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::{PrometheusSink, TEXT_CONTENT_TYPE};

pub struct Server {
    listener: TcpListener,
    sink: Arc<PrometheusSink>,
}

impl Server {
    pub fn new(listener: TcpListener, sink: Arc<PrometheusSink>) -> Self {
        Self { listener, sink }
    }

    /// Bind `addr` and wrap the listener.
    pub async fn bind(addr: SocketAddr, sink: Arc<PrometheusSink>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;
        Ok(Self::new(listener, sink))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn router(sink: Arc<PrometheusSink>) -> Router {
        Router::new()
            .route("/metrics", get(metrics))
            .route("/health", get(health))
            .with_state(sink)
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!("📊 Serving metrics on http://{}/metrics", addr);

        axum::serve(self.listener, Self::router(self.sink))
            .with_graceful_shutdown(shutdown)
            .await
            .context("Metrics server failed")?;

        info!("Metrics server stopped");
        Ok(())
    }
}

async fn metrics(State(sink): State<Arc<PrometheusSink>>) -> Response {
    match sink.render() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics").into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricKind, MetricsSink};
    use tokio::sync::oneshot;

    async fn start(sink: Arc<PrometheusSink>) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, sink);
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));
        (addr, tx, task)
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_sink() {
        let sink = Arc::new(PrometheusSink::new());
        sink.init("airquality_aqius", MetricKind::Gauge, "AQI value based on US EPA standard");
        sink.set("airquality_aqius", 42.0, &[("city", "Los Angeles")]);
        let (addr, tx, task) = start(Arc::clone(&sink)).await;

        let resp = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let content_type = resp.headers()[reqwest::header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));
        let body = resp.text().await.unwrap();
        assert!(body.contains("airquality_aqius{city=\"Los Angeles\"} 42"));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let sink = Arc::new(PrometheusSink::new());
        let (addr, tx, task) = start(sink).await;

        let body = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
