//! Thin HTTP trigger surface over the ingestion pipeline.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadflow_sync::{HealthReport, IngestMode, IngestPipeline, IngestSummary, PipelineStatus};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "leadflow-api";

/// The pipeline operations the HTTP layer needs. `IngestPipeline` is the one
/// production implementation; tests swap in a stub.
pub trait PipelineApi: Send + Sync + 'static {
    fn ingest(
        &self,
        path: PathBuf,
        mode: IngestMode,
    ) -> impl Future<Output = anyhow::Result<IngestSummary>> + Send;
    fn status(&self) -> impl Future<Output = anyhow::Result<PipelineStatus>> + Send;
    fn health(&self) -> impl Future<Output = HealthReport> + Send;
}

impl PipelineApi for IngestPipeline {
    async fn ingest(&self, path: PathBuf, mode: IngestMode) -> anyhow::Result<IngestSummary> {
        self.ingest_file(&path, mode).await
    }

    async fn status(&self) -> anyhow::Result<PipelineStatus> {
        IngestPipeline::status(self).await
    }

    async fn health(&self) -> HealthReport {
        IngestPipeline::health(self).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub file_path: PathBuf,
    #[serde(default)]
    pub mode: Option<IngestMode>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app<P: PipelineApi>(pipeline: Arc<P>) -> Router {
    Router::new()
        .route("/ingest", post(ingest_handler::<P>))
        .route("/status", get(status_handler::<P>))
        .route("/health", get(health_handler::<P>))
        .with_state(pipeline)
}

pub async fn serve(pipeline: Arc<IngestPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(pipeline)).await?;
    Ok(())
}

async fn ingest_handler<P: PipelineApi>(
    State(pipeline): State<Arc<P>>,
    Json(req): Json<IngestRequest>,
) -> Response {
    let mode = req.mode.unwrap_or(IngestMode::Incremental);
    match pipeline.ingest(req.file_path, mode).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler<P: PipelineApi>(State(pipeline): State<Arc<P>>) -> Response {
    match pipeline.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn health_handler<P: PipelineApi>(State(pipeline): State<Arc<P>>) -> Response {
    let report = pipeline.health().await;
    let code = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(serde_json::json!({
        "status": report.status(),
        "database": report.database,
        "cache": report.cache,
        "search": report.search,
    })))
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(%err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use leadflow_storage::{StoreCounts, UpsertStrategy};
    use tower::ServiceExt;

    struct StubPipeline {
        healthy: bool,
    }

    impl PipelineApi for StubPipeline {
        async fn ingest(&self, path: PathBuf, mode: IngestMode) -> anyhow::Result<IngestSummary> {
            let now = Utc::now();
            Ok(IngestSummary {
                file: path.display().to_string(),
                mode,
                strategy: UpsertStrategy::Validated,
                rows_read: 2,
                rows_rejected: 0,
                companies_written: 1,
                prospects_written: 2,
                rejections: Vec::new(),
                started_at: now,
                finished_at: now,
            })
        }

        async fn status(&self) -> anyhow::Result<PipelineStatus> {
            Ok(PipelineStatus {
                counts: StoreCounts {
                    companies: 1,
                    prospects: 2,
                    view_rows: 2,
                },
                last_run: None,
                cdc_checkpoint: Some("0/16B3748".into()),
                refresh_in_flight: false,
            })
        }

        async fn health(&self) -> HealthReport {
            HealthReport {
                database: self.healthy,
                cache: self.healthy,
                search: true,
            }
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ingest_defaults_to_incremental_mode() {
        let app = app(Arc::new(StubPipeline { healthy: true }));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"file_path":"/data/leads.csv"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["mode"], "incremental");
        assert_eq!(json["prospects_written"], 2);
    }

    #[tokio::test]
    async fn status_returns_counts_and_checkpoint() {
        let app = app(Arc::new(StubPipeline { healthy: true }));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["counts"]["prospects"], 2);
        assert_eq!(json["cdc_checkpoint"], "0/16B3748");
    }

    #[tokio::test]
    async fn health_maps_degraded_to_503() {
        let app = app(Arc::new(StubPipeline { healthy: false }));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["cache"], false);
    }
}
