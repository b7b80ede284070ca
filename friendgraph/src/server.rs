//! HTTP API over a [`CrawlService`].

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use friendgraph_core::crawl::{CrawlRequest, CrawlService, CrawlTicket};
use friendgraph_crawler::error::CrawlError;
use friendgraph_crawler::model::CrawlJob;
use friendgraph_crawler::store::Store;
use serde::Deserialize;
use serde_json::json;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Span, error, info};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCrawlBody {
    pub origin_a: String,
    #[serde(default)]
    pub origin_b: Option<String>,
    pub depth: u32,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub force: bool,
}

impl From<StartCrawlBody> for CrawlRequest {
    fn from(body: StartCrawlBody) -> Self {
        let mut origins = vec![body.origin_a];
        if let Some(origin_b) = body.origin_b.filter(|b| !b.is_empty()) {
            origins.push(origin_b);
        }
        CrawlRequest {
            origins,
            depth: body.depth,
            job_id: body.job_id,
            force: body.force,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGraphBody {
    pub job_id: String,
}

/// A [`CrawlError`] rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(CrawlError);

impl From<CrawlError> for ApiError {
    fn from(err: CrawlError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(CrawlError::InvalidInput(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CrawlError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CrawlError::NotFound(_) => StatusCode::NOT_FOUND,
            CrawlError::IncompleteJob { .. } | CrawlError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            CrawlError::Store(_) | CrawlError::JoinError(_) => {
                let reference = uuid::Uuid::new_v4().simple().to_string();
                error!(reference = %reference, "Request failed: {}", self.0);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": format!("Internal error, reference '{}'", reference)
                    })),
                )
                    .into_response();
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn status_body(job: &CrawlJob) -> serde_json::Value {
    json!({
        "jobId": job.job_id,
        "state": job.state.as_str(),
        "totalDiscovered": job.total_discovered,
        "completed": job.completed,
        "failed": job.failed,
        "skipped": job.skipped,
        "maxDepth": job.max_depth,
        "origins": job.origins,
    })
}

async fn start_crawl<S: Store + 'static>(
    State(service): State<Arc<CrawlService<S>>>,
    body: Result<Json<StartCrawlBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let ticket = service.request_crawl(body.into()).await?;
    let status = match ticket {
        CrawlTicket::Started(_) => StatusCode::ACCEPTED,
        CrawlTicket::Existing(_) => StatusCode::OK,
    };
    Ok((status, Json(json!({ "jobId": ticket.job_id() }))).into_response())
}

async fn crawl_status<S: Store + 'static>(
    State(service): State<Arc<CrawlService<S>>>,
    Path(job_id): Path<String>,
) -> ApiResult {
    let job = service.status(&job_id).await?;
    Ok(Json(status_body(&job)).into_response())
}

async fn cancel_crawl<S: Store + 'static>(
    State(service): State<Arc<CrawlService<S>>>,
    Path(job_id): Path<String>,
) -> ApiResult {
    let job = service.cancel(&job_id).await?;
    Ok(Json(json!({ "jobId": job.job_id, "state": job.state.as_str() })).into_response())
}

async fn create_graph<S: Store + 'static>(
    State(service): State<Arc<CrawlService<S>>>,
    body: Result<Json<CreateGraphBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let graph = service.create_graph(&body.job_id).await?;
    info!("Graph ready for job {}", graph.job_id);
    Ok(Json(json!({ "status": "created", "jobId": graph.job_id })).into_response())
}

async fn get_graph<S: Store + 'static>(
    State(service): State<Arc<CrawlService<S>>>,
    Path(job_id): Path<String>,
) -> ApiResult {
    let graph = service.graph(&job_id).await?;
    Ok(Json(graph).into_response())
}

async fn health(started: Instant) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "uptime": started.elapsed().as_secs() }))
}

/// Builds the API router. Request spans are children of `span`. `/health`
/// reports uptime in seconds since the router was built.
pub fn router<S: Store + 'static>(service: Arc<CrawlService<S>>, span: Span) -> Router {
    let started = Instant::now();
    Router::new()
        .route("/crawl", post(start_crawl::<S>))
        .route("/crawl/{job_id}/cancel", post(cancel_crawl::<S>))
        .route("/crawlstatus/{job_id}", get(crawl_status::<S>))
        .route("/creategraph", post(create_graph::<S>))
        .route("/graph/{job_id}", get(get_graph::<S>))
        .route("/health", get(move || health(started)))
        .with_state(service)
        .layer(
            TraceLayer::new_for_http().make_span_with(move |request: &Request<Body>| {
                tracing::info_span!(
                    parent: &span,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
}

/// Serves the API on `addr` until ctrl-c.
pub async fn serve<S: Store + 'static>(
    service: Arc<CrawlService<S>>,
    addr: &str,
    span: Span,
) -> anyhow::Result<()> {
    let app = router(service, span.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(parent: &span, "friendgraph API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future()
        .instrument(span)
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}
