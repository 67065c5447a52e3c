use std::time::UNIX_EPOCH;

use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderValue, Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::{
    error::HandlerError,
    pipeline::{RequestBody, RequestHandler},
    view::{ClusterView, WorkerInfo},
};

pub const WORKERS_ROUTE: &str = "/cluster/workers";
pub const HEALTH_ROUTE: &str = "/health";

#[derive(Debug, Serialize)]
struct WorkerEntry {
    worker_id: String,
    joined_at_ms: u128,
}

impl From<WorkerInfo> for WorkerEntry {
    fn from(info: WorkerInfo) -> Self {
        Self {
            worker_id: info.worker_id.to_string(),
            joined_at_ms: info
                .joined_at
                .duration_since(UNIX_EPOCH)
                .map(|since| since.as_millis())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WorkersResponse {
    workers: Vec<WorkerEntry>,
}

/// Answers membership queries from the live cluster view.
#[derive(Debug, Clone)]
pub struct ClusterStatusHandler {
    view: ClusterView,
}

impl ClusterStatusHandler {
    pub fn new(view: ClusterView) -> Self {
        Self { view }
    }

    async fn workers(&self) -> Result<Response<Bytes>, HandlerError> {
        let workers = self
            .view
            .workers()
            .await
            .into_iter()
            .map(WorkerEntry::from)
            .collect();
        let body = serde_json::to_vec(&WorkersResponse { workers })
            .map_err(|error| HandlerError::new(format!("failed to encode workers: {error}")))?;
        Ok(with_content_type(
            Response::new(Bytes::from(body)),
            "application/json",
        ))
    }
}

fn with_content_type(mut response: Response<Bytes>, content_type: &'static str) -> Response<Bytes> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn status(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(
        status.canonical_reason().unwrap_or_default().as_bytes(),
    ));
    *response.status_mut() = status;
    with_content_type(response, "text/plain; charset=utf-8")
}

impl RequestHandler for ClusterStatusHandler {
    async fn handle(&self, request: Request<RequestBody>) -> Result<Response<Bytes>, HandlerError> {
        let known = matches!(request.uri().path(), WORKERS_ROUTE | HEALTH_ROUTE);
        if !known {
            return Ok(status(StatusCode::NOT_FOUND));
        }
        if request.method() != Method::GET {
            let mut response = status(StatusCode::METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(http::header::ALLOW, HeaderValue::from_static("GET"));
            return Ok(response);
        }

        match request.uri().path() {
            WORKERS_ROUTE => self.workers().await,
            _ => Ok(with_content_type(
                Response::new(Bytes::from_static(b"ok")),
                "text/plain; charset=utf-8",
            )),
        }
    }
}
