use std::future::Future;

use bytes::{Bytes, BytesMut};
use http::{Request, Response};
use tokio::sync::mpsc;

use crate::error::HandlerError;

/// Body handed to a [`RequestHandler`].
///
/// `Full` when the pipeline aggregates requests, `Streaming` otherwise.
#[derive(Debug)]
pub enum RequestBody {
    Full(Bytes),
    Streaming(mpsc::Receiver<Bytes>),
}

impl RequestBody {
    /// Next piece of the body, or `None` once it has been fully read.
    pub async fn chunk(&mut self) -> Option<Bytes> {
        match self {
            RequestBody::Full(body) if body.is_empty() => None,
            RequestBody::Full(body) => Some(std::mem::take(body)),
            RequestBody::Streaming(chunks) => chunks.recv().await,
        }
    }

    pub async fn collect(mut self) -> Bytes {
        if let RequestBody::Full(body) = self {
            return body;
        }
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            collected.extend_from_slice(&chunk);
        }
        collected.freeze()
    }
}

/// Terminal stage of the pipeline: the request business logic.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request<RequestBody>,
    ) -> impl Future<Output = Result<Response<Bytes>, HandlerError>> + Send;
}

pub struct HandlerFn<F> {
    f: F,
}

/// Wraps a closure returning a future as a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>, HandlerError>> + Send,
{
    HandlerFn { f }
}

impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>, HandlerError>> + Send,
{
    fn handle(
        &self,
        request: Request<RequestBody>,
    ) -> impl Future<Output = Result<Response<Bytes>, HandlerError>> + Send {
        (self.f)(request)
    }
}
