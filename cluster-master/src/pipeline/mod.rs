//! Per-connection request pipeline.
//!
//! A pipeline is an ordered list of [`Stage`]s built fresh for every accepted
//! connection. `Decode` always comes first and `Dispatch` always last; the
//! optional stages sit between them in a fixed order.

mod aggregate;
mod codec;
mod compress;
mod dispatch;

use std::io;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{
    header::{CONNECTION, CONTENT_TYPE, EXPECT},
    request, HeaderMap, HeaderValue, Request, Response, StatusCode, Version,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, warn};

pub use aggregate::{Aggregated, Aggregator};
pub use codec::{HttpCodec, RequestFrame, ResponseFrame, MAX_HEAD_SIZE};
pub use compress::{Compressor, ContentCoding};
pub use dispatch::{handler_fn, HandlerFn, RequestBody, RequestHandler};

use crate::{
    config::PipelineConfig,
    error::{CodecError, HandlerError, PipelineError},
};

/// Chunks buffered between the decoder and a streaming handler.
const BODY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Compress { min_size: usize },
    Aggregate { max_content_length: usize },
    Dispatch,
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn build(config: &PipelineConfig) -> Pipeline {
        let mut stages = vec![Stage::Decode];
        if config.compression_enabled {
            stages.push(Stage::Compress {
                min_size: config.compression_min_size,
            });
        }
        if config.aggregation_enabled {
            stages.push(Stage::Aggregate {
                max_content_length: config.max_aggregated_content_length,
            });
        }
        stages.push(Stage::Dispatch);
        Pipeline { stages }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn compression(&self) -> Option<usize> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Compress { min_size } => Some(*min_size),
            _ => None,
        })
    }

    fn aggregation(&self) -> Option<usize> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Aggregate { max_content_length } => Some(*max_content_length),
            _ => None,
        })
    }

    /// Serves requests from `stream` until the peer closes it, a request
    /// asks for the connection to be closed, or a request is rejected.
    pub async fn serve<S, H>(&self, stream: S, handler: &H) -> Result<(), PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        H: RequestHandler,
    {
        self.serve_until_drained(stream, handler, CancellationToken::new()).await
    }

    /// Like [`Pipeline::serve`], but once `drain` is cancelled the connection
    /// closes as soon as it sits idle between requests. Responses written
    /// after that point carry `Connection: close`.
    pub async fn serve_until_drained<S, H>(
        &self,
        stream: S,
        handler: &H,
        drain: CancellationToken,
    ) -> Result<(), PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        H: RequestHandler,
    {
        let mut connection = Connection {
            framed: Framed::new(stream, HttpCodec::new()),
            compressor: self.compression().map(Compressor::new),
            max_content_length: self.aggregation(),
            drain,
            served: 0,
        };
        connection.run(handler).await
    }
}

struct Connection<S> {
    framed: Framed<S, HttpCodec>,
    compressor: Option<Compressor>,
    max_content_length: Option<usize>,
    drain: CancellationToken,
    served: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run<H: RequestHandler>(&mut self, handler: &H) -> Result<(), PipelineError> {
        loop {
            let Some(next) = self.next_request().await else {
                return Ok(());
            };
            let head = match next {
                Ok(RequestFrame::Head(head)) => head,
                Ok(_) => {
                    let error = CodecError::Malformed("body frame without a request".into());
                    return Err(self.reject_codec(error).await);
                }
                Err(error) => return Err(self.reject_codec(error).await),
            };

            let version = head.version;
            let keep_alive = keep_alive(version, &head.headers);
            debug!(method = %head.method, uri = %head.uri, "Request received");

            if let Some(compressor) = self.compressor.as_mut() {
                compressor.observe(&head);
            }

            let (result, body_done) = match self.max_content_length {
                Some(max_content_length) => match self.aggregate(head, max_content_length).await? {
                    Some(request) => {
                        let request = request.map(RequestBody::Full);
                        (handler.handle(request).await, true)
                    }
                    None => return Ok(()),
                },
                None => self.stream(head, handler).await?,
            };

            let response = result.unwrap_or_else(|error| {
                warn!(status = %error.status(), %error, "Request handler failed");
                error_response(&error)
            });
            let keep_alive = keep_alive && !self.drain.is_cancelled();
            self.respond(response, version, keep_alive).await?;
            self.served += 1;

            if !keep_alive {
                return Ok(());
            }
            if !body_done {
                self.drain_body().await?;
            }
        }
    }

    /// Waits for the next request's first frame.
    ///
    /// A connection that already answered a request and has nothing of the
    /// next one buffered is closed once draining starts.
    async fn next_request(&mut self) -> Option<Result<RequestFrame, CodecError>> {
        let idle = self.served > 0 && self.framed.read_buffer().is_empty();
        if !idle {
            return self.framed.next().await;
        }
        tokio::select! {
            biased;
            next = self.framed.next() => next,
            _ = self.drain.cancelled() => {
                debug!(served = self.served, "Closing idle connection for drain");
                None
            }
        }
    }

    async fn aggregate(
        &mut self,
        head: request::Parts,
        max_content_length: usize,
    ) -> Result<Option<Request<Bytes>>, PipelineError> {
        let mut aggregator = Aggregator::new(max_content_length);
        let mut frame = RequestFrame::Head(head);
        loop {
            match aggregator.push(frame) {
                Ok(Aggregated::Pending) => {}
                Ok(Aggregated::Continue) => self.framed.send(ResponseFrame::Continue).await?,
                Ok(Aggregated::Complete(request)) => return Ok(Some(request)),
                Err(error) => {
                    if let PipelineError::RequestTooLarge { limit, received } = &error {
                        debug!(limit, received, "Rejecting oversized request");
                        self.reject(StatusCode::PAYLOAD_TOO_LARGE).await;
                    } else if let PipelineError::Codec(codec) = &error {
                        if let Some(status) = codec.status() {
                            self.reject(status).await;
                        }
                    }
                    return Err(error);
                }
            }

            frame = match self.framed.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => return Err(self.reject_codec(error).await),
                None => return Ok(None),
            };
        }
    }

    /// Runs the handler while feeding it body chunks as they are decoded.
    ///
    /// Returns the handler's result and whether the request body was read to
    /// its end.
    async fn stream<H: RequestHandler>(
        &mut self,
        mut head: request::Parts,
        handler: &H,
    ) -> Result<(Result<Response<Bytes>, HandlerError>, bool), PipelineError> {
        let expects_continue = head
            .headers
            .remove(EXPECT)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"));
        if expects_continue && head.version == Version::HTTP_11 {
            self.framed.send(ResponseFrame::Continue).await?;
        }

        let (sender, receiver) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let mut sender = Some(sender);
        let mut pending: Option<Bytes> = None;
        let mut body_done = false;

        let handling = handler.handle(Request::from_parts(head, RequestBody::Streaming(receiver)));
        tokio::pin!(handling);

        let result = loop {
            tokio::select! {
                result = &mut handling => break result,
                delivered = deliver(&sender, &mut pending), if pending.is_some() => {
                    if !delivered {
                        sender = None;
                    }
                }
                frame = self.framed.next(), if pending.is_none() && !body_done => match frame {
                    Some(Ok(RequestFrame::Body(chunk))) => {
                        if sender.is_some() {
                            pending = Some(chunk);
                        }
                    }
                    Some(Ok(RequestFrame::End)) => {
                        body_done = true;
                        sender = None;
                    }
                    Some(Ok(RequestFrame::Head(_))) => {
                        let error = CodecError::Malformed("request head inside a body".into());
                        return Err(self.reject_codec(error).await);
                    }
                    Some(Err(error)) => return Err(self.reject_codec(error).await),
                    None => return Err(CodecError::Io(unexpected_eof()).into()),
                },
            }
        };

        Ok((result, body_done))
    }

    /// Discards whatever the handler left unread of the current body.
    async fn drain_body(&mut self) -> Result<(), PipelineError> {
        loop {
            match self.framed.next().await {
                Some(Ok(RequestFrame::Body(_))) => {}
                Some(Ok(RequestFrame::End)) => return Ok(()),
                Some(Ok(RequestFrame::Head(_))) => {
                    return Err(CodecError::Malformed("request head inside a body".into()).into())
                }
                Some(Err(error)) => return Err(self.reject_codec(error).await),
                None => return Err(CodecError::Io(unexpected_eof()).into()),
            }
        }
    }

    async fn respond(
        &mut self,
        response: Response<Bytes>,
        version: Version,
        keep_alive: bool,
    ) -> Result<(), PipelineError> {
        let mut response = match self.compressor.as_mut() {
            Some(compressor) => compressor.encode(response),
            None => response,
        };
        *response.version_mut() = version;
        if !keep_alive {
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        } else if version == Version::HTTP_10 {
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        debug!(status = %response.status(), "Writing response");
        self.framed.send(ResponseFrame::Full(response)).await?;
        Ok(())
    }

    /// Best-effort error response ahead of closing the connection.
    async fn reject(&mut self, status: StatusCode) {
        let mut response = plain_response(status, status.canonical_reason().unwrap_or_default());
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        if let Err(error) = self.framed.send(ResponseFrame::Full(response)).await {
            debug!(%error, %status, "Failed to write rejection");
        }
    }

    async fn reject_codec(&mut self, error: CodecError) -> PipelineError {
        match error.status() {
            Some(status) => {
                debug!(%error, "Rejecting request");
                self.reject(status).await;
            }
            None => debug!(%error, "Connection failed"),
        }
        error.into()
    }
}

async fn deliver(sender: &Option<mpsc::Sender<Bytes>>, pending: &mut Option<Bytes>) -> bool {
    let Some(sender) = sender else {
        *pending = None;
        return false;
    };
    match sender.reserve().await {
        Ok(permit) => {
            if let Some(chunk) = pending.take() {
                permit.send(chunk);
            }
            true
        }
        // Handler stopped reading; the rest of the body is discarded.
        Err(_) => {
            *pending = None;
            false
        }
    }
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    };
    if version == Version::HTTP_10 {
        has_token("keep-alive")
    } else {
        !has_token("close")
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-request")
}

fn plain_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn error_response(error: &HandlerError) -> Response<Bytes> {
    plain_response(error.status(), &error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Read,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(compression: bool, aggregation: bool) -> PipelineConfig {
        PipelineConfig {
            compression_enabled: compression,
            aggregation_enabled: aggregation,
            max_aggregated_content_length: 1024,
            compression_min_size: 64,
        }
    }

    fn chunked_request(chunks: &[usize]) -> Vec<u8> {
        let mut request = b"POST /submit HTTP/1.1\r\nHost: master\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for size in chunks {
            request.extend_from_slice(format!("{size:x}\r\n").as_bytes());
            request.extend(std::iter::repeat(b'a').take(*size));
            request.extend_from_slice(b"\r\n");
        }
        request.extend_from_slice(b"0\r\n\r\n");
        request
    }

    struct Exchange {
        response: Vec<u8>,
        result: Result<(), PipelineError>,
        calls: usize,
    }

    impl Exchange {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.response).into_owned()
        }

        fn body(&self) -> &[u8] {
            let split = self
                .response
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .expect("response has no head");
            &self.response[split + 4..]
        }
    }

    /// Sends `request`, closes the client's write side and reads until the
    /// pipeline closes the connection.
    async fn exchange(config: PipelineConfig, request: &[u8]) -> Exchange {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let handler = handler_fn(move |request: Request<RequestBody>| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                let body = request.into_body().collect().await;
                Ok(Response::new(Bytes::from(format!("received {}", body.len()))))
            }
        });

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let pipeline = PipelineBuilder::build(&config);
        let serving = tokio::spawn(async move { pipeline.serve(server, &handler).await });

        client.write_all(request).await.unwrap();
        let _ = client.shutdown().await;
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .expect("pipeline did not close the connection")
            .unwrap();
        let result = serving.await.unwrap();

        Exchange {
            response,
            result,
            calls: calls.load(Ordering::SeqCst),
        }
    }

    #[test]
    fn test_stage_order_for_every_flag_combination() {
        let cases = [
            (false, false, vec![Stage::Decode, Stage::Dispatch]),
            (
                true,
                false,
                vec![Stage::Decode, Stage::Compress { min_size: 64 }, Stage::Dispatch],
            ),
            (
                false,
                true,
                vec![
                    Stage::Decode,
                    Stage::Aggregate {
                        max_content_length: 1024,
                    },
                    Stage::Dispatch,
                ],
            ),
            (
                true,
                true,
                vec![
                    Stage::Decode,
                    Stage::Compress { min_size: 64 },
                    Stage::Aggregate {
                        max_content_length: 1024,
                    },
                    Stage::Dispatch,
                ],
            ),
        ];

        for (compression, aggregation, expected) in cases {
            let config = config(compression, aggregation);
            let pipeline = PipelineBuilder::build(&config);
            assert_eq!(pipeline.stages(), expected.as_slice());
            assert_eq!(pipeline, PipelineBuilder::build(&config));
        }
    }

    #[tokio::test]
    async fn test_aggregates_chunked_request_within_bound() {
        let exchange = exchange(config(false, true), &chunked_request(&[300, 300, 300])).await;

        assert!(exchange.result.is_ok());
        assert_eq!(exchange.calls, 1);
        assert!(exchange.text().starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(exchange.body(), b"received 900");
    }

    #[tokio::test]
    async fn test_rejects_request_over_bound() {
        let exchange = exchange(config(false, true), &chunked_request(&[300, 300, 300, 300])).await;

        assert!(matches!(
            exchange.result,
            Err(PipelineError::RequestTooLarge {
                limit: 1024,
                received: 1200
            })
        ));
        assert_eq!(exchange.calls, 0);
        assert!(exchange.text().starts_with("HTTP/1.1 413 "));
        assert!(exchange.text().contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_streams_body_without_aggregation() {
        let exchange = exchange(config(false, false), &chunked_request(&[300, 300, 300, 300])).await;

        assert!(exchange.result.is_ok());
        assert_eq!(exchange.calls, 1);
        assert_eq!(exchange.body(), b"received 1200");
    }

    #[tokio::test]
    async fn test_keep_alive_serves_pipelined_requests() {
        let mut request = b"GET /a HTTP/1.1\r\n\r\n".to_vec();
        request.extend_from_slice(&chunked_request(&[10]));
        let exchange = exchange(config(false, false), &request).await;

        assert!(exchange.result.is_ok());
        assert_eq!(exchange.calls, 2);
        assert_eq!(exchange.text().matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn test_connection_close_is_honoured() {
        let request = b"GET /a HTTP/1.1\r\nConnection: close\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let exchange = exchange(config(false, true), request).await;

        assert_eq!(exchange.calls, 1);
        assert!(exchange.text().contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_http10_closes_by_default() {
        let exchange = exchange(config(false, true), b"GET /a HTTP/1.0\r\n\r\nGET /b HTTP/1.0\r\n\r\n").await;

        assert_eq!(exchange.calls, 1);
        assert!(exchange.text().starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_expect_continue_is_answered() {
        let request =
            b"POST /submit HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\nbody";
        let exchange = exchange(config(false, true), request).await;

        assert!(exchange
            .text()
            .starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let exchange = exchange(config(true, true), b"BROKEN\r\n\r\n").await;

        assert!(matches!(exchange.result, Err(PipelineError::Codec(_))));
        assert_eq!(exchange.calls, 0);
        assert!(exchange.text().starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_compresses_when_accepted() {
        let request = b"GET /a HTTP/1.1\r\nAccept-Encoding: gzip\r\nContent-Length: 100\r\n\r\n";
        let mut request = request.to_vec();
        request.extend_from_slice(&[b'z'; 100]);

        let handler = handler_fn(|request: Request<RequestBody>| async move {
            let body = request.into_body().collect().await;
            Ok(Response::new(body))
        });
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let pipeline = PipelineBuilder::build(&config(true, true));
        let serving = tokio::spawn(async move { pipeline.serve(server, &handler).await });

        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        serving.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("content-encoding: gzip\r\n"));
        assert!(text.contains("vary: accept-encoding\r\n"));

        let split = response
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .unwrap();
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&response[split + 4..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, vec![b'z'; 100]);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_500() {
        let handler = handler_fn(|_request: Request<RequestBody>| async move {
            Err::<Response<Bytes>, _>(HandlerError::new("scheduler unavailable"))
        });
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let pipeline = PipelineBuilder::build(&config(false, true));
        let serving = tokio::spawn(async move { pipeline.serve(server, &handler).await });

        client
            .write_all(b"GET /jobs HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        serving.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.ends_with("scheduler unavailable"));
    }

    #[tokio::test]
    async fn test_drain_closes_idle_keep_alive_connection() {
        let handler = handler_fn(|_request: Request<RequestBody>| async {
            Ok::<_, HandlerError>(Response::new(Bytes::from_static(b"ok")))
        });
        let drain = CancellationToken::new();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let pipeline = PipelineBuilder::build(&config(false, true));
        let serving = {
            let drain = drain.clone();
            tokio::spawn(async move { pipeline.serve_until_drained(server, &handler, drain).await })
        };

        client.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        while !response.ends_with(b"\r\n\r\nok") {
            let mut chunk = [0u8; 256];
            let read = client.read(&mut chunk).await.unwrap();
            assert!(read > 0, "connection closed before the response");
            response.extend_from_slice(&chunk[..read]);
        }
        assert!(!String::from_utf8_lossy(&response).contains("connection: close"));

        drain.cancel();
        let served = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("idle connection was not closed on drain")
            .unwrap();
        assert!(served.is_ok());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_response_during_drain_closes_connection() {
        let drain = CancellationToken::new();
        let handler = {
            let drain = drain.clone();
            handler_fn(move |_request: Request<RequestBody>| {
                let drain = drain.clone();
                async move {
                    drain.cancel();
                    Ok::<_, HandlerError>(Response::new(Bytes::from_static(b"late")))
                }
            })
        };
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let pipeline = PipelineBuilder::build(&config(false, true));
        let serving =
            tokio::spawn(async move { pipeline.serve_until_drained(server, &handler, drain).await });

        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut response))
            .await
            .expect("connection stayed open after drain")
            .unwrap();
        serving.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&response);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 1);
        assert!(text.contains("connection: close\r\n"));
    }
}
