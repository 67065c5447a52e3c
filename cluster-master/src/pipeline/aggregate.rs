use bytes::{Bytes, BytesMut};
use http::{
    header::{CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING},
    request, HeaderValue, Request, Version,
};

use super::codec::{declared_length, RequestFrame};
use crate::error::{CodecError, PipelineError};

#[derive(Debug)]
pub enum Aggregated {
    /// More frames are needed.
    Pending,
    /// The client is waiting for `100 Continue` before sending the body.
    Continue,
    Complete(Request<Bytes>),
}

/// Collects the frames of one request into a single bounded request.
#[derive(Debug)]
pub struct Aggregator {
    max_content_length: usize,
    head: Option<request::Parts>,
    body: BytesMut,
}

impl Aggregator {
    pub fn new(max_content_length: usize) -> Self {
        Self {
            max_content_length,
            head: None,
            body: BytesMut::new(),
        }
    }

    pub fn push(&mut self, frame: RequestFrame) -> Result<Aggregated, PipelineError> {
        match frame {
            RequestFrame::Head(mut head) => {
                if let Some(declared) = declared_length(&head.headers)? {
                    if declared > self.max_content_length as u64 {
                        return Err(self.too_large(usize::try_from(declared).unwrap_or(usize::MAX)));
                    }
                }

                let expects_continue = head
                    .headers
                    .remove(EXPECT)
                    .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"));
                let answer = if expects_continue && head.version == Version::HTTP_11 {
                    Aggregated::Continue
                } else {
                    Aggregated::Pending
                };

                self.body.clear();
                self.head = Some(head);
                Ok(answer)
            }
            RequestFrame::Body(chunk) => {
                let received = self.body.len() + chunk.len();
                if received > self.max_content_length {
                    return Err(self.too_large(received));
                }
                self.body.extend_from_slice(&chunk);
                Ok(Aggregated::Pending)
            }
            RequestFrame::End => {
                let Some(mut head) = self.head.take() else {
                    return Err(CodecError::Malformed("request ended before its head".into()).into());
                };
                let body = self.body.split().freeze();
                head.headers.remove(TRANSFER_ENCODING);
                head.headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                Ok(Aggregated::Complete(Request::from_parts(head, body)))
            }
        }
    }

    fn too_large(&mut self, received: usize) -> PipelineError {
        self.head = None;
        self.body.clear();
        PipelineError::RequestTooLarge {
            limit: self.max_content_length,
            received,
        }
    }
}
