//! HTTP/1.x framing for the control listener.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{
    header::{CONTENT_LENGTH, TRANSFER_ENCODING},
    request, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri,
    Version,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Largest request line plus headers accepted before answering 431.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug)]
pub enum RequestFrame {
    Head(request::Parts),
    Body(Bytes),
    End,
}

#[derive(Debug)]
pub enum ResponseFrame {
    Continue,
    Full(Response<Bytes>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    EndPending,
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
}

#[derive(Debug)]
pub struct HttpCodec {
    state: DecodeState,
}

impl HttpCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
        }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<RequestFrame>, CodecError> {
        // Stray CRLFs between pipelined requests are allowed.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let head_len = match parsed
            .parse(src)
            .map_err(|error| CodecError::Malformed(error.to_string()))?
        {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial if src.len() > MAX_HEAD_SIZE => {
                return Err(CodecError::HeadTooLarge {
                    limit: MAX_HEAD_SIZE,
                })
            }
            httparse::Status::Partial => return Ok(None),
        };
        if head_len > MAX_HEAD_SIZE {
            return Err(CodecError::HeadTooLarge {
                limit: MAX_HEAD_SIZE,
            });
        }

        let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
            .map_err(|error| CodecError::Malformed(error.to_string()))?;
        let uri: Uri = parsed
            .path
            .unwrap_or_default()
            .parse()
            .map_err(|error: http::uri::InvalidUri| CodecError::Malformed(error.to_string()))?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|error| CodecError::Malformed(error.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|error| CodecError::Malformed(error.to_string()))?;
            header_map.append(name, value);
        }

        self.state = body_framing(&header_map)?;
        src.advance(head_len);

        let (mut parts, ()) = Request::new(()).into_parts();
        parts.method = method;
        parts.uri = uri;
        parts.version = version;
        parts.headers = header_map;
        Ok(Some(RequestFrame::Head(parts)))
    }
}

impl Default for HttpCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Declared `Content-Length`, if any. Conflicting values are malformed.
pub fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let mut declared = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .filter(|text| !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or_else(|| CodecError::Malformed("invalid content-length".to_string()))?;
        match declared {
            Some(previous) if previous != length => {
                return Err(CodecError::Malformed(
                    "conflicting content-length values".to_string(),
                ))
            }
            _ => declared = Some(length),
        }
    }
    Ok(declared)
}

fn is_chunked(headers: &HeaderMap) -> Result<bool, CodecError> {
    let mut last = None;
    for value in headers.get_all(TRANSFER_ENCODING) {
        let text = value
            .to_str()
            .map_err(|_| CodecError::Malformed("invalid transfer-encoding".to_string()))?;
        if let Some(coding) = text.rsplit(',').map(str::trim).find(|c| !c.is_empty()) {
            last = Some(coding.to_ascii_lowercase());
        }
    }
    match last.as_deref() {
        None => Ok(false),
        Some("chunked") => Ok(true),
        Some(other) => Err(CodecError::Malformed(format!(
            "unsupported transfer-encoding {other}"
        ))),
    }
}

fn body_framing(headers: &HeaderMap) -> Result<DecodeState, CodecError> {
    let chunked = is_chunked(headers)?;
    let declared = declared_length(headers)?;
    match (chunked, declared) {
        (true, Some(_)) => Err(CodecError::Malformed(
            "both content-length and transfer-encoding present".to_string(),
        )),
        (true, None) => Ok(DecodeState::ChunkSize),
        (false, Some(0)) | (false, None) => Ok(DecodeState::EndPending),
        (false, Some(remaining)) => Ok(DecodeState::Fixed { remaining }),
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|window| window == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, CodecError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| CodecError::Malformed("invalid chunk size".to_string()))?;
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(CodecError::Malformed("empty chunk size".to_string()));
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| CodecError::Malformed(format!("invalid chunk size {size:?}")))
}

fn take_body(src: &mut BytesMut, remaining: u64) -> Bytes {
    let available = src.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
    src.split_to(available).freeze()
}

impl Decoder for HttpCodec {
    type Item = RequestFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Head => return self.decode_head(src),
                DecodeState::EndPending => {
                    self.state = DecodeState::Head;
                    return Ok(Some(RequestFrame::End));
                }
                DecodeState::Fixed { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let chunk = take_body(src, remaining);
                    let remaining = remaining - chunk.len() as u64;
                    self.state = if remaining == 0 {
                        DecodeState::EndPending
                    } else {
                        DecodeState::Fixed { remaining }
                    };
                    return Ok(Some(RequestFrame::Body(chunk)));
                }
                DecodeState::ChunkSize => {
                    let Some(end) = find_crlf(src) else {
                        if src.len() > MAX_CHUNK_LINE {
                            return Err(CodecError::Malformed("chunk size line too long".into()));
                        }
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&src[..end])?;
                    src.advance(end + 2);
                    self.state = if size == 0 {
                        DecodeState::Trailers
                    } else {
                        DecodeState::ChunkData { remaining: size }
                    };
                }
                DecodeState::ChunkData { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let chunk = take_body(src, remaining);
                    let remaining = remaining - chunk.len() as u64;
                    self.state = if remaining == 0 {
                        DecodeState::ChunkDataEnd
                    } else {
                        DecodeState::ChunkData { remaining }
                    };
                    return Ok(Some(RequestFrame::Body(chunk)));
                }
                DecodeState::ChunkDataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(CodecError::Malformed("missing chunk terminator".into()));
                    }
                    src.advance(2);
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailers => {
                    let Some(end) = find_crlf(src) else {
                        if src.len() > MAX_HEAD_SIZE {
                            return Err(CodecError::HeadTooLarge {
                                limit: MAX_HEAD_SIZE,
                            });
                        }
                        return Ok(None);
                    };
                    src.advance(end + 2);
                    // Trailer fields are read and discarded.
                    if end == 0 {
                        self.state = DecodeState::Head;
                        return Ok(Some(RequestFrame::End));
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.state == DecodeState::Head && src.is_empty() => Ok(None),
            None => Err(CodecError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ))),
        }
    }
}

fn status_line(version: Version) -> &'static [u8] {
    if version == Version::HTTP_10 {
        b"HTTP/1.0 "
    } else {
        b"HTTP/1.1 "
    }
}

fn bodyless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

impl Encoder<ResponseFrame> for HttpCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let response = match item {
            ResponseFrame::Continue => {
                dst.put_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
                return Ok(());
            }
            ResponseFrame::Full(response) => response,
        };

        let (parts, body) = response.into_parts();
        dst.reserve(128 + body.len());
        dst.put_slice(status_line(parts.version));
        dst.put_slice(parts.status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(
            parts
                .status
                .canonical_reason()
                .unwrap_or_default()
                .as_bytes(),
        );
        dst.put_slice(b"\r\n");

        for (name, value) in parts.headers.iter() {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }

        if bodyless(parts.status) {
            dst.put_slice(b"\r\n");
            return Ok(());
        }

        dst.put_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
