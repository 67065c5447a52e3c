//! Response compression negotiated from `Accept-Encoding`.

use std::{collections::VecDeque, io, io::Write};

use bytes::Bytes;
use flate2::{
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use http::{
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, VARY},
    request, HeaderValue, Method, Response, StatusCode,
};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

const ZSTD_LEVEL: i32 = 3;
/// Bodies at least this large are compressed outside the async worker's
/// scheduling budget.
pub const BLOCKING_ENCODE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Zstd,
    Gzip,
    Deflate,
}

impl ContentCoding {
    /// Server preference, used to break ties between equal q-values.
    pub const PREFERENCE: [ContentCoding; 3] =
        [ContentCoding::Zstd, ContentCoding::Gzip, ContentCoding::Deflate];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCoding::Zstd => "zstd",
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
        }
    }

    /// Picks the coding the client ranks highest.
    ///
    /// `*` stands for every coding the client did not name. A q-value of
    /// zero excludes a coding.
    pub fn negotiate(accept_encoding: &str) -> Option<ContentCoding> {
        let mut named = [None::<f32>; 3];
        let mut wildcard = None::<f32>;

        for item in accept_encoding.split(',') {
            let mut params = item.split(';');
            let name = params.next().unwrap_or_default().trim().to_ascii_lowercase();
            let quality = params
                .filter_map(|param| {
                    let (key, value) = param.split_once('=')?;
                    key.trim()
                        .eq_ignore_ascii_case("q")
                        .then(|| value.trim().parse::<f32>().unwrap_or(0.0))
                })
                .next()
                .unwrap_or(1.0);

            match name.as_str() {
                "zstd" => named[0] = Some(quality),
                "gzip" | "x-gzip" => named[1] = Some(quality),
                "deflate" => named[2] = Some(quality),
                "*" => wildcard = Some(quality),
                _ => {}
            }
        }

        let mut best: Option<(ContentCoding, f32)> = None;
        for (coding, quality) in Self::PREFERENCE.iter().zip(named) {
            let Some(quality) = quality.or(wildcard) else {
                continue;
            };
            if quality <= 0.0 {
                continue;
            }
            if best.map_or(true, |(_, current)| quality > current) {
                best = Some((*coding, quality));
            }
        }
        best.map(|(coding, _)| coding)
    }

    pub fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            ContentCoding::Zstd => zstd::encode_all(data, ZSTD_LEVEL),
            ContentCoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            ContentCoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

/// Outbound half of the compression stage.
///
/// Requests are observed in arrival order and responses leave in the same
/// order, so a FIFO pairs each response with its request's preference.
#[derive(Debug)]
pub struct Compressor {
    min_size: usize,
    pending: VecDeque<Option<ContentCoding>>,
}

impl Compressor {
    pub fn new(min_size: usize) -> Self {
        Self {
            min_size,
            pending: VecDeque::new(),
        }
    }

    pub fn observe(&mut self, head: &request::Parts) {
        let coding = if head.method == Method::HEAD {
            None
        } else {
            let accepted: Vec<&str> = head
                .headers
                .get_all(ACCEPT_ENCODING)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            ContentCoding::negotiate(&accepted.join(","))
        };
        self.pending.push_back(coding);
    }

    pub fn encode(&mut self, response: Response<Bytes>) -> Response<Bytes> {
        let coding = self.pending.pop_front().flatten();
        let (mut parts, body) = response.into_parts();

        if !carries_body(parts.status) || parts.headers.contains_key(CONTENT_ENCODING) {
            return Response::from_parts(parts, body);
        }
        parts
            .headers
            .append(VARY, HeaderValue::from_static("accept-encoding"));

        let Some(coding) = coding else {
            return Response::from_parts(parts, body);
        };
        if body.len() < self.min_size {
            return Response::from_parts(parts, body);
        }

        match encode_body(coding, &body) {
            Ok(encoded) => {
                debug!(
                    coding = coding.as_str(),
                    original = body.len(),
                    encoded = encoded.len(),
                    "Compressed response"
                );
                parts
                    .headers
                    .insert(CONTENT_ENCODING, HeaderValue::from_static(coding.as_str()));
                parts.headers.remove(CONTENT_LENGTH);
                Response::from_parts(parts, Bytes::from(encoded))
            }
            Err(error) => {
                warn!(coding = coding.as_str(), %error, "Compression failed, sending identity");
                Response::from_parts(parts, body)
            }
        }
    }
}

/// Large bodies are encoded inside `block_in_place`. Current-thread
/// runtimes do not support it and encode inline.
fn encode_body(coding: ContentCoding, body: &[u8]) -> io::Result<Vec<u8>> {
    let multi_thread = Handle::try_current()
        .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
    if multi_thread && body.len() >= BLOCKING_ENCODE_SIZE {
        tokio::task::block_in_place(|| coding.encode(body))
    } else {
        coding.encode(body)
    }
}

fn carries_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
