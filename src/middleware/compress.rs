//! Response compression middleware.
//!
//! Elects brotli (preferred when explicitly accepted or `*`) or gzip from
//! `Accept-Encoding`. The response body is buffered up to `minSize`; once
//! the threshold is crossed the compressed stream starts, `Content-Length`
//! is dropped and `Vary: Accept-Encoding` is set. Responses below the
//! threshold, excluded media types (`application/grpc` always) and
//! already-encoded responses pass through with `Content-Encoding:
//! identity`. HEAD requests bypass compression entirely.

use super::brotli::{Encoder, DEFAULT_BROTLI_QUALITY};
use crate::config::dynamic::Compress;
use crate::error::{Error, Result};
use crate::http::{HttpHandler, SharedHandler};
use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use hyper::{Body, Method, Request, Response};
use std::sync::Arc;
use tracing::debug;

/// Default minimum size before compression kicks in. Below one network
/// packet the saved bytes do not shrink the transmission.
pub const DEFAULT_MIN_SIZE: usize = 1024;

#[derive(Clone, Copy, PartialEq)]
enum Election {
    Brotli,
    Gzip,
    None,
}

pub struct CompressHandler {
    next: SharedHandler,
    excludes: Vec<String>,
    min_size: usize,
}

impl CompressHandler {
    pub fn new(config: &Compress, next: SharedHandler) -> Result<Arc<Self>> {
        let mut excludes = vec!["application/grpc".to_string()];
        for value in &config.excluded_content_types {
            let media_type = parse_media_type(value)
                .ok_or_else(|| Error::config(format!("invalid media type '{}'", value)))?;
            excludes.push(media_type);
        }

        Ok(Arc::new(Self {
            next,
            excludes,
            min_size: config.min_response_body_bytes.unwrap_or(DEFAULT_MIN_SIZE),
        }))
    }

    fn elect(&self, req: &Request<Body>) -> Election {
        let accept = req
            .headers()
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim();
        if accept.is_empty() {
            return Election::None;
        }
        if accepts_encoding(accept, "br") {
            return Election::Brotli;
        }
        if accepts_encoding(accept, "gzip") {
            return Election::Gzip;
        }
        Election::None
    }

    fn is_excluded(&self, content_type: Option<&HeaderValue>) -> bool {
        let Some(value) = content_type.and_then(|v| v.to_str().ok()) else {
            return false;
        };
        match parse_media_type(value) {
            Some(media_type) => self.excludes.iter().any(|e| *e == media_type),
            None => false,
        }
    }

    async fn compress_response(&self, resp: Response<Body>, election: Election) -> Response<Body> {
        let (mut parts, mut body) = resp.into_parts();

        if parts.headers.contains_key(CONTENT_ENCODING) {
            return Response::from_parts(parts, body);
        }

        if self.is_excluded(parts.headers.get(CONTENT_TYPE)) {
            parts
                .headers
                .insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
            return Response::from_parts(parts, body);
        }

        // Buffer until the threshold is crossed or the body ends.
        let mut buffered: Vec<u8> = Vec::new();
        let mut ended = false;
        while buffered.len() < self.min_size {
            match body.data().await {
                Some(Ok(chunk)) => buffered.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    debug!("Upstream body failed while buffering: {}", e);
                    ended = true;
                    break;
                }
                None => {
                    ended = true;
                    break;
                }
            }
        }

        if ended {
            // Below threshold: identity, with an exact length.
            parts
                .headers
                .insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
            parts.headers.insert(
                CONTENT_LENGTH,
                HeaderValue::from_str(&buffered.len().to_string())
                    .unwrap_or(HeaderValue::from_static("0")),
            );
            return Response::from_parts(parts, Body::from(buffered));
        }

        // Compression starts: fix the headers before the first byte.
        let mut encoder = match election {
            Election::Brotli => Encoder::brotli(DEFAULT_BROTLI_QUALITY),
            Election::Gzip => Encoder::gzip(),
            Election::None => unreachable!("election checked before buffering"),
        };
        parts.headers.remove(CONTENT_LENGTH);
        parts
            .headers
            .insert(VARY, HeaderValue::from_static("Accept-Encoding"));
        parts.headers.insert(
            CONTENT_ENCODING,
            HeaderValue::from_static(encoder.encoding()),
        );

        let (mut sender, out_body) = Body::channel();
        tokio::spawn(async move {
            match encoder.write(&buffered) {
                Ok(bytes) if !bytes.is_empty() => {
                    if sender.send_data(bytes.into()).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(_) => return,
            }

            loop {
                match body.data().await {
                    Some(Ok(chunk)) => {
                        let produced = match encoder.write(&chunk).and_then(|mut out| {
                            out.extend(encoder.flush()?);
                            Ok(out)
                        }) {
                            Ok(produced) => produced,
                            Err(_) => return,
                        };
                        if !produced.is_empty()
                            && sender.send_data(produced.into()).await.is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Upstream body failed mid-stream: {}", e);
                        sender.abort();
                        return;
                    }
                    None => break,
                }
            }

            if let Ok(tail) = encoder.finish() {
                if !tail.is_empty() {
                    let _ = sender.send_data(tail.into()).await;
                }
            }
        });

        Response::from_parts(parts, out_body)
    }
}

#[async_trait]
impl HttpHandler for CompressHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.method() == Method::HEAD {
            return self.next.handle(req).await;
        }

        if self.is_excluded(req.headers().get(CONTENT_TYPE)) {
            return self.next.handle(req).await;
        }

        let election = self.elect(&req);
        if election == Election::None {
            return self.next.handle(req).await;
        }

        let resp = self.next.handle(req).await;
        self.compress_response(resp, election).await
    }
}

/// Naive check whether an encoding is acceptable; `*` accepts anything.
fn accepts_encoding(accept_encoding: &str, encoding: &str) -> bool {
    accept_encoding.split(',').any(|part| {
        let name = part.trim().split(';').next().unwrap_or("");
        name == encoding || name == "*"
    })
}

/// Parse a media type down to its lowercased `type/subtype` form.
fn parse_media_type(value: &str) -> Option<String> {
    let media_type = value.split(';').next()?.trim().to_ascii_lowercase();
    let (kind, subtype) = media_type.split_once('/')?;
    if kind.is_empty() || subtype.is_empty() {
        return None;
    }
    Some(media_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct FixedResponse {
        body: Vec<u8>,
        content_type: &'static str,
    }

    #[async_trait]
    impl HttpHandler for FixedResponse {
        async fn handle(&self, _req: Request<Body>) -> Response<Body> {
            Response::builder()
                .header(CONTENT_TYPE, self.content_type)
                .header(CONTENT_LENGTH, self.body.len())
                .body(Body::from(self.body.clone()))
                .unwrap()
        }
    }

    fn handler(body: Vec<u8>, content_type: &'static str) -> Arc<CompressHandler> {
        CompressHandler::new(
            &Compress::default(),
            Arc::new(FixedResponse { body, content_type }),
        )
        .unwrap()
    }

    fn request(accept_encoding: &str, method: Method) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("http://x/");
        if !accept_encoding.is_empty() {
            builder = builder.header(ACCEPT_ENCODING, accept_encoding);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn brotli_decode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_brotli_round_trip_above_threshold() {
        let payload = b"abcdefgh".repeat(1000);
        let handler = handler(payload.clone(), "text/plain");

        let resp = handler.handle(request("br", Method::GET)).await;
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "br");
        assert_eq!(resp.headers().get(VARY).unwrap(), "Accept-Encoding");
        assert!(resp.headers().get(CONTENT_LENGTH).is_none());

        let compressed = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(brotli_decode(&compressed), payload);
    }

    #[tokio::test]
    async fn test_wildcard_prefers_brotli() {
        let payload = b"abcdefgh".repeat(1000);
        let handler = handler(payload, "text/plain");
        let resp = handler.handle(request("*", Method::GET)).await;
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "br");
    }

    #[tokio::test]
    async fn test_gzip_fallback() {
        let payload = b"abcdefgh".repeat(1000);
        let handler = handler(payload.clone(), "text/plain");
        let resp = handler
            .handle(request("gzip, deflate", Method::GET))
            .await;
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "gzip");

        let compressed = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_below_threshold_is_identity() {
        let payload = b"tiny".to_vec();
        let handler = handler(payload.clone(), "text/plain");
        let resp = handler.handle(request("br", Method::GET)).await;
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "identity");
        assert_eq!(
            resp.headers().get(CONTENT_LENGTH).unwrap(),
            &payload.len().to_string()
        );
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_grpc_always_excluded() {
        let payload = b"abcdefgh".repeat(1000);
        let handler = handler(payload, "application/grpc");
        let resp = handler.handle(request("br", Method::GET)).await;
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "identity");
    }

    #[tokio::test]
    async fn test_head_bypasses_compression() {
        let payload = b"abcdefgh".repeat(1000);
        let handler = handler(payload, "text/plain");
        let resp = handler.handle(request("br", Method::HEAD)).await;
        assert!(resp.headers().get(CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_no_accept_encoding_passes_through() {
        let payload = b"abcdefgh".repeat(1000);
        let handler = handler(payload, "text/plain");
        let resp = handler.handle(request("", Method::GET)).await;
        assert!(resp.headers().get(CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_configured_exclusion() {
        let payload = b"abcdefgh".repeat(1000);
        let compress = Compress {
            excluded_content_types: vec!["image/png".to_string()],
            min_response_body_bytes: None,
        };
        let handler = CompressHandler::new(
            &compress,
            Arc::new(FixedResponse {
                body: payload,
                content_type: "image/png",
            }),
        )
        .unwrap();
        let resp = handler.handle(request("br", Method::GET)).await;
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "identity");
    }
}
