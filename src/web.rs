// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Read-only HTTP surface for the recordings directory.
//!
//! Exists solely so the inference endpoint can fetch clips by URL:
//! `GET /recordings/<stream_key>/<YYYYMMDD>/<file>.ts`, CORS open to any
//! origin, no auth, nothing writable.

use base::{err, Error, ErrorKind};
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use http_serve::dir::FsDir;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = UnsyncBoxBody<Bytes, BoxedError>;

fn full_body<B: Into<Bytes>>(body: B) -> Body {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn plain_response<B: Into<Bytes>>(status: StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(full_body(body))
        .expect("hardcoded head should be valid")
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidArgument | ErrorKind::FailedPrecondition => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Rejects anything but a plain relative path under `/recordings/`.
fn parse_recording_path(path: &str) -> Option<&str> {
    let rel = path.strip_prefix("/recordings/")?;
    if rel.is_empty() {
        return None;
    }
    if rel
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return None;
    }
    Some(rel)
}

fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("ts") => "video/mp2t",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

pub struct Service {
    dir: Arc<FsDir>,
}

impl Service {
    pub fn new(recordings_dir: &Path) -> Result<Self, Error> {
        // The detector usually creates this first; serve an empty tree
        // rather than failing when the analyser starts alone.
        std::fs::create_dir_all(recordings_dir)?;
        let dir = FsDir::builder().for_path(recordings_dir).map_err(|e| {
            err!(
                Internal,
                msg("unable to open recordings dir {}", recordings_dir.display()),
                source(e)
            )
        })?;
        info!("serving recordings from {}", recordings_dir.display());
        Ok(Service { dir })
    }

    pub async fn serve<B>(
        self: Arc<Self>,
        req: Request<B>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let mut response = match *req.method() {
            // Preflight for the CORS-open GET surface.
            Method::OPTIONS => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("GET, HEAD"),
                )
                .header(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"))
                .body(full_body(""))
                .expect("hardcoded head should be valid"),
            Method::GET | Method::HEAD => match self.file(&req).await {
                Ok(response) => response,
                Err(e) => plain_response(status_for(e.kind()), e.to_string()),
            },
            _ => plain_response(StatusCode::METHOD_NOT_ALLOWED, "GET only"),
        };
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        Ok(response)
    }

    async fn file<B>(&self, req: &Request<B>) -> Result<Response<Body>, Error> {
        let Some(rel) = parse_recording_path(req.uri().path()) else {
            return Err(err!(NotFound, msg("no such recording")));
        };
        let node = self
            .dir
            .clone()
            .get(rel, req.headers())
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    err!(NotFound, msg("no such recording"))
                } else {
                    Error::wrap(ErrorKind::Internal, e)
                }
            })?;
        let mut hdrs = http::HeaderMap::new();
        node.add_encoding_headers(&mut hdrs);
        hdrs.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime_for(rel)));
        let entity = node
            .into_file_entity(hdrs)
            .map_err(|e| Error::wrap(ErrorKind::Internal, e))?;
        Ok(http_serve::serve(entity, req).map(|body| body.boxed_unsync()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn service(tmp: &Path) -> Arc<Service> {
        base::tracing_setup::install_for_tests();
        let day = tmp.join("cam1").join("20250101");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("cam1_120000.ts"), b"mpegts bytes").unwrap();
        Arc::new(Service::new(tmp).unwrap())
    }

    fn request(method: Method, path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Empty::new())
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_recording_with_cors() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let resp = svc
            .serve(request(Method::GET, "/recordings/cam1/20250101/cam1_120000.ts"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "video/mp2t");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"mpegts bytes");
    }

    #[tokio::test]
    async fn unknown_file_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let resp = svc
            .serve(request(Method::GET, "/recordings/cam1/20250101/nope.ts"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        for path in [
            "/recordings/../secret.txt",
            "/recordings/a//b.ts",
            "/recordings/./x.ts",
            "/recordings/",
            "/other/cam1.ts",
        ] {
            let resp = svc.clone().serve(request(Method::GET, path)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "path {path}");
        }
    }

    #[tokio::test]
    async fn writes_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let resp = svc
            .serve(request(Method::POST, "/recordings/cam1/20250101/cam1_120000.ts"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_recording_path("/recordings/cam1/20250101/a.ts"),
            Some("cam1/20250101/a.ts")
        );
        assert_eq!(parse_recording_path("/recordings/.."), None);
        assert_eq!(parse_recording_path("/recordings"), None);
        assert_eq!(parse_recording_path("/x/a.ts"), None);
    }

    #[test]
    fn mime_mapping() {
        assert_eq!(mime_for("cam1/a.ts"), "video/mp2t");
        assert_eq!(mime_for("cam1/a.mp4"), "video/mp4");
        assert_eq!(mime_for("cam1/raw"), "application/octet-stream");
    }
}
