//! Request handlers behind the router
//! Static files are served read-only, WebDAV is delegated to dav-server

use async_trait::async_trait;
use bytes::Bytes;
use dav_server::localfs::LocalFs;
use dav_server::memls::MemLs;
use dav_server::{DavHandler, DavMethodSet};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Body type handed to handlers
pub type RequestBody = UnsyncBoxBody<Bytes, io::Error>;

/// Body type produced by handlers
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Anything that can answer a routed request
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<RequestBody>) -> Response<ResponseBody>;
}

/// Read-only file server for the static tree
pub struct StaticFiles {
    root: PathBuf,
    dav: DavHandler,
}

impl StaticFiles {
    /// Create a new static file handler rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let dav = DavHandler::builder()
            .filesystem(LocalFs::new(&root, false, false, false))
            .methods(DavMethodSet::HTTP_RO)
            .autoindex(true)
            .indexfile("index.html".to_string())
            .build_handler();

        info!(root = %root.display(), "Static files");
        Self { root, dav }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Handler for StaticFiles {
    async fn handle(&self, req: Request<RequestBody>) -> Response<ResponseBody> {
        self.dav.handle(req).await.map(|body| body.boxed_unsync())
    }
}

/// WebDAV share over a local directory
pub struct WebDav {
    root: PathBuf,
    dav: DavHandler,
}

impl WebDav {
    /// Create a new WebDAV handler serving `root` under the URL `prefix`
    pub fn new<P: AsRef<Path>>(root: P, prefix: &str) -> Self {
        let root = root.as_ref().to_path_buf();
        let dav = DavHandler::builder()
            .strip_prefix(prefix.trim_end_matches('/').to_string())
            .filesystem(LocalFs::new(&root, false, false, false))
            .locksystem(MemLs::new())
            .build_handler();

        info!(root = %root.display(), prefix = %prefix, "WebDAV share");
        Self { root, dav }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Handler for WebDav {
    async fn handle(&self, req: Request<RequestBody>) -> Response<ResponseBody> {
        self.dav.handle(req).await.map(|body| body.boxed_unsync())
    }
}

/// Create a plain-text response
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create a full body
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create an empty body
pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
