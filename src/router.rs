//! Request routing
//! Maps request paths to the static tree or the authenticated WebDAV share

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::Local;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, WWW_AUTHENTICATE};
use hyper::{Request, Response, StatusCode, Uri};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::handlers::{text_response, Handler, RequestBody, ResponseBody};

/// Realm announced in Basic Auth challenges
pub const AUTH_REALM: &str = "davfs";

/// Which handler a route leads to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Static,
    WebDav,
}

/// A path prefix and the handler kind it maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub kind: RouteKind,
}

/// Immutable prefix table built at startup
#[derive(Debug, Clone)]
pub struct RouteTable {
    /// Longest prefix first
    routes: Vec<Route>,
    static_prefix: String,
    embed_prefix: String,
}

impl RouteTable {
    /// Create a new route table
    ///
    /// Prefixes are normalized to end with `/`; `embed_prefix` is prepended
    /// to static paths after the static prefix is stripped.
    pub fn new(static_prefix: &str, dav_prefix: &str, embed_prefix: &str) -> Self {
        let static_prefix = normalize_prefix(static_prefix);
        let mut routes = vec![
            Route {
                prefix: static_prefix.clone(),
                kind: RouteKind::Static,
            },
            Route {
                prefix: normalize_prefix(dav_prefix),
                kind: RouteKind::WebDav,
            },
        ];
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self {
            routes,
            static_prefix,
            embed_prefix: embed_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Longest-prefix match; a prefix also matches its own path without the trailing slash
    pub fn lookup(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| {
            path.starts_with(&route.prefix)
                || (route.prefix.len() > 1 && route.prefix.strip_suffix('/') == Some(path))
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Rewrite a static request path onto the static tree
    pub fn rewrite_static(&self, path: &str) -> String {
        let mut result = path.to_string();

        // Strip the static prefix
        let front = self.static_prefix.trim_end_matches('/');
        if !front.is_empty() {
            if let Some(rest) = result.strip_prefix(front) {
                result = rest.to_string();
            }
        }

        // Prepend the embedding prefix
        if !self.embed_prefix.is_empty() {
            result = format!("{}/{}", self.embed_prefix, result);
        }

        while result.contains("//") {
            result = result.replace("//", "/");
        }

        if !result.starts_with('/') {
            result = format!("/{}", result);
        }

        result
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Basic Auth gate in front of another handler
pub struct AuthGate {
    credentials: Arc<CredentialStore>,
    inner: Arc<dyn Handler>,
}

impl AuthGate {
    pub fn new(credentials: Arc<CredentialStore>, inner: Arc<dyn Handler>) -> Self {
        Self { credentials, inner }
    }

    async fn authorized(&self, presented: Option<(String, String)>) -> bool {
        let Some((username, password)) = presented else {
            return false;
        };

        // bcrypt verification blocks
        let credentials = Arc::clone(&self.credentials);
        let user = username.clone();
        let accepted = tokio::task::spawn_blocking(move || credentials.authenticate(&user, &password))
            .await
            .unwrap_or(false);

        if !accepted {
            warn!(user = %username, "Authentication failed");
        }
        accepted
    }
}

#[async_trait]
impl Handler for AuthGate {
    async fn handle(&self, req: Request<RequestBody>) -> Response<ResponseBody> {
        let presented = basic_credentials(&req);
        if self.authorized(presented).await {
            self.inner.handle(req).await
        } else {
            unauthorized()
        }
    }
}

/// Decode `Authorization: Basic ...` into (username, password)
pub fn basic_credentials<B>(req: &Request<B>) -> Option<(String, String)> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// 401 challenge response
pub fn unauthorized() -> Response<ResponseBody> {
    let mut response = text_response(StatusCode::UNAUTHORIZED, "Unauthorized\n");
    let headers = response.headers_mut();
    if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", AUTH_REALM)) {
        headers.insert(WWW_AUTHENTICATE, challenge);
    }
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    response
}

/// Log one access line for a request
pub fn log_request<B>(req: &Request<B>, remote: SocketAddr) {
    let content_length = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1);

    info!(
        target: "access",
        remote = %remote,
        time = %Local::now().format("%d %b %y %H:%M %z"),
        method = %req.method(),
        path = %req.uri().path(),
        version = ?req.version(),
        content_length,
        "request"
    );
}

/// Dispatches requests according to the route table
pub struct Router {
    table: RouteTable,
    static_files: Arc<dyn Handler>,
    webdav: Arc<dyn Handler>,
}

impl Router {
    /// Create a new router
    ///
    /// With `credentials` set the WebDAV handler sits behind an [`AuthGate`].
    pub fn new(
        table: RouteTable,
        static_files: Arc<dyn Handler>,
        webdav: Arc<dyn Handler>,
        credentials: Option<Arc<CredentialStore>>,
    ) -> Self {
        let webdav = match credentials {
            Some(credentials) => Arc::new(AuthGate::new(credentials, webdav)) as Arc<dyn Handler>,
            None => webdav,
        };

        Self {
            table,
            static_files,
            webdav,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Handler for a request path
    pub fn route(&self, path: &str) -> Option<(RouteKind, Arc<dyn Handler>)> {
        let route = self.table.lookup(path)?;
        let handler = match route.kind {
            RouteKind::Static => Arc::clone(&self.static_files),
            RouteKind::WebDav => Arc::clone(&self.webdav),
        };
        Some((route.kind, handler))
    }

    /// Log, route and answer a request
    pub async fn handle<B>(&self, req: Request<B>, remote: SocketAddr) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        log_request(&req, remote);

        let Some((kind, handler)) = self.route(req.uri().path()) else {
            debug!(path = %req.uri().path(), "No route");
            return text_response(StatusCode::NOT_FOUND, "Not Found\n");
        };

        let mut req = req.map(|body| body.map_err(io::Error::other).boxed_unsync());

        if kind == RouteKind::Static {
            let rewritten = self.table.rewrite_static(req.uri().path());
            let target = match req.uri().query() {
                Some(query) => format!("{}?{}", rewritten, query),
                None => rewritten,
            };
            match target.parse::<Uri>() {
                Ok(uri) => *req.uri_mut() = uri,
                Err(_) => return text_response(StatusCode::BAD_REQUEST, "Bad Request\n"),
            }
        }

        handler.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{hash_password, Credential};
    use crate::handlers::empty_body;
    use parking_lot::Mutex;

    /// Records the URIs and Authorization headers it receives
    #[derive(Default)]
    struct SpyHandler {
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl SpyHandler {
        fn calls(&self) -> usize {
            self.seen.lock().len()
        }

        fn last(&self) -> (String, Option<String>) {
            self.seen.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Handler for SpyHandler {
        async fn handle(&self, req: Request<RequestBody>) -> Response<ResponseBody> {
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .map(|v| v.to_str().unwrap().to_string());
            self.seen.lock().push((req.uri().to_string(), auth));
            text_response(StatusCode::OK, "spy\n")
        }
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
    }

    fn request(uri: &str, auth: Option<&str>) -> Request<RequestBody> {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(empty_body()).unwrap()
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    fn router(embed_prefix: &str) -> (Router, Arc<SpyHandler>, Arc<SpyHandler>) {
        let hash = hash_password("wonderland", 4).unwrap();
        let credentials = Arc::new(CredentialStore::from_records([Credential::new("alice", hash)]));
        let static_files = Arc::new(SpyHandler::default());
        let webdav = Arc::new(SpyHandler::default());
        let router = Router::new(
            RouteTable::new("/", "/dav/", embed_prefix),
            static_files.clone(),
            webdav.clone(),
            Some(credentials),
        );
        (router, static_files, webdav)
    }

    #[test]
    fn test_lookup_longest_prefix() {
        let table = RouteTable::new("/", "/dav/", "");
        assert_eq!(table.lookup("/dav/notes.org").unwrap().kind, RouteKind::WebDav);
        assert_eq!(table.lookup("/dav").unwrap().kind, RouteKind::WebDav);
        assert_eq!(table.lookup("/davinci.html").unwrap().kind, RouteKind::Static);
        assert_eq!(table.lookup("/index.html").unwrap().kind, RouteKind::Static);
    }

    #[test]
    fn test_lookup_without_catch_all() {
        let table = RouteTable::new("/app", "dav", "");
        assert_eq!(table.lookup("/app/index.html").unwrap().kind, RouteKind::Static);
        assert_eq!(table.lookup("/dav/x").unwrap().kind, RouteKind::WebDav);
        assert!(table.lookup("/other").is_none());
    }

    #[test]
    fn test_rewrite_static() {
        let table = RouteTable::new("/", "/dav/", "");
        assert_eq!(table.rewrite_static("/index.html"), "/index.html");

        let table = RouteTable::new("/app/", "/dav/", "/organice");
        assert_eq!(table.rewrite_static("/app/index.html"), "/organice/index.html");
        assert_eq!(table.rewrite_static("/app"), "/organice/");
        assert_eq!(table.rewrite_static("/app//x.js"), "/organice/x.js");
    }

    #[test]
    fn test_basic_credentials() {
        let req = request("/dav/", Some(&basic("alice", "pass:with:colons")));
        assert_eq!(
            basic_credentials(&req),
            Some(("alice".to_string(), "pass:with:colons".to_string()))
        );

        assert!(basic_credentials(&request("/dav/", Some("Bearer abc"))).is_none());
        assert!(basic_credentials(&request("/dav/", Some("Basic !!!"))).is_none());
        let no_colon = format!("Basic {}", STANDARD.encode("alice"));
        assert!(basic_credentials(&request("/dav/", Some(&no_colon))).is_none());
        assert!(basic_credentials(&request("/dav/", None)).is_none());
    }

    #[tokio::test]
    async fn test_webdav_without_auth_is_challenged() {
        let (router, _, webdav) = router("");

        let response = router.handle(request("/dav/", None), remote()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"davfs\""
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("Unauthorized"));
        assert_eq!(webdav.calls(), 0);
    }

    #[tokio::test]
    async fn test_webdav_wrong_password() {
        let (router, _, webdav) = router("");

        let response = router
            .handle(request("/dav/", Some(&basic("alice", "wrongpass"))), remote())
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .handle(request("/dav/", Some(&basic("mallory", "wonderland"))), remote())
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(webdav.calls(), 0);
    }

    #[tokio::test]
    async fn test_webdav_valid_credentials_reach_handler_unchanged() {
        let (router, static_files, webdav) = router("");
        let auth = basic("alice", "wonderland");

        let response = router
            .handle(request("/dav/notes.org?x=1", Some(&auth)), remote())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(webdav.calls(), 1);
        assert_eq!(webdav.last(), ("/dav/notes.org?x=1".to_string(), Some(auth)));
        assert_eq!(static_files.calls(), 0);
    }

    #[tokio::test]
    async fn test_static_needs_no_auth() {
        let (router, static_files, webdav) = router("/organice");

        let response = router.handle(request("/index.html?v=2", None), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(static_files.last().0, "/organice/index.html?v=2");
        assert_eq!(webdav.calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_disabled() {
        let static_files = Arc::new(SpyHandler::default());
        let webdav = Arc::new(SpyHandler::default());
        let router = Router::new(
            RouteTable::new("/", "/dav/", ""),
            static_files,
            webdav.clone(),
            None,
        );

        let response = router.handle(request("/dav/", None), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(webdav.calls(), 1);
    }

    #[tokio::test]
    async fn test_unrouted_path() {
        let router = Router::new(
            RouteTable::new("/app/", "/dav/", ""),
            Arc::new(SpyHandler::default()),
            Arc::new(SpyHandler::default()),
            None,
        );

        let response = router.handle(request("/elsewhere", None), remote()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
