//! ACME challenge responders
//!
//! Pending HTTP-01 tokens and TLS-ALPN-01 certificates live here while an
//! order is being validated. The plaintext listener that answers HTTP-01
//! requests and redirects everything else to HTTPS is also in this module.

use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::error::AcmeError;
use super::tls::certified_key;
use crate::handlers::{empty_body, text_response, ResponseBody};
use crate::router::log_request;
use crate::server::accept_failed;

/// Path prefix for HTTP-01 challenge requests
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Shared store of pending challenge responses
#[derive(Clone, Default)]
pub struct ChallengeStore {
    /// token -> (domain, key authorization)
    http01: Arc<DashMap<String, (String, String)>>,
    /// lowercased domain -> self-signed challenge certificate
    tls_alpn01: Arc<DashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an HTTP-01 response for `token`
    pub fn add_http01(&self, domain: &str, token: &str, key_authorization: &str) {
        debug!(domain = %domain, token = %token, "Registered HTTP-01 challenge");
        self.http01.insert(
            token.to_string(),
            (domain.to_string(), key_authorization.to_string()),
        );
    }

    /// Key authorization to serve for `token`
    pub fn http01_response(&self, token: &str) -> Option<String> {
        self.http01.get(token).map(|entry| entry.value().1.clone())
    }

    /// Build and register the TLS-ALPN-01 certificate for `domain`
    pub fn add_tls_alpn01(&self, domain: &str, digest: &[u8]) -> Result<(), AcmeError> {
        let key = tls_alpn01_certificate(domain, digest)?;
        debug!(domain = %domain, "Registered TLS-ALPN-01 challenge");
        self.tls_alpn01
            .insert(domain.to_ascii_lowercase(), Arc::new(key));
        Ok(())
    }

    /// Challenge certificate for a TLS-ALPN-01 handshake
    pub fn tls_alpn01_cert(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.tls_alpn01.get(&domain).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop every pending challenge for `domain`
    pub fn clear_domain(&self, domain: &str) {
        self.http01.retain(|_, (owner, _)| owner != domain);
        self.tls_alpn01.remove(&domain.to_ascii_lowercase());
    }

    /// Number of pending challenges of both kinds
    pub fn pending_count(&self) -> usize {
        self.http01.len() + self.tls_alpn01.len()
    }
}

/// Extract the token from an HTTP-01 challenge path
pub fn extract_token(path: &str) -> Option<&str> {
    path.strip_prefix(ACME_CHALLENGE_PREFIX)
        .filter(|token| !token.is_empty() && !token.contains('/'))
}

/// Self-signed certificate carrying the acmeIdentifier extension (RFC 8737)
fn tls_alpn01_certificate(domain: &str, digest: &[u8]) -> Result<CertifiedKey, AcmeError> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params
        .custom_extensions
        .push(CustomExtension::new_acme_identifier(digest));

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let chain = vec![CertificateDer::from(cert.der().to_vec())];
    certified_key(chain, &key)
}

/// Answer one request on the plaintext listener
pub(crate) fn respond_http01<B>(req: &Request<B>, challenges: &ChallengeStore) -> Response<ResponseBody> {
    let path = req.uri().path();

    if path.starts_with(ACME_CHALLENGE_PREFIX) {
        return match extract_token(path).and_then(|token| challenges.http01_response(token)) {
            Some(key_authorization) => {
                info!(path = %path, "Answering HTTP-01 challenge");
                text_response(StatusCode::OK, key_authorization)
            }
            None => {
                warn!(path = %path, "Unknown HTTP-01 challenge token");
                text_response(StatusCode::NOT_FOUND, "Not Found\n")
            }
        };
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text_response(StatusCode::BAD_REQUEST, "Use HTTPS\n");
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .filter(|h| !h.is_empty());

    let Some(host) = host else {
        return text_response(StatusCode::BAD_REQUEST, "Use HTTPS\n");
    };

    let target = match req.uri().path_and_query() {
        Some(pq) => format!("https://{}{}", host, pq),
        None => format!("https://{}/", host),
    };

    match HeaderValue::from_str(&target) {
        Ok(location) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::FOUND;
            response.headers_mut().insert(LOCATION, location);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Use HTTPS\n"),
    }
}

/// Serve the plaintext challenge listener until the task is dropped
pub async fn serve_http01(listener: TcpListener, challenges: ChallengeStore) {
    if let Ok(addr) = listener.local_addr() {
        info!("Challenge listener on http://{}", addr);
    }

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                accept_failed(&e).await;
                continue;
            }
        };

        let challenges = challenges.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                log_request(&req, remote_addr);
                let response = respond_http01(&req, &challenges);
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!("Challenge connection error: {:?}", err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn request(method: Method, uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    async fn body_string(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(extract_token("/.well-known/acme-challenge/"), None);
        assert_eq!(extract_token("/.well-known/acme-challenge/a/b"), None);
        assert_eq!(extract_token("/other/path"), None);
    }

    #[test]
    fn test_clear_domain() {
        let store = ChallengeStore::new();
        store.add_http01("example.com", "t1", "t1.key");
        store.add_http01("other.example", "t2", "t2.key");
        store.add_tls_alpn01("example.com", &[1u8; 32]).unwrap();
        assert_eq!(store.pending_count(), 3);

        store.clear_domain("example.com");
        assert_eq!(store.pending_count(), 1);
        assert!(store.http01_response("t1").is_none());
        assert_eq!(store.http01_response("t2").as_deref(), Some("t2.key"));
        assert!(store.tls_alpn01_cert("example.com").is_none());
    }

    #[test]
    fn test_tls_alpn01_lookup_is_case_insensitive() {
        let store = ChallengeStore::new();
        store.add_tls_alpn01("Example.COM", &[9u8; 32]).unwrap();
        assert!(store.tls_alpn01_cert("example.com").is_some());
        assert!(store.tls_alpn01_cert("example.com.").is_some());
        assert!(store.tls_alpn01_cert("other.example").is_none());
    }

    #[tokio::test]
    async fn test_http01_known_token() {
        let store = ChallengeStore::new();
        store.add_http01("example.com", "tok", "tok.thumbprint");

        let response = respond_http01(
            &request(Method::GET, "/.well-known/acme-challenge/tok", Some("example.com")),
            &store,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "tok.thumbprint");
    }

    #[test]
    fn test_http01_unknown_token() {
        let store = ChallengeStore::new();
        let response = respond_http01(
            &request(Method::GET, "/.well-known/acme-challenge/nope", Some("example.com")),
            &store,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_redirects_get_to_https() {
        let store = ChallengeStore::new();
        let response = respond_http01(
            &request(Method::GET, "/dav/notes.org?x=1", Some("example.com:80")),
            &store,
        );
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://example.com/dav/notes.org?x=1"
        );
    }

    #[test]
    fn test_rejects_other_methods() {
        let store = ChallengeStore::new();
        let response = respond_http01(
            &request(Method::PUT, "/dav/notes.org", Some("example.com")),
            &store,
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = respond_http01(&request(Method::GET, "/", None), &store);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
