//! Gateway server implementation
//! Owns the listeners and drives plaintext or TLS serving

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::acme::{serve_http01, AcmeConfig, CertificateManager, ACME_TLS_ALPN_NAME};
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::handlers::{StaticFiles, WebDav};
use crate::router::{RouteTable, Router};

/// Time a client gets to finish the TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. when out of file descriptors
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// TLS settings; present only when a domain is configured
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub acme: AcmeConfig,
    /// Address of the plain-HTTP listener answering HTTP-01 challenges
    pub challenge_listen: SocketAddr,
}

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub dav_dir: PathBuf,
    pub dav_prefix: String,
    pub static_dir: PathBuf,
    pub static_prefix: String,
    /// Prepended to static paths after the static prefix is stripped
    pub static_embed_prefix: String,
    pub credentials_path: PathBuf,
    pub auth_enabled: bool,
    pub tls: Option<TlsSettings>,
}

impl GatewayConfig {
    /// Create a new plaintext configuration with the default prefixes
    pub fn new(
        listen: SocketAddr,
        dav_dir: impl Into<PathBuf>,
        static_dir: impl Into<PathBuf>,
        credentials_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            listen,
            dav_dir: dav_dir.into(),
            dav_prefix: "/dav/".to_string(),
            static_dir: static_dir.into(),
            static_prefix: "/".to_string(),
            static_embed_prefix: String::new(),
            credentials_path: credentials_path.into(),
            auth_enabled: true,
            tls: None,
        }
    }

    /// Reject inconsistent settings before anything is bound
    pub fn validate(&self) -> Result<()> {
        for (name, prefix) in [("WebDAV", &self.dav_prefix), ("static", &self.static_prefix)] {
            if !prefix.starts_with('/') {
                return Err(Error::Config(format!(
                    "{} prefix {:?} must start with '/'",
                    name, prefix
                )));
            }
        }

        let dav = self.dav_prefix.trim_end_matches('/');
        if dav.is_empty() {
            return Err(Error::Config("WebDAV prefix must not be '/'".to_string()));
        }
        if dav == self.static_prefix.trim_end_matches('/') {
            return Err(Error::Config(format!(
                "WebDAV and static prefixes are both {:?}",
                self.dav_prefix
            )));
        }

        if !self.dav_dir.is_dir() {
            return Err(Error::Config(format!(
                "WebDAV root {} is not a directory",
                self.dav_dir.display()
            )));
        }

        if let Some(tls) = &self.tls {
            let domain = tls.acme.domain.trim();
            if domain.is_empty() {
                return Err(Error::Config("domain must not be empty".to_string()));
            }
            if domain.contains('*') {
                return Err(Error::Config(format!(
                    "wildcard domain {:?} is not supported",
                    domain
                )));
            }
            if tls.challenge_listen == self.listen {
                return Err(Error::Config(format!(
                    "challenge listener and main listener share {}",
                    self.listen
                )));
            }
        }

        Ok(())
    }
}

/// Parse a listen address; `:port` means all interfaces, IPv6 and IPv4
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr> {
    let value = value.trim();
    let candidate = match value.strip_prefix(':') {
        Some(port) => format!("[::]:{}", port),
        None => value.to_string(),
    };

    if let Ok(addr) = candidate.parse::<SocketAddr>() {
        return Ok(addr);
    }

    candidate
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::Config(format!("invalid listen address {:?}", value)))
}

/// The gateway: router plus optional certificate manager
pub struct GatewayServer {
    config: GatewayConfig,
    router: Arc<Router>,
    cert_manager: Option<Arc<CertificateManager>>,
}

impl GatewayServer {
    /// Create a new gateway server
    ///
    /// Reads the credential file (unless auth is disabled) and opens the
    /// certificate cache when TLS is configured.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let cert_manager = match &config.tls {
            Some(tls) => Some(Arc::new(CertificateManager::new(tls.acme.clone())?)),
            None => None,
        };
        Self::build(config, cert_manager)
    }

    /// Create a new gateway server around an existing certificate manager
    pub fn with_cert_manager(
        config: GatewayConfig,
        cert_manager: Arc<CertificateManager>,
    ) -> Result<Self> {
        if config.tls.is_none() {
            return Err(Error::Config(
                "a certificate manager needs TLS settings".to_string(),
            ));
        }
        Self::build(config, Some(cert_manager))
    }

    fn build(config: GatewayConfig, cert_manager: Option<Arc<CertificateManager>>) -> Result<Self> {
        config.validate()?;

        let credentials = if config.auth_enabled {
            Some(Arc::new(CredentialStore::load(&config.credentials_path)?))
        } else {
            warn!("Authentication is disabled, the WebDAV share is open to everyone");
            None
        };

        if !config.static_dir.is_dir() {
            warn!(root = %config.static_dir.display(), "Static root does not exist");
        }

        let table = RouteTable::new(
            &config.static_prefix,
            &config.dav_prefix,
            &config.static_embed_prefix,
        );
        let router = Router::new(
            table,
            Arc::new(StaticFiles::new(&config.static_dir)),
            Arc::new(WebDav::new(&config.dav_dir, &config.dav_prefix)),
            credentials,
        );

        Ok(Self {
            config,
            router: Arc::new(router),
            cert_manager,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn cert_manager(&self) -> Option<&Arc<CertificateManager>> {
        self.cert_manager.as_ref()
    }

    /// Start the gateway server; returns only on a fatal error
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = bind(self.config.listen).await?;

        match (self.cert_manager.clone(), self.config.tls.clone()) {
            (Some(manager), Some(tls)) => self.run_tls(listener, manager, tls).await,
            _ => {
                info!("Serving plaintext on http://{}", self.config.listen);
                self.accept_plain(listener).await
            }
        }
    }

    async fn run_tls(
        self: Arc<Self>,
        listener: TcpListener,
        manager: Arc<CertificateManager>,
        tls: TlsSettings,
    ) -> Result<()> {
        // Step 1: challenge listener
        let challenge_listener = bind(tls.challenge_listen).await?;
        let challenge_task = tokio::spawn(serve_http01(
            challenge_listener,
            manager.challenges().clone(),
        ));

        // Step 2: accept TLS right away so TLS-ALPN-01 can be answered
        let acceptor = TlsAcceptor::from(manager.tls_config());
        info!("Serving TLS for {} on https://{}", manager.domain(), self.config.listen);
        let accept_loop = Arc::clone(&self).accept_tls(listener, acceptor);
        tokio::pin!(accept_loop);

        // Step 3: block until the first certificate is available
        let startup = tokio::select! {
            result = &mut accept_loop => Err(result.err().unwrap_or_else(|| {
                Error::Stopped("TLS accept loop")
            })),
            result = manager.ensure_certificate() => result.map_err(Error::from),
        };
        let cert = match startup {
            Ok(cert) => cert,
            Err(e) => {
                challenge_task.abort();
                return Err(e);
            }
        };
        info!(domain = %cert.domain, not_after = %cert.not_after, "Certificate ready");

        // Step 4: serve while renewing in the background
        let mut renewal = manager.spawn_renewal();
        let result = tokio::select! {
            result = &mut accept_loop => result,
            result = renewal.finished() => {
                error!("Certificate renewal stopped");
                result.map_err(Error::from)
            }
        };

        challenge_task.abort();
        result
    }

    async fn accept_plain(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    accept_failed(&e).await;
                    continue;
                }
            };

            let router = Arc::clone(&self.router);
            tokio::spawn(serve_connection(stream, remote_addr, router));
        }
    }

    async fn accept_tls(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    accept_failed(&e).await;
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                let mut stream =
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            debug!("TLS handshake with {} failed: {}", remote_addr, e);
                            return;
                        }
                        Err(_) => {
                            debug!("TLS handshake with {} timed out", remote_addr);
                            return;
                        }
                    };

                // Validation handshakes carry no HTTP traffic
                if stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_NAME) {
                    debug!("Closing TLS-ALPN-01 validation connection from {}", remote_addr);
                    let _ = stream.shutdown().await;
                    return;
                }

                serve_connection(stream, remote_addr, router).await;
            });
        }
    }
}

/// Log a failed accept and back off before the next one
pub(crate) async fn accept_failed(e: &std::io::Error) {
    error!("Failed to accept connection: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        // Hosts without IPv6 fall back to all IPv4 interfaces
        Err(e) if addr.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED) => {
            let fallback = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
            warn!("Cannot listen on {} ({}), using {}", addr, e, fallback);
            TcpListener::bind(fallback)
                .await
                .map_err(|source| Error::Listen { addr: fallback, source })?
        }
        Err(source) => return Err(Error::Listen { addr, source }),
    };
    debug!("Listening on {}", addr);
    Ok(listener)
}

/// Serve HTTP/1.1 on an accepted stream
async fn serve_connection<S>(stream: S, remote_addr: SocketAddr, router: Arc<Router>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.handle(req, remote_addr).await) }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(io, service)
        .await
    {
        debug!("Connection error from {}: {}", remote_addr, e);
    }
}
