//! Automatic certificate management
//!
//! [`CertificateManager`] owns the certificate for a single domain: it loads
//! it from the cache, obtains a new one from the CA when none is usable,
//! renews it before expiry and hot-swaps it into the TLS configuration.

mod cache;
mod challenge;
mod client;
mod error;
mod tls;

pub use cache::{CacheMeta, CachedCertificate, CertificateCache};
pub use challenge::{extract_token, serve_http01, ChallengeStore, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeIssuer, CertificateIssuer, IssuedCertificate, VALIDATION_TIMEOUT};
pub use error::AcmeError;
pub use tls::{server_config, CertResolver, Certificate, ACME_TLS_ALPN_NAME, HTTP11_ALPN};

use chrono::Utc;
use parking_lot::Mutex;
use rustls::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Retry schedule for a single issuance attempt
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Certificate management settings
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub domain: String,
    pub cache_dir: PathBuf,
    pub staging: bool,
    /// Overrides the Let's Encrypt directory when set
    pub directory_url: Option<String>,
    pub contact_email: Option<String>,
    /// Renew once the remaining lifetime drops below this
    pub renew_before: Duration,
    /// Upper bound between renewal checks
    pub check_interval: Duration,
    /// Lower bound between renewal checks after the first one
    pub min_check_interval: Duration,
    /// Delay before retrying after a failed renewal that left a valid certificate
    pub renewal_retry_interval: Duration,
    pub retry: RetryPolicy,
}

impl AcmeConfig {
    /// Create a new config with the default renewal schedule
    pub fn new(domain: impl Into<String>, cache_dir: impl Into<PathBuf>, staging: bool) -> Self {
        Self {
            domain: domain.into(),
            cache_dir: cache_dir.into(),
            staging,
            directory_url: None,
            contact_email: None,
            renew_before: 30 * DAY,
            check_interval: Duration::from_secs(12 * 60 * 60),
            min_check_interval: Duration::from_secs(60),
            renewal_retry_interval: Duration::from_secs(60 * 60),
            retry: RetryPolicy::default(),
        }
    }

    /// Directory URL of the CA in use
    pub fn directory_url(&self) -> &str {
        match &self.directory_url {
            Some(url) => url,
            None if self.staging => LETS_ENCRYPT_STAGING,
            None => LETS_ENCRYPT_PRODUCTION,
        }
    }
}

/// Lifecycle of the managed certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    Uncached,
    Requesting,
    Issued,
    Renewing,
    Expired,
}

/// Outcome of a refresh pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    /// The installed certificate is still fresh
    Fresh,
    /// A new certificate was installed
    Renewed,
    /// Renewal failed, the old certificate is still valid
    Deferred,
}

/// Certificate manager for a single domain
pub struct CertificateManager {
    config: AcmeConfig,
    cache: Arc<CertificateCache>,
    issuer: Arc<dyn CertificateIssuer>,
    challenges: ChallengeStore,
    resolver: Arc<CertResolver>,
    tls_config: Arc<ServerConfig>,
    state: Mutex<CertState>,
    issue_lock: TokioMutex<()>,
}

impl CertificateManager {
    /// Create a new certificate manager talking to the configured ACME directory
    pub fn new(config: AcmeConfig) -> Result<Self, AcmeError> {
        let cache = Arc::new(CertificateCache::new(&config.cache_dir)?);
        let issuer = Arc::new(AcmeIssuer::new(
            config.directory_url(),
            config.contact_email.as_deref(),
            Arc::clone(&cache),
        ));
        Self::build(config, cache, issuer)
    }

    /// Create a new certificate manager with a custom issuer
    pub fn with_issuer(
        config: AcmeConfig,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Result<Self, AcmeError> {
        let cache = Arc::new(CertificateCache::new(&config.cache_dir)?);
        Self::build(config, cache, issuer)
    }

    fn build(
        config: AcmeConfig,
        cache: Arc<CertificateCache>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Result<Self, AcmeError> {
        let challenges = ChallengeStore::new();
        let resolver = Arc::new(CertResolver::new(&config.domain, challenges.clone()));
        let tls_config = Arc::new(server_config(Arc::clone(&resolver))?);

        let manager = Self {
            config,
            cache,
            issuer,
            challenges,
            resolver,
            tls_config,
            state: Mutex::new(CertState::Uncached),
            issue_lock: TokioMutex::new(()),
        };
        manager.load_cached();
        Ok(manager)
    }

    /// Install the cached certificate when it is usable
    fn load_cached(&self) {
        let domain = &self.config.domain;
        let cached = match self.cache.load(domain) {
            Ok(Some(cached)) => cached,
            Ok(None) => return,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Ignoring unreadable cache entry");
                return;
            }
        };

        if cached.meta.directory_url != self.issuer.directory_url() {
            info!(
                domain = %domain,
                cached = %cached.meta.directory_url,
                "Cached certificate is from another CA directory, ignoring it"
            );
            return;
        }

        match Certificate::from_pem(domain, &cached.chain_pem, &cached.key_pem, &cached.meta.directory_url) {
            Ok(cert) if cert.is_expired(Utc::now()) => {
                info!(domain = %domain, not_after = %cert.not_after, "Cached certificate has expired");
            }
            Ok(cert) => {
                info!(domain = %domain, not_after = %cert.not_after, "Loaded certificate from cache");
                self.resolver.install(Arc::new(cert));
                self.set_state(CertState::Issued);
            }
            Err(e) => warn!(domain = %domain, error = %e, "Ignoring invalid cached certificate"),
        }
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    pub fn state(&self) -> CertState {
        *self.state.lock()
    }

    fn set_state(&self, state: CertState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(domain = %self.config.domain, from = ?*current, to = ?state, "Certificate state");
            *current = state;
        }
    }

    /// The certificate handshakes currently receive
    pub fn current(&self) -> Option<Arc<Certificate>> {
        self.resolver.current()
    }

    /// Shared TLS configuration whose certificate follows renewals
    pub fn tls_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.tls_config)
    }

    /// Pending challenge responses, served by the plaintext listener
    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    /// Make sure a valid certificate is installed, issuing or renewing as needed
    ///
    /// A failed renewal is not an error while the current certificate is
    /// still valid.
    pub async fn ensure_certificate(&self) -> Result<Arc<Certificate>, AcmeError> {
        self.refresh().await?;
        self.current().ok_or_else(|| {
            AcmeError::certificate(&self.config.domain, "no certificate installed")
        })
    }

    async fn refresh(&self) -> Result<Refresh, AcmeError> {
        let _guard = self.issue_lock.lock().await;
        let now = Utc::now();

        let existing = self.current();
        if let Some(cert) = &existing {
            if !cert.needs_renewal(now, self.config.renew_before) {
                self.set_state(CertState::Issued);
                return Ok(Refresh::Fresh);
            }
        }

        let renewing = existing.as_ref().is_some_and(|cert| !cert.is_expired(now));
        self.set_state(if renewing {
            CertState::Renewing
        } else {
            CertState::Requesting
        });

        match self.issue_with_retry().await {
            Ok(()) => Ok(Refresh::Renewed),
            Err(e) => {
                let still_valid = self
                    .current()
                    .is_some_and(|cert| !cert.is_expired(Utc::now()));
                if still_valid {
                    warn!(domain = %self.config.domain, error = %e, "Renewal failed, keeping current certificate");
                    self.set_state(CertState::Issued);
                    Ok(Refresh::Deferred)
                } else {
                    error!(domain = %self.config.domain, error = %e, "No valid certificate available");
                    self.resolver.clear();
                    self.set_state(CertState::Expired);
                    Err(e)
                }
            }
        }
    }

    async fn issue_with_retry(&self) -> Result<(), AcmeError> {
        let policy = &self.config.retry;
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.issue_once().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    return Err(AcmeError::Exhausted {
                        domain: self.config.domain.clone(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        domain = %self.config.domain,
                        attempt,
                        error = %e,
                        "Certificate request failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn issue_once(&self) -> Result<(), AcmeError> {
        let domain = &self.config.domain;
        let issued = self.issuer.issue(domain, &self.challenges).await?;
        let directory_url = self.issuer.directory_url().to_string();

        let cert = Certificate::from_pem(domain, &issued.chain_pem, &issued.key_pem, &directory_url)?;
        if cert.is_expired(Utc::now()) {
            return Err(AcmeError::certificate(domain, "issued certificate is already expired"));
        }

        let entry = CachedCertificate {
            key_pem: issued.key_pem,
            chain_pem: issued.chain_pem,
            meta: CacheMeta {
                directory_url,
                issued_at: Utc::now(),
            },
        };
        if let Err(e) = self.cache.save(domain, &entry) {
            warn!(domain = %domain, error = %e, "Failed to cache certificate");
        }

        info!(domain = %domain, not_after = %cert.not_after, "Installed new certificate");
        self.resolver.install(Arc::new(cert));
        self.set_state(CertState::Issued);
        Ok(())
    }

    /// How long to sleep before the next renewal check
    ///
    /// `last` is `None` before the first check, which may run immediately.
    fn next_check_delay(&self, last: Option<Refresh>) -> Duration {
        if last == Some(Refresh::Deferred) {
            return self.config.renewal_retry_interval;
        }

        let until_renewal = self
            .current()
            .map(|cert| {
                (cert.renew_at(self.config.renew_before) - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
            .unwrap_or(Duration::ZERO);

        let delay = until_renewal.min(self.config.check_interval);
        match last {
            Some(_) => delay.max(self.config.min_check_interval),
            None => delay,
        }
    }

    /// Start the background renewal loop
    pub fn spawn_renewal(self: &Arc<Self>) -> RenewalTask {
        let manager = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut last = None;
            loop {
                let delay = manager.next_check_delay(last);
                debug!(domain = %manager.config.domain, "Next certificate check in {:?}", delay);

                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Renewal task shutting down");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                last = Some(manager.refresh().await?);
            }
        });

        RenewalTask {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("domain", &self.config.domain)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to the background renewal loop; aborts the loop on drop
pub struct RenewalTask {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<(), AcmeError>>>,
}

impl RenewalTask {
    /// Ask the loop to stop and wait for it
    pub async fn stop(mut self) -> Result<(), AcmeError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait until the loop ends on its own, which only happens on a fatal error
    pub async fn finished(&mut self) -> Result<(), AcmeError> {
        self.join().await
    }

    async fn join(&mut self) -> Result<(), AcmeError> {
        match self.handle.as_mut() {
            Some(handle) => {
                let result = handle.await;
                self.handle = None;
                match result {
                    Ok(outcome) => outcome,
                    Err(e) => Err(AcmeError::Task(e.to_string())),
                }
            }
            None => std::future::pending().await,
        }
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
