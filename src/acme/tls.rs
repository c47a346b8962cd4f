//! TLS server configuration backed by the managed certificate
//!
//! The [`CertResolver`] is installed once into a rustls [`ServerConfig`] and
//! consulted on every handshake. Certificate rotation swaps an `Arc` inside
//! it, so a handshake sees either the old or the new certificate and key as
//! a unit.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rustls::crypto::ring::{cipher_suite, kx_group};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedCipherSuite};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use x509_parser::extensions::GeneralName;

use super::challenge::ChallengeStore;
use super::error::AcmeError;

/// ALPN protocol identifier used by the TLS-ALPN-01 challenge (RFC 8737)
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// ALPN protocol identifier for plain HTTP/1.1
pub const HTTP11_ALPN: &[u8] = b"http/1.1";

/// An issued certificate together with its signing key
pub struct Certificate {
    pub domain: String,
    pub chain_pem: String,
    pub key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// ACME directory URL of the issuing CA
    pub issuer: String,
    certified: Arc<CertifiedKey>,
}

impl Certificate {
    /// Parse a PEM chain and key, checking that the leaf covers `domain`
    /// and that the key belongs to the leaf
    pub fn from_pem(
        domain: &str,
        chain_pem: &str,
        key_pem: &str,
        issuer: &str,
    ) -> Result<Self, AcmeError> {
        let chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AcmeError::certificate(domain, format!("bad chain PEM: {}", e)))?;
        let leaf = chain
            .first()
            .ok_or_else(|| AcmeError::certificate(domain, "chain is empty"))?;

        let (not_before, not_after, names) = inspect_leaf(domain, leaf)?;
        if !names.iter().any(|name| name_matches(name, domain)) {
            return Err(AcmeError::certificate(
                domain,
                format!("certificate names {:?} do not cover the domain", names),
            ));
        }

        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| AcmeError::certificate(domain, format!("bad key PEM: {}", e)))?
            .ok_or_else(|| AcmeError::certificate(domain, "no private key found"))?;

        let certified = certified_key(chain, &key)?;
        certified.keys_match().map_err(|e| {
            AcmeError::certificate(domain, format!("private key does not match certificate: {}", e))
        })?;

        Ok(Self {
            domain: domain.to_string(),
            chain_pem: chain_pem.to_string(),
            key_pem: key_pem.to_string(),
            not_before,
            not_after,
            issuer: issuer.to_string(),
            certified: Arc::new(certified),
        })
    }

    /// The rustls view handed to handshakes
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Remaining lifetime below which renewal is due
    ///
    /// `renew_before`, capped at a third of the certificate's lifetime so
    /// short-lived certificates are not due the moment they are issued.
    pub fn renew_threshold(&self, renew_before: Duration) -> chrono::Duration {
        let lifetime = self.not_after - self.not_before;
        to_chrono(renew_before).min(lifetime / 3)
    }

    /// Whether the remaining lifetime is below the renewal threshold
    pub fn needs_renewal(&self, now: DateTime<Utc>, renew_before: Duration) -> bool {
        self.not_after - now < self.renew_threshold(renew_before)
    }

    /// Point in time at which renewal becomes due
    pub fn renew_at(&self, renew_before: Duration) -> DateTime<Utc> {
        self.not_after - self.renew_threshold(renew_before)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("domain", &self.domain)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// Read the validity window and DNS names of a leaf certificate
fn inspect_leaf(
    domain: &str,
    leaf: &CertificateDer<'_>,
) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<String>), AcmeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| AcmeError::certificate(domain, format!("bad X.509 data: {}", e)))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| AcmeError::certificate(domain, "notBefore out of range"))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| AcmeError::certificate(domain, "notAfter out of range"))?;

    let names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok((not_before, not_after, names))
}

fn name_matches(candidate: &str, domain: &str) -> bool {
    candidate
        .trim_end_matches('.')
        .eq_ignore_ascii_case(domain.trim_end_matches('.'))
}

/// Build a rustls [`CertifiedKey`] from DER parts
pub(crate) fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<CertifiedKey, AcmeError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Certificate resolver consulted on every TLS handshake
pub struct CertResolver {
    domain: String,
    current: ArcSwapOption<Certificate>,
    challenges: ChallengeStore,
}

impl CertResolver {
    pub fn new(domain: &str, challenges: ChallengeStore) -> Self {
        Self {
            domain: domain.to_string(),
            current: ArcSwapOption::empty(),
            challenges,
        }
    }

    /// Currently installed certificate, if any
    pub fn current(&self) -> Option<Arc<Certificate>> {
        self.current.load_full()
    }

    /// Atomically replace the served certificate
    pub fn install(&self, cert: Arc<Certificate>) {
        self.current.store(Some(cert));
    }

    /// Stop serving any certificate; handshakes fail until the next install
    pub fn clear(&self) {
        self.current.store(None);
    }

    /// Pick the key for a handshake
    ///
    /// Challenge handshakes get the TLS-ALPN-01 certificate registered for
    /// the requested name. Regular handshakes get the managed certificate
    /// when no SNI is sent or the SNI matches the managed domain.
    pub fn select(&self, server_name: Option<&str>, acme_challenge: bool) -> Option<Arc<CertifiedKey>> {
        if acme_challenge {
            let name = server_name?;
            return self.challenges.tls_alpn01_cert(name);
        }

        if let Some(name) = server_name {
            if !name_matches(name, &self.domain) {
                trace!(server_name = %name, "Rejecting handshake for unknown host");
                return None;
            }
        }

        self.current.load().as_ref().map(|cert| cert.certified_key())
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let acme_challenge = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|proto| proto == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);
        self.select(client_hello.server_name(), acme_challenge)
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("domain", &self.domain)
            .field("current", &self.current.load().as_ref().map(|c| c.not_after))
            .finish()
    }
}

/// Cipher suites in server preference order
fn cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

/// Build the server configuration: TLS 1.2 minimum, X25519 then P-256,
/// server-ordered suites, ALPN `http/1.1` plus `acme-tls/1`
pub fn server_config(resolver: Arc<CertResolver>) -> Result<ServerConfig, rustls::Error> {
    let provider = CryptoProvider {
        cipher_suites: cipher_suites(),
        kx_groups: vec![kx_group::X25519, kx_group::SECP256R1],
        ..rustls::crypto::ring::default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![HTTP11_ALPN.to_vec(), ACME_TLS_ALPN_NAME.to_vec()];
    config.ignore_client_order = true;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use rcgen::{generate_simple_self_signed, CertifiedKey as RcgenKey};
    use rustls::NamedGroup;

    fn self_signed(names: &[&str]) -> (String, String) {
        let RcgenKey { cert, key_pair } =
            generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn test_from_pem_reads_validity_and_names() {
        let (chain, key) = self_signed(&["example.com"]);
        let cert = Certificate::from_pem("example.com", &chain, &key, "https://acme.test/dir").unwrap();

        assert_eq!(cert.domain, "example.com");
        assert!(cert.not_before < cert.not_after);
        assert!(cert.is_valid_at(Utc::now()));
        assert_eq!(cert.certified_key().cert.len(), 1);
    }

    #[test]
    fn test_from_pem_rejects_other_domain() {
        let (chain, key) = self_signed(&["other.example"]);
        let err = Certificate::from_pem("example.com", &chain, &key, "dir").unwrap_err();
        assert!(matches!(err, AcmeError::Certificate { .. }));
    }

    #[test]
    fn test_from_pem_requires_key() {
        let (chain, _) = self_signed(&["example.com"]);
        assert!(Certificate::from_pem("example.com", &chain, "", "dir").is_err());
        assert!(Certificate::from_pem("example.com", "", "", "dir").is_err());
    }

    fn issued_for(days: i64, key_pair: &rcgen::KeyPair) -> String {
        let mut params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let start = Utc::now() - chrono::Duration::days(1);
        let end = start + chrono::Duration::days(days);
        params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
        params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
        params.self_signed(key_pair).unwrap().pem()
    }

    #[test]
    fn test_from_pem_rejects_foreign_key() {
        let signer = rcgen::KeyPair::generate().unwrap();
        let other = rcgen::KeyPair::generate().unwrap();
        let chain = issued_for(90, &signer);

        let err = Certificate::from_pem("example.com", &chain, &other.serialize_pem(), "dir").unwrap_err();
        assert!(matches!(err, AcmeError::Certificate { .. }));

        let cert = Certificate::from_pem("example.com", &chain, &signer.serialize_pem(), "dir").unwrap();
        assert!(cert.certified_key().keys_match().is_ok());
    }

    #[test]
    fn test_short_lived_certificate_is_not_due_on_issue() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let chain = issued_for(10, &key_pair);
        let cert = Certificate::from_pem("example.com", &chain, &key_pair.serialize_pem(), "dir").unwrap();

        let day = Duration::from_secs(24 * 3600);
        assert_eq!(cert.renew_threshold(30 * day), (cert.not_after - cert.not_before) / 3);
        assert!(!cert.needs_renewal(Utc::now(), 30 * day));
        assert!(cert.renew_at(30 * day) > Utc::now());
        assert!(cert.needs_renewal(cert.not_after - chrono::Duration::days(2), 30 * day));
    }

    #[test]
    fn test_needs_renewal() {
        let (chain, key) = self_signed(&["example.com"]);
        let cert = Certificate::from_pem("example.com", &chain, &key, "dir").unwrap();

        let day = Duration::from_secs(24 * 3600);
        assert!(!cert.needs_renewal(Utc::now(), 30 * day));
        assert!(cert.needs_renewal(cert.not_after - chrono::Duration::days(10), 30 * day));
        assert!(cert.is_expired(cert.not_after));
    }

    #[test]
    fn test_resolver_without_certificate_fails_handshake() {
        let resolver = CertResolver::new("example.com", ChallengeStore::new());
        assert!(resolver.select(Some("example.com"), false).is_none());
        assert!(resolver.select(None, false).is_none());
    }

    #[test]
    fn test_resolver_serves_managed_domain_only() {
        let resolver = CertResolver::new("example.com", ChallengeStore::new());
        let (chain, key) = self_signed(&["example.com"]);
        resolver.install(Arc::new(
            Certificate::from_pem("example.com", &chain, &key, "dir").unwrap(),
        ));

        assert!(resolver.select(Some("example.com"), false).is_some());
        assert!(resolver.select(Some("EXAMPLE.com"), false).is_some());
        assert!(resolver.select(None, false).is_some());
        assert!(resolver.select(Some("evil.example"), false).is_none());

        resolver.clear();
        assert!(resolver.select(Some("example.com"), false).is_none());
    }

    #[test]
    fn test_resolver_serves_challenge_certificate() {
        let challenges = ChallengeStore::new();
        let resolver = CertResolver::new("example.com", challenges.clone());
        let (chain, key) = self_signed(&["example.com"]);
        let managed = Arc::new(Certificate::from_pem("example.com", &chain, &key, "dir").unwrap());
        resolver.install(managed.clone());

        // No challenge registered: challenge handshakes must not get the real cert
        assert!(resolver.select(Some("example.com"), true).is_none());

        challenges.add_tls_alpn01("example.com", &[7u8; 32]).unwrap();
        let challenge_key = resolver.select(Some("example.com"), true).unwrap();
        assert_ne!(challenge_key.cert[0], managed.certified_key().cert[0]);
        assert!(resolver.select(None, true).is_none());
    }

    #[test]
    fn test_server_config_parameters() {
        let resolver = Arc::new(CertResolver::new("example.com", ChallengeStore::new()));
        let config = server_config(resolver).unwrap();

        assert_eq!(
            config.alpn_protocols,
            vec![b"http/1.1".to_vec(), b"acme-tls/1".to_vec()]
        );
        assert!(config.ignore_client_order);

        let provider = config.crypto_provider();
        let groups: Vec<NamedGroup> = provider.kx_groups.iter().map(|g| g.name()).collect();
        assert_eq!(groups, vec![NamedGroup::X25519, NamedGroup::secp256r1]);
        assert_eq!(provider.cipher_suites.len(), 9);
    }
}
