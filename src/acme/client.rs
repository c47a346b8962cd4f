//! ACME order flow against a real CA directory

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::cache::CertificateCache;
use super::challenge::ChallengeStore;
use super::error::AcmeError;

/// Time allowed for the CA to validate challenges and issue
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Challenge types in order of preference
const CHALLENGE_PREFERENCE: [ChallengeType; 2] = [ChallengeType::TlsAlpn01, ChallengeType::Http01];

/// PEM material returned by a successful order
#[derive(Clone)]
pub struct IssuedCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

/// Something that can obtain a certificate for a domain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Directory URL identifying the CA, recorded with cached certificates
    fn directory_url(&self) -> &str;

    /// Run a complete order for `domain`, publishing challenges into `challenges`
    async fn issue(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<IssuedCertificate, AcmeError>;
}

/// Issuer backed by an ACME v2 directory
pub struct AcmeIssuer {
    directory_url: String,
    contact: Option<String>,
    cache: Arc<CertificateCache>,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    /// Create a new issuer; the account is loaded or registered on first use
    pub fn new(directory_url: &str, contact_email: Option<&str>, cache: Arc<CertificateCache>) -> Self {
        Self {
            directory_url: directory_url.to_string(),
            contact: contact_email.map(|email| format!("mailto:{}", email)),
            cache,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(json) = self.cache.load_account(&self.directory_url)? {
                    match serde_json::from_str::<AccountCredentials>(&json) {
                        Ok(credentials) => {
                            debug!(directory = %self.directory_url, "Restoring ACME account");
                            return Ok(Account::from_credentials(credentials).await?);
                        }
                        Err(e) => warn!(error = %e, "Cached ACME account is unreadable, registering a new one"),
                    }
                }

                info!(directory = %self.directory_url, "Registering ACME account");
                let contact: Vec<&str> = self.contact.iter().map(String::as_str).collect();
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contact,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await
                .map_err(|e| AcmeError::Account(e.to_string()))?;

                let json = serde_json::to_string_pretty(&credentials)?;
                if let Err(e) = self.cache.save_account(&self.directory_url, &json) {
                    warn!(error = %e, "Failed to persist ACME account");
                }
                Ok(account)
            })
            .await
    }

    async fn run_order(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<IssuedCertificate, AcmeError> {
        let account = self.account().await?;
        let started = Instant::now();

        // Step 1: open the order
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| order_error(domain, e))?;
        debug!(domain = %domain, "Created ACME order");

        // Step 2: publish a response for every pending authorization
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| order_error(domain, e))?;

        let mut ready = Vec::new();
        for auth in &authorizations {
            if auth.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = CHALLENGE_PREFERENCE
                .iter()
                .find_map(|kind| auth.challenges.iter().find(|c| &c.r#type == kind))
                .ok_or_else(|| AcmeError::Validation {
                    domain: domain.to_string(),
                    reason: "CA offered no supported challenge type".to_string(),
                })?;

            let key_auth = order.key_authorization(challenge);
            match challenge.r#type {
                ChallengeType::TlsAlpn01 => {
                    challenges.add_tls_alpn01(domain, key_auth.digest().as_ref())?
                }
                _ => challenges.add_http01(domain, &challenge.token, key_auth.as_str()),
            }
            info!(domain = %domain, kind = ?challenge.r#type, "Challenge published");
            ready.push(challenge.url.clone());
        }

        for url in &ready {
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| order_error(domain, e))?;
        }

        // Step 3: wait for validation
        wait_for_ready(domain, &mut order, started).await?;

        // Step 4: finalize with a fresh key
        let key_pair = KeyPair::generate()?;
        let csr = CertificateParams::new(vec![domain.to_string()])?.serialize_request(&key_pair)?;
        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| order_error(domain, e))?;
        }

        // Step 5: download the chain
        let mut delay = Duration::from_millis(250);
        let chain_pem = loop {
            if started.elapsed() > VALIDATION_TIMEOUT {
                return Err(AcmeError::Timeout {
                    what: "certificate download",
                    secs: VALIDATION_TIMEOUT.as_secs(),
                });
            }
            match order.certificate().await.map_err(|e| order_error(domain, e))? {
                Some(chain) => break chain,
                None => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        };

        Ok(IssuedCertificate {
            chain_pem,
            key_pem: key_pair.serialize_pem(),
        })
    }
}

async fn wait_for_ready(domain: &str, order: &mut Order, started: Instant) -> Result<(), AcmeError> {
    let mut delay = Duration::from_millis(250);
    loop {
        if started.elapsed() > VALIDATION_TIMEOUT {
            return Err(AcmeError::Timeout {
                what: "challenge validation",
                secs: VALIDATION_TIMEOUT.as_secs(),
            });
        }

        let state = order.refresh().await.map_err(|e| order_error(domain, e))?;
        debug!(domain = %domain, status = ?state.status, "Order status");
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                let reason = state
                    .error
                    .as_ref()
                    .map(|problem| format!("{:?}", problem))
                    .unwrap_or_else(|| "order became invalid".to_string());
                return Err(AcmeError::Validation {
                    domain: domain.to_string(),
                    reason,
                });
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
            }
        }
    }
}

fn order_error(domain: &str, e: instant_acme::Error) -> AcmeError {
    AcmeError::Order {
        domain: domain.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn issue(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<IssuedCertificate, AcmeError> {
        info!(domain = %domain, directory = %self.directory_url, "Requesting certificate");
        let result = self.run_order(domain, challenges).await;
        challenges.clear_domain(domain);
        result
    }
}
