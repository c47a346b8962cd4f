//! ACME error types

use std::io;
use thiserror::Error;

/// Errors raised while provisioning or renewing a certificate
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account error: {0}")]
    Account(String),

    #[error("ACME order for {domain} failed: {reason}")]
    Order { domain: String, reason: String },

    #[error("challenge validation for {domain} failed: {reason}")]
    Validation { domain: String, reason: String },

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: &'static str, secs: u64 },

    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rcgen::Error),

    #[error("invalid certificate for {domain}: {reason}")]
    Certificate { domain: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate cache error: {0}")]
    Storage(#[from] io::Error),

    #[error("certificate cache metadata error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("giving up on {domain} after {attempts} attempts: {last}")]
    Exhausted {
        domain: String,
        attempts: u32,
        #[source]
        last: Box<AcmeError>,
    },

    #[error("certificate renewal task stopped: {0}")]
    Task(String),

    #[error(transparent)]
    Protocol(#[from] instant_acme::Error),
}

impl AcmeError {
    pub(crate) fn certificate(domain: &str, reason: impl Into<String>) -> Self {
        Self::Certificate {
            domain: domain.to_string(),
            reason: reason.into(),
        }
    }
}
