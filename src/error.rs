//! Error types for the davfs gateway

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::acme::AcmeError;

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can stop the gateway from starting or serving
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid flag combination or configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Credential file could not be read or parsed
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// A listener could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// TLS configuration could not be built
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate provisioning failed with no usable fallback
    #[error(transparent)]
    Acme(#[from] AcmeError),

    /// A serving loop ended without reporting an error
    #[error("{0} stopped unexpectedly")]
    Stopped(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised while loading the credential file
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("cannot read credential file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write credential file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: expected 2 fields (username:hash), found {fields}")]
    FieldCount {
        path: PathBuf,
        line: usize,
        fields: usize,
    },

    #[error("{path}:{line}: empty username")]
    EmptyUsername { path: PathBuf, line: usize },

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}
