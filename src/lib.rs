//! davfs - A personal WebDAV file server
//!
//! Provides:
//! - A WebDAV share behind HTTP Basic Authentication (bcrypt credential file)
//! - An unauthenticated, read-only static file tree
//! - Optional HTTPS with certificates obtained and renewed through ACME

pub mod acme;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod router;
pub mod server;

pub use acme::{AcmeConfig, CertificateManager};
pub use credentials::CredentialStore;
pub use error::{Error, Result};
pub use router::{RouteTable, Router};
pub use server::{GatewayConfig, GatewayServer, TlsSettings};
