//! davfs - Main entry point
//!
//! A personal WebDAV file server with automatic HTTPS

use anyhow::{Context, Result};
use clap::Parser;
use davfs::server::parse_listen_addr;
use davfs::{AcmeConfig, GatewayConfig, GatewayServer, TlsSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// davfs - A personal WebDAV file server
#[derive(Parser, Debug)]
#[command(name = "davfs")]
#[command(version)]
#[command(about = "A personal WebDAV file server with automatic HTTPS")]
struct Args {
    /// Domain to obtain a certificate for; serves plaintext when unset
    #[arg(long, env = "DAVFS_DOMAIN")]
    domain: Option<String>,

    /// Listen address for the ACME HTTP-01 challenge listener
    #[arg(long, alias = "alisten", env = "DAVFS_ACME_LISTEN", default_value = ":80")]
    acme_listen: String,

    /// Certificate cache directory [default: <exe dir>/.cache]
    #[arg(long, alias = "cache", env = "DAVFS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory served over WebDAV [default: <exe dir>]
    #[arg(long, alias = "davdir", env = "DAVFS_DAV_DIR")]
    dav_dir: Option<PathBuf>,

    /// URL prefix of the WebDAV share
    #[arg(long, alias = "davpath", env = "DAVFS_DAV_PREFIX", default_value = "/dav/")]
    dav_prefix: String,

    /// Main listen address
    #[arg(long, alias = "http", env = "DAVFS_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Credential file with username:bcrypt-hash records [default: <exe dir>/.htpasswd]
    #[arg(long, alias = "htpass", env = "DAVFS_HTPASSWD")]
    htpasswd: Option<PathBuf>,

    /// Directory served read-only without authentication [default: <exe dir>/static]
    #[arg(long, env = "DAVFS_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// URL prefix of the static tree
    #[arg(long, env = "DAVFS_STATIC_PREFIX", default_value = "/")]
    static_prefix: String,

    /// Path prefix prepended inside the static tree
    #[arg(long, env = "DAVFS_STATIC_EMBED_PREFIX", default_value = "")]
    static_embed_prefix: String,

    /// Use the Let's Encrypt staging directory
    #[arg(long, alias = "test", env = "DAVFS_STAGING")]
    staging: bool,

    /// Custom ACME directory URL
    #[arg(long, env = "DAVFS_ACME_DIRECTORY")]
    acme_directory: Option<String>,

    /// Contact email for the ACME account
    #[arg(long, env = "DAVFS_EMAIL")]
    email: Option<String>,

    /// Serve WebDAV without authentication
    #[arg(long, env = "DAVFS_NO_AUTH")]
    no_auth: bool,

    /// Log level
    #[arg(long, env = "DAVFS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Directory holding the running executable
fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the executable")?;
    Ok(exe
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".")))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting davfs v{}", env!("CARGO_PKG_VERSION"));

    let base = exe_dir()?;
    let listen = parse_listen_addr(&args.listen)?;

    let mut config = GatewayConfig::new(
        listen,
        args.dav_dir.unwrap_or_else(|| base.clone()),
        args.static_dir.unwrap_or_else(|| base.join("static")),
        args.htpasswd.unwrap_or_else(|| base.join(".htpasswd")),
    );
    config.dav_prefix = args.dav_prefix;
    config.static_prefix = args.static_prefix;
    config.static_embed_prefix = args.static_embed_prefix;
    config.auth_enabled = !args.no_auth;

    if let Some(domain) = args.domain {
        let mut acme = AcmeConfig::new(
            domain,
            args.cache_dir.unwrap_or_else(|| base.join(".cache")),
            args.staging,
        );
        acme.directory_url = args.acme_directory;
        acme.contact_email = args.email;

        info!("ACME directory: {}", acme.directory_url());
        config.tls = Some(TlsSettings {
            acme,
            challenge_listen: parse_listen_addr(&args.acme_listen)?,
        });
    }

    info!("WebDAV root: {} at {}", config.dav_dir.display(), config.dav_prefix);
    info!("Static root: {} at {}", config.static_dir.display(), config.static_prefix);

    let server = Arc::new(GatewayServer::new(config).context("failed to start davfs")?);
    server.run().await?;

    Ok(())
}
