//! Startup configuration
//! Command line flags and the validated configuration handed to the server

use clap::Parser;
use hyper::http::uri::Authority;
use std::path::PathBuf;
use thiserror::Error;
use tracing::Level;

/// Listen address used when none is given
pub const DEFAULT_LISTEN: &str = ":4443";

/// Backend used when none is given
pub const DEFAULT_BACKEND: &str = "localhost:8080";

/// Certificate identity used when none is given
pub const DEFAULT_HOST: &str = "localhost";

/// Configuration errors detected before any resource is acquired
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot specify --cert without --key")]
    IncompleteCertificatePair,

    #[error("invalid --backend {0:?}: expected host:port")]
    InvalidBackend(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// tlsproxy - TLS-terminating reverse proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "tlsproxy")]
#[command(version)]
#[command(about = "Serve a plain HTTP backend over HTTPS")]
pub struct Args {
    /// Socket address to listen to
    #[arg(long, env = "PROXY_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Backend server to proxy
    #[arg(long, env = "PROXY_BACKEND", default_value = DEFAULT_BACKEND)]
    pub backend: String,

    /// Hostname or IP address for the generated certificate
    #[arg(long, env = "PROXY_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Path to a PEM certificate file; defaults to a generated self-signed cert
    #[arg(long, env = "PROXY_CERT")]
    pub cert: Option<PathBuf>,

    /// Path to the PEM key file for the cert
    #[arg(long, env = "PROXY_KEY")]
    pub key: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Where the server certificate comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    /// Load an operator-supplied certificate and key
    Files { cert: PathBuf, key: PathBuf },
    /// Generate a self-signed certificate for this identity
    SelfSigned { identity: String },
}

/// Validated proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen: String,
    pub backend: String,
    pub certificate: CertificateSource,
}

impl ProxyConfig {
    /// Validate command line arguments into a configuration
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let certificate = match (&args.cert, &args.key) {
            (Some(cert), Some(key)) => CertificateSource::Files {
                cert: cert.clone(),
                key: key.clone(),
            },
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::IncompleteCertificatePair)
            }
            (None, None) => {
                if args.host.is_empty() {
                    return Err(ConfigError::Empty("--host"));
                }
                CertificateSource::SelfSigned {
                    identity: args.host.clone(),
                }
            }
        };

        if args.backend.is_empty() {
            return Err(ConfigError::Empty("--backend"));
        }

        Ok(Self {
            listen: normalize_listen(&args.listen)?,
            backend: parse_backend(&args.backend)?,
            certificate,
        })
    }
}

/// Check that the backend is a bare `host:port` authority
pub fn parse_backend(backend: &str) -> Result<String, ConfigError> {
    let authority: Authority = backend
        .parse()
        .map_err(|_| ConfigError::InvalidBackend(backend.to_string()))?;

    if authority.port_u16().is_none() || authority.as_str().contains('@') {
        return Err(ConfigError::InvalidBackend(backend.to_string()));
    }

    Ok(authority.as_str().to_string())
}

/// Turn the `:port` shorthand into an all-interfaces address
pub fn normalize_listen(listen: &str) -> Result<String, ConfigError> {
    if listen.is_empty() {
        return Err(ConfigError::Empty("--listen"));
    }
    if listen.starts_with(':') {
        Ok(format!("0.0.0.0{}", listen))
    } else {
        Ok(listen.to_string())
    }
}

/// Map a log level name to a tracing level, falling back to INFO
pub fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
