//! tlsproxy - A TLS-terminating reverse proxy
//!
//! Serves a plain HTTP backend over HTTPS:
//! - Self-signed certificate generation, or operator-supplied PEM files
//! - TLS termination with HTTP/1.1 as the only ALPN protocol
//! - Request forwarding with `X-Forwarded-Proto: https`
//! - Protocol upgrade (WebSocket) tunneling

pub mod certificate;
pub mod config;
pub mod proxy;
pub mod server;

pub use certificate::{CertificateBundle, CertificateError, CertificateOrigin};
pub use config::{Args, CertificateSource, ConfigError, ProxyConfig};
pub use proxy::{ProxyBody, RequestHandler, ReverseProxy};
pub use server::{serve, ServerError, TlsServer};
