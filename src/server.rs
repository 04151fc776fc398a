//! TLS-terminating listener
//! Accepts TLS connections and serves decrypted HTTP/1.1 through a request handler

use crate::certificate::CertificateBundle;
use crate::proxy::RequestHandler;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// The only protocol offered during ALPN
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Fatal server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid TLS credentials: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Build the rustls configuration for a certificate bundle
pub fn tls_config(bundle: CertificateBundle) -> Result<ServerConfig, ServerError> {
    let (chain, key) = bundle.into_parts();

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    Ok(config)
}

/// A bound TLS listener serving one request handler.
///
/// There is no idle timeout: a connection lives until the client closes it
/// or the transport fails.
pub struct TlsServer<H> {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<H>,
}

impl<H: RequestHandler> TlsServer<H> {
    /// Configure TLS and bind the listening socket
    pub async fn bind(
        listen_addr: &str,
        bundle: CertificateBundle,
        handler: Arc<H>,
    ) -> Result<Self, ServerError> {
        let acceptor = TlsAcceptor::from(Arc::new(tls_config(bundle)?));

        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: listen_addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            acceptor,
            handler,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until a fatal error occurs
    pub async fn run(self) -> Result<(), ServerError> {
        if let Ok(addr) = self.local_addr() {
            info!("HTTPS server listening on {}", addr);
        }

        let mut backoff: Option<Duration> = None;

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(e) if is_transient(&e) => {
                    let delay = backoff
                        .map(|d| (d * 2).min(ACCEPT_BACKOFF_MAX))
                        .unwrap_or(ACCEPT_BACKOFF_START);
                    warn!("Accept error: {}; retrying in {:?}", e, delay);
                    backoff = Some(delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(ServerError::Accept(e)),
            };

            let acceptor = self.acceptor.clone();
            let handler = self.handler.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, remote_addr, acceptor, handler).await
                {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handshake and serve a single connection
    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        acceptor: TlsAcceptor,
        handler: Arc<H>,
    ) -> anyhow::Result<()> {
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;

        debug!("TLS session established with {}", remote_addr);

        let io = TokioIo::new(tls_stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler.handle(req, remote_addr).await) }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP service error: {}", e))
    }
}

/// Bind `listen_addr` and serve `handler` over TLS until a fatal error
pub async fn serve<H: RequestHandler>(
    listen_addr: &str,
    bundle: CertificateBundle,
    handler: Arc<H>,
) -> Result<(), ServerError> {
    TlsServer::bind(listen_addr, bundle, handler).await?.run().await
}

/// Accept errors that concern a single connection or a passing shortage
fn is_transient(e: &io::Error) -> bool {
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;

    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}
