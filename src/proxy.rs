//! Reverse proxy handler
//! Forwards decrypted requests to a single plain HTTP backend

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::http::uri::Authority;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, error};

/// Body type produced by request handlers
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handles one decoded HTTP request and produces its response.
///
/// Implementations report failures as HTTP error responses; the server
/// never sees an error from a handler.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody>;
}

/// Forwards every request to one backend over plain HTTP/1.1
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    backend: String,
}

#[async_trait]
impl RequestHandler for ReverseProxy {
    async fn handle(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        debug!("{} {} from {}", method, uri, remote_addr);

        match self.forward(req, remote_addr).await {
            Ok(response) => response,
            Err(e) => {
                error!("proxy error for {} {}: {:#}", method, uri, e);
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

impl ReverseProxy {
    /// Create a proxy for `backend` (`host:port`)
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Send the request to the backend and relay its response
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let upgrade = upgrade_type(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let proxy_req = self.rewrite_request(req, remote_addr, upgrade.as_ref())?;

        let stream = TcpStream::connect(&self.backend)
            .await
            .with_context(|| format!("failed to connect to backend {}", self.backend))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("failed to establish connection to backend")?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Backend connection error: {}", e);
            }
        });

        let mut response = sender
            .send_request(proxy_req)
            .await
            .context("failed to send request to backend")?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return Self::switch_protocols(response, client_upgrade, upgrade);
        }

        remove_hop_headers(response.headers_mut());
        Ok(response.map(|body| body.boxed_unsync()))
    }

    /// Point the request at the backend and set forwarding headers
    fn rewrite_request<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
        upgrade: Option<&HeaderValue>,
    ) -> Result<Request<B>> {
        let (mut parts, body) = req.into_parts();

        let backend: Authority = self.backend.parse().context("invalid backend address")?;

        // The backend connection writes the request target as given, so keep it origin-form
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = Uri::builder()
            .path_and_query(path_and_query)
            .build()
            .context("invalid request path")?;
        parts.version = Version::HTTP_11;

        let headers = &mut parts.headers;
        remove_hop_headers(headers);

        if !headers.contains_key(HOST) {
            headers.insert(
                HOST,
                HeaderValue::from_str(backend.as_str()).context("invalid backend host")?,
            );
        }

        append_forwarded_for(headers, remote_addr);
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol.clone());
        }

        Ok(Request::from_parts(parts, body))
    }

    /// Relay a 101 response and tunnel the upgraded connections
    fn switch_protocols(
        mut response: Response<Incoming>,
        client_upgrade: Option<hyper::upgrade::OnUpgrade>,
        requested: Option<HeaderValue>,
    ) -> Result<Response<ProxyBody>> {
        let client_upgrade =
            client_upgrade.ok_or_else(|| anyhow!("backend switched protocols without a request"))?;

        let accepted = upgrade_type(response.headers());
        let agreed = match (&accepted, &requested) {
            (Some(a), Some(r)) => a.as_bytes().eq_ignore_ascii_case(r.as_bytes()),
            _ => false,
        };
        if !agreed {
            return Err(anyhow!(
                "backend switched to {:?}, client asked for {:?}",
                accepted,
                requested
            ));
        }

        let backend_upgrade = hyper::upgrade::on(&mut response);

        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, backend)) => {
                    let mut client = TokioIo::new(client);
                    let mut backend = TokioIo::new(backend);
                    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                        Ok((sent, received)) => {
                            debug!("Upgraded tunnel closed ({} bytes up, {} down)", sent, received)
                        }
                        Err(e) => debug!("Upgraded tunnel error: {}", e),
                    }
                }
                Err(e) => error!("Upgrade failed: {}", e),
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, empty_body()))
    }
}

/// Protocol named by `Upgrade` when `Connection` asks for an upgrade
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Strip hop-by-hop headers, including any listed in `Connection`
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Append the client address to `X-Forwarded-For`
pub fn append_forwarded_for(headers: &mut HeaderMap, remote_addr: SocketAddr) {
    let mut value: Vec<u8> = Vec::new();
    for prior in headers.get_all(X_FORWARDED_FOR) {
        value.extend_from_slice(prior.as_bytes());
        value.extend_from_slice(b", ");
    }
    value.extend_from_slice(remote_addr.ip().to_string().as_bytes());

    if let Ok(value) = HeaderValue::from_bytes(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Create error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}
