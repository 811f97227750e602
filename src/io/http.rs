//! Metrics HTTP endpoint
//!
//! Serves the registry in Prometheus text format on a single configurable
//! path, optionally behind HTTP Basic auth and optionally over TLS.
//! Uses hyper (HTTP/1.1) with one task per connection.

use crate::infra::auth::CredentialGuard;
use crate::infra::config::Config;
use crate::infra::metrics::MetricRegistry;
use crate::io::exposition::{encode_text, CONTENT_TYPE};
use crate::services::lifecycle::{shutdown_requested, Listener};
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, ALLOW, AUTHORIZATION, CONTENT_TYPE as CONTENT_TYPE_HEADER,
    WWW_AUTHENTICATE,
};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub type HttpResponse = Response<Full<Bytes>>;

/// A request handler. Only the request head is needed here.
pub type Handler = Arc<dyn Fn(&Parts) -> HttpResponse + Send + Sync>;

fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE_HEADER, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response should not fail")
}

/// Handler rendering the current registry state
pub fn metrics_handler(registry: Arc<MetricRegistry>) -> Handler {
    Arc::new(move |_parts: &Parts| {
        let body = encode_text(&registry.gather());
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .body(Full::new(Bytes::from(body)))
            .expect("static response should not fail")
    })
}

/// Extract `(username, password)` from an `Authorization: Basic ...` header
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Wrap `next` so it only runs for requests carrying valid credentials.
/// Anything else gets 401 with a Basic challenge.
pub fn with_basic_auth(guard: Arc<CredentialGuard>, next: Handler) -> Handler {
    Arc::new(move |parts: &Parts| {
        let authorized = basic_credentials(&parts.headers)
            .map(|(username, password)| guard.authenticate(&username, &password))
            .unwrap_or(false);

        if authorized {
            return next(parts);
        }
        debug!(path = %parts.uri.path(), "metrics_unauthorized");
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(WWW_AUTHENTICATE, guard.challenge())
            .header(CONTENT_TYPE_HEADER, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from_static(b"401 Unauthorized\n")))
            .expect("static response should not fail")
    })
}

/// Single-route table: the metrics path, everything else 404
pub struct Routes {
    path: String,
    handler: Handler,
}

impl Routes {
    pub fn new(path: impl Into<String>, handler: Handler) -> Self {
        Self { path: path.into(), handler }
    }

    pub fn dispatch(&self, parts: &Parts) -> HttpResponse {
        if parts.uri.path() != self.path {
            return text_response(StatusCode::NOT_FOUND, "404 Not Found\n");
        }
        match parts.method {
            Method::GET | Method::HEAD => (self.handler)(parts),
            _ => {
                let mut response =
                    text_response(StatusCode::METHOD_NOT_ALLOWED, "405 Method Not Allowed\n");
                response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
                response
            }
        }
    }
}

/// Metrics HTTP(S) listener
pub struct MetricsServer {
    host: String,
    port: u16,
    routes: Arc<Routes>,
    tls: Option<TlsAcceptor>,
}

impl MetricsServer {
    /// Build the listener, wrapping the metrics route in Basic auth iff both
    /// a username and a password digest are configured.
    pub fn new(
        config: &Config,
        registry: Arc<MetricRegistry>,
        tls: Option<Arc<ServerConfig>>,
    ) -> Self {
        let mut handler = metrics_handler(registry);
        if let Some((username, password_sha)) = config.prometheus_auth() {
            info!("metrics_auth_enabled");
            let guard = Arc::new(CredentialGuard::new(username, *password_sha));
            handler = with_basic_auth(guard, handler);
        }
        if tls.is_some() {
            info!("metrics_tls_enabled");
        }

        Self {
            host: config.prometheus_host().to_string(),
            port: config.prometheus_port(),
            routes: Arc::new(Routes::new(config.prometheus_path(), handler)),
            tls: tls.map(TlsAcceptor::from),
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    pub fn uri(&self) -> String {
        format!("{}://{}:{}{}", self.scheme(), self.host, self.port, self.routes.path)
    }
}

/// Serve one HTTP/1.1 connection; on shutdown finish the in-flight
/// request and close.
async fn serve_connection<I>(io: I, routes: Arc<Routes>, mut shutdown: watch::Receiver<bool>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let routes = routes.clone();
        async move {
            let (parts, _body) = req.into_parts();
            Ok::<_, Infallible>(routes.dispatch(&parts))
        }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "metrics_connection_error");
            }
        }
        _ = shutdown_requested(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(error = %e, "metrics_connection_error");
            }
        }
    }
}

impl MetricsServer {
    /// Hand an accepted socket to its own task, after the TLS handshake if enabled
    fn spawn_connection(
        &self,
        connections: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let routes = self.routes.clone();
        match &self.tls {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                connections.spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(tls_stream, routes, shutdown).await,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "metrics_tls_handshake_failed")
                        }
                    }
                });
            }
            None => {
                connections.spawn(serve_connection(stream, routes, shutdown));
            }
        }
    }
}

#[async_trait]
impl Listener for MetricsServer {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| {
                format!("failed to bind metrics server on {}:{}", self.host, self.port)
            })?;

        info!(uri = %self.uri(), "metrics_server_started");

        // Dropping the set aborts every connection task
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            self.spawn_connection(&mut connections, stream, peer, shutdown.clone());
                        }
                        Err(e) => {
                            error!(error = %e, "metrics_accept_error");
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "metrics_connection_panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        let in_flight = connections.len();
        if in_flight > 0 {
            info!(in_flight = %in_flight, "metrics_server_draining");
        }
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "metrics_connection_aborted");
            }
        }

        info!("metrics_server_shutdown");
        Ok(())
    }
}
