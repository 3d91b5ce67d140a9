//! Reverse proxy core.
//!
//! [`ReverseProxy`] drives a [`Forwarder`] for every request: rewrite the
//! request for the target, forward it, and turn any failure into a
//! `502 Bad Gateway`. [`HyperForwarder`] is the production forwarder; it
//! sends requests through a pooled hyper client whose connections come from
//! the [`FallbackConnector`].

use crate::config::ProxyTarget;
use crate::dialer::FallbackConnector;
use crate::error::{ProxyError, Result};
use crate::handler::{text_response, BoxError, Handler, ProxyBody};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Renders `err` and its sources as one line, skipping sources whose text
/// is already part of the message.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// The forwarding primitive behind [`ReverseProxy`].
#[async_trait]
pub trait Forwarder<B>: Send + Sync + 'static
where
    B: Send + 'static,
{
    /// Prepares an inbound request for the upstream.
    fn rewrite_request(&self, req: &mut Request<B>) -> Result<()>;

    /// Sends a rewritten request upstream and returns the streamed response.
    async fn forward(&self, req: Request<B>) -> Result<Response<ProxyBody>>;

    /// Maps a failure to the response the client sees.
    fn classify_error(&self, err: &ProxyError) -> Response<ProxyBody> {
        text_response(StatusCode::BAD_GATEWAY, &error_chain(err))
    }
}

/// Forwards to a fixed [`ProxyTarget`] over a pooled HTTP/1.1 client.
pub struct HyperForwarder<B> {
    client: Client<FallbackConnector, B>,
    target: ProxyTarget,
    authority: String,
}

impl<B> HyperForwarder<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    pub fn new(target: ProxyTarget, connector: FallbackConnector, pool_idle_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(connector);
        let authority = target.authority();

        Self {
            client,
            target,
            authority,
        }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }
}

#[async_trait]
impl<B> Forwarder<B> for HyperForwarder<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    fn rewrite_request(&self, req: &mut Request<B>) -> Result<()> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let uri = Uri::builder()
            .scheme(self.target.scheme.as_str())
            .authority(self.authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::invalid_request(format!("cannot rewrite request URI: {e}")))?;

        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        headers.insert(HOST, self.target.host_header.clone());

        Ok(())
    }

    async fn forward(&self, req: Request<B>) -> Result<Response<ProxyBody>> {
        trace!(uri = %req.uri(), "Sending upstream request");

        let response = self.client.request(req).await?;
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(
            parts,
            body.map_err(BoxError::from).boxed_unsync(),
        ))
    }
}

/// Handler that proxies every request through a [`Forwarder`].
pub struct ReverseProxy<F> {
    forwarder: F,
}

impl<F> ReverseProxy<F> {
    pub fn new(forwarder: F) -> Self {
        Self { forwarder }
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }
}

#[async_trait]
impl<B, F> Handler<B> for ReverseProxy<F>
where
    B: Send + 'static,
    F: Forwarder<B>,
{
    async fn serve(&self, mut req: Request<B>) -> Response<ProxyBody> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = match self.forwarder.rewrite_request(&mut req) {
            Ok(()) => self.forwarder.forward(req).await,
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!(
                    method = %method,
                    path = %path,
                    error = %error_chain(&e),
                    "error reverse proxying request"
                );
                self.forwarder.classify_error(&e)
            }
        };

        debug!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }
}
