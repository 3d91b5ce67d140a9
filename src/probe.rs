//! Network probe interception.
//!
//! Infrastructure health checks mark requests with `K-Network-Probe: probe`
//! and a hash in `K-Network-Hash`. Such requests are answered right here
//! with the hash header set, so a probe succeeds as long as the path to
//! this proxy works, even if the upstream is down.

use crate::handler::{empty_body, text_response, Handler, ProxyBody};
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use tracing::{debug, trace};

/// Header marking a request as a network probe.
pub const PROBE_HEADER: HeaderName = HeaderName::from_static("k-network-probe");

/// Value of [`PROBE_HEADER`] that identifies a probe.
pub const PROBE_VALUE: &str = "probe";

/// Header carrying the probe hash, in both directions.
pub const HASH_HEADER: HeaderName = HeaderName::from_static("k-network-hash");

/// Computes the hash value a probe response must carry.
pub trait ProbeHasher: Send + Sync + 'static {
    fn probe_hash(&self, request_hash: &HeaderValue) -> HeaderValue;
}

/// Answers with the hash the prober sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHasher;

impl ProbeHasher for EchoHasher {
    fn probe_hash(&self, request_hash: &HeaderValue) -> HeaderValue {
        request_hash.clone()
    }
}

/// Wraps a handler and answers probe requests before it sees them.
pub struct ProbeHandler<H, P = EchoHasher> {
    next: H,
    hasher: P,
}

impl<H> ProbeHandler<H> {
    pub fn new(next: H) -> Self {
        Self::with_hasher(next, EchoHasher)
    }
}

impl<H, P> ProbeHandler<H, P> {
    pub fn with_hasher(next: H, hasher: P) -> Self {
        Self { next, hasher }
    }

    pub fn inner(&self) -> &H {
        &self.next
    }
}

/// Whether `req` carries the probe marker.
pub fn is_probe<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(&PROBE_HEADER)
        .is_some_and(|v| v.as_bytes() == PROBE_VALUE.as_bytes())
}

#[async_trait]
impl<B, H, P> Handler<B> for ProbeHandler<H, P>
where
    B: Send + 'static,
    H: Handler<B>,
    P: ProbeHasher,
{
    async fn serve(&self, mut req: Request<B>) -> Response<ProxyBody> {
        if !is_probe(&req) {
            // A hash only means something on a probe.
            req.headers_mut().remove(&HASH_HEADER);
            return self.next.serve(req).await;
        }

        let Some(hash) = req.headers().get(&HASH_HEADER).filter(|h| !h.is_empty()) else {
            debug!("Probe request without hash header");
            return text_response(
                StatusCode::BAD_REQUEST,
                "a probe request must contain a non-empty \"K-Network-Hash\" header",
            );
        };

        trace!(hash = ?hash, "Answering network probe");
        let mut response = Response::new(empty_body());
        response
            .headers_mut()
            .insert(HASH_HEADER, self.hasher.probe_hash(hash));
        response
    }
}
