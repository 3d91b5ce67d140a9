//! Request handler contract shared by the proxy layers.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use std::sync::Arc;

/// Boxed error carried by response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body produced by every handler: either a streamed upstream body
/// or a small locally generated one.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// An async request handler. Layers wrap one another through this trait.
#[async_trait]
pub trait Handler<B>: Send + Sync + 'static
where
    B: Send + 'static,
{
    /// Produces the response for `req`. Failures are expressed as error
    /// responses, never as panics.
    async fn serve(&self, req: Request<B>) -> Response<ProxyBody>;
}

#[async_trait]
impl<B, H> Handler<B> for Arc<H>
where
    B: Send + 'static,
    H: Handler<B> + ?Sized,
{
    async fn serve(&self, req: Request<B>) -> Response<ProxyBody> {
        (**self).serve(req).await
    }
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn full_body(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text error response with `message` followed by a newline.
pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{message}\n")));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_response() {
        let response = text_response(StatusCode::BAD_GATEWAY, "dial tcp: refused");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"dial tcp: refused\n");
    }
}
