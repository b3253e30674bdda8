//! HTTP forwarding subsystem
//!
//! This module holds the pieces shared by everything that handles an HTTP
//! request inside the proxy:
//!
//! - [`HttpHandler`]: the handler capability passed between the entrypoint,
//!   the middlewares and the load balancer
//! - [`Forwarder`]: the single-host forwarder that rewrites a request towards
//!   a target origin and sends it upstream
//! - [`ForwardError`]: classification of upstream failures into HTTP statuses
//!
//! The request/response body type is boxed so handlers compose without
//! generics spreading through every layer.

pub mod director;
pub mod error;
pub mod forwarder;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

pub use director::{clean_websocket_headers, direct_request};
pub use error::ForwardError;
pub use forwarder::Forwarder;

/// Boxed error type used across the forwarding path.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP body type flowing through handlers (request and response side).
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Future returned by [`HttpHandler::call`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send + 'static>>;

/// An HTTP request handler.
///
/// Handlers are shared behind `Arc` and cloned per request; the `Arc`
/// receiver lets implementations move themselves into the returned future.
pub trait HttpHandler: Send + Sync + 'static {
    fn call(self: Arc<Self>, req: Request<ProxyBody>) -> HandlerFuture;
}

/// Adapter turning a closure into an [`HttpHandler`].
pub struct HandlerFn<F>(pub F);

impl<F, Fut> HttpHandler for HandlerFn<F>
where
    F: Fn(Request<ProxyBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    fn call(self: Arc<Self>, req: Request<ProxyBody>) -> HandlerFuture {
        let fut = (self.0)(req);
        Box::pin(fut)
    }
}

/// Convert a string or byte payload into a [`ProxyBody`].
pub fn full_body(payload: impl Into<Bytes>) -> ProxyBody {
    Full::new(payload.into())
        .map_err(|never| match never {})
        .boxed()
}

/// An empty [`ProxyBody`].
pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Box a hyper [`Incoming`] body into a [`ProxyBody`].
pub fn boxed_incoming(body: Incoming) -> ProxyBody {
    body.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// Build a plain-text response with the given status.
pub fn plain_text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.to_string()))
        .unwrap()
}
