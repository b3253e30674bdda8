//! Classification of upstream failures into HTTP status codes.
//!
//! The forwarder never retries; it maps whatever went wrong during the
//! upstream exchange to exactly one status code and answers the client with
//! a plain-text reason. Retry policy belongs to a higher layer.

use std::io;

use hyper::{Response, StatusCode};
use tracing::debug;

use super::{full_body, ProxyBody};

/// Non-standard HTTP status code for client disconnection.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Non-standard HTTP status text for client disconnection.
pub const STATUS_CLIENT_CLOSED_REQUEST_TEXT: &str = "Client Closed Request";

/// Errors produced while forwarding a request upstream.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The upstream closed the connection before sending a complete response.
    #[error("upstream closed the connection before responding")]
    UpstreamEof,

    /// The client went away while the upstream exchange was in flight.
    #[error("client closed request")]
    ClientGone,

    /// A network-level failure (connect, reset, timeout) reaching the upstream.
    #[error("network error reaching upstream: {0}")]
    Network(#[source] io::Error),

    /// Anything else: misconfiguration, invalid rewrite, internal failures.
    #[error("internal proxy error: {0}")]
    Internal(#[source] super::BoxError),
}

impl ForwardError {
    /// Map the error to its HTTP status code. Total: every error maps to
    /// exactly one of 499, 500, 502, 504.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ForwardError::UpstreamEof => StatusCode::BAD_GATEWAY,
            ForwardError::ClientGone => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).expect("valid status code")
            }
            ForwardError::Network(err) if is_timeout(err) => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::Network(_) => StatusCode::BAD_GATEWAY,
            ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The textual reason written as the response body.
    pub fn status_text(&self) -> &'static str {
        let status = self.status_code();
        if status.as_u16() == STATUS_CLIENT_CLOSED_REQUEST {
            return STATUS_CLIENT_CLOSED_REQUEST_TEXT;
        }
        status.canonical_reason().unwrap_or("Internal Server Error")
    }

    /// Classify an error returned by the upstream HTTP client.
    ///
    /// Walks the source chain the way the status mapping is specified:
    /// upstream EOF first, then client cancellation, then network-level
    /// errors (timeouts before the rest), and 500 for everything else.
    pub fn classify(err: hyper_util::client::legacy::Error) -> ForwardError {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
        while let Some(cause) = source {
            if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
                if hyper_err.is_incomplete_message() {
                    return ForwardError::UpstreamEof;
                }
                if hyper_err.is_canceled() {
                    return ForwardError::ClientGone;
                }
            }
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::UnexpectedEof {
                    return ForwardError::UpstreamEof;
                }
                return ForwardError::Network(io::Error::new(io_err.kind(), io_err.to_string()));
            }
            source = cause.source();
        }
        ForwardError::Internal(Box::new(err))
    }

    /// A 504-producing timeout error, for callers that bound the exchange
    /// themselves (e.g. with `tokio::time::timeout`).
    pub fn timeout() -> ForwardError {
        ForwardError::Network(io::Error::new(io::ErrorKind::TimedOut, "upstream request timed out"))
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Render the error as a plain-text HTTP response.
///
/// Failures while writing the response itself are the caller's concern and
/// are logged at debug there; here the body is an in-memory buffer.
pub fn error_response(err: &ForwardError) -> Response<ProxyBody> {
    let status = err.status_code();
    debug!(error = %err, status = status.as_u16(), "forward error");

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(err.status_text()))
        .unwrap()
}
