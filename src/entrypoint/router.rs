//! The router interface consumed by the entrypoint.
//!
//! The entrypoint only needs two decisions out of a router: where raw TCP
//! connections go, and which HTTP handler serves parsed requests. Rule
//! matching (host rules, SNI expressions, priorities) lives outside the
//! data plane; this router carries catch-all routes plus the installed HTTP
//! handler, and is swapped atomically while traffic flows.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::proxy::HttpHandler;

/// First byte of a TLS ClientHello record.
pub(crate) const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Future returned by [`TcpHandler::serve`].
pub type TcpHandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A raw TCP connection handler.
pub trait TcpHandler: Send + Sync + 'static {
    fn serve(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> TcpHandlerFuture;
}

/// Adapter turning a closure into a [`TcpHandler`].
pub struct TcpHandlerFn<F>(pub F);

impl<F, Fut> TcpHandler for TcpHandlerFn<F>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> TcpHandlerFuture {
        let fut = (self.0)(stream, remote);
        Box::pin(fut)
    }
}

/// Where a freshly peeked connection is sent.
pub(crate) enum Route {
    /// Hand the raw stream to a TCP handler.
    Tcp(Arc<dyn TcpHandler>),
    /// Parse HTTP (H2c is detected afterwards from the preface).
    Http(Arc<dyn HttpHandler>),
}

/// Routing table installed on an entrypoint.
#[derive(Default)]
pub struct Router {
    http_handler: Option<Arc<dyn HttpHandler>>,
    /// Catch-all route for non-TLS raw TCP (`HostSNI(*)` equivalent).
    tcp_catch_all: Option<Arc<dyn TcpHandler>>,
    /// Catch-all route for TLS bytes; certificate handling is external, so
    /// TLS connections are passed through as raw streams.
    tls_catch_all: Option<Arc<dyn TcpHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler serving HTTP/1.1 and H2c requests.
    pub fn set_http_handler(&mut self, handler: Arc<dyn HttpHandler>) {
        self.http_handler = Some(handler);
    }

    /// Install a catch-all raw TCP route. It takes precedence over the HTTP
    /// pipeline for plaintext connections.
    pub fn add_tcp_route(&mut self, handler: Arc<dyn TcpHandler>) {
        self.tcp_catch_all = Some(handler);
    }

    /// Install a catch-all route for TLS connections.
    pub fn add_tls_route(&mut self, handler: Arc<dyn TcpHandler>) {
        self.tls_catch_all = Some(handler);
    }

    /// Route a connection based on its first peeked byte.
    pub(crate) fn route(&self, first_byte: u8) -> Option<Route> {
        if first_byte == TLS_HANDSHAKE_BYTE {
            return self
                .tls_catch_all
                .as_ref()
                .or(self.tcp_catch_all.as_ref())
                .map(|h| Route::Tcp(h.clone()));
        }
        if let Some(handler) = &self.tcp_catch_all {
            return Some(Route::Tcp(handler.clone()));
        }
        self.http_handler.as_ref().map(|h| Route::Http(h.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{plain_text_response, HandlerFn, ProxyBody};
    use hyper::{Request, StatusCode};

    fn http_handler() -> Arc<dyn HttpHandler> {
        Arc::new(HandlerFn(|_req: Request<ProxyBody>| async {
            plain_text_response(StatusCode::OK, "ok")
        }))
    }

    fn tcp_handler() -> Arc<dyn TcpHandler> {
        Arc::new(TcpHandlerFn(|_stream: TcpStream, _remote: SocketAddr| async {}))
    }

    #[test]
    fn test_empty_router_routes_nothing() {
        let router = Router::new();
        assert!(router.route(b'G').is_none());
        assert!(router.route(TLS_HANDSHAKE_BYTE).is_none());
    }

    #[test]
    fn test_http_only_router() {
        let mut router = Router::new();
        router.set_http_handler(http_handler());

        assert!(matches!(router.route(b'G'), Some(Route::Http(_))));
        // No TLS route installed: TLS bytes have nowhere to go.
        assert!(router.route(TLS_HANDSHAKE_BYTE).is_none());
    }

    #[test]
    fn test_tcp_route_takes_precedence_over_http() {
        let mut router = Router::new();
        router.set_http_handler(http_handler());
        router.add_tcp_route(tcp_handler());

        assert!(matches!(router.route(b'G'), Some(Route::Tcp(_))));
    }

    #[test]
    fn test_tls_byte_prefers_tls_route_then_tcp() {
        let mut router = Router::new();
        router.add_tcp_route(tcp_handler());
        assert!(matches!(router.route(TLS_HANDSHAKE_BYTE), Some(Route::Tcp(_))));

        router.add_tls_route(tcp_handler());
        assert!(matches!(router.route(TLS_HANDSHAKE_BYTE), Some(Route::Tcp(_))));
    }
}
