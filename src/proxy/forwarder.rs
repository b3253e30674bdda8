//! Single-host HTTP forwarder.
//!
//! A [`Forwarder`] is the leaf handler behind the load balancer: it rewrites
//! the request towards its target origin, sends it over the shared upstream
//! client and answers with the upstream response, or with a classified error
//! response when the exchange fails.

use std::sync::Arc;
use std::time::Duration;

use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;
use url::Url;

use super::error::error_response;
use super::{boxed_incoming, direct_request, ForwardError, HandlerFuture, HttpHandler, ProxyBody};

/// Shared upstream HTTP client type.
pub type UpstreamClient = Client<HttpConnector, ProxyBody>;

/// Build the upstream client shared by all forwarders.
///
/// One client means one connection pool across every backend, the same way
/// the proxy reuses a single shared client for all its endpoints.
pub fn build_upstream_client(pool_max_idle_per_host: usize) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.set_connect_timeout(Some(Duration::from_secs(10)));

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .build(connector)
}

/// Forwards requests to a single target origin.
pub struct Forwarder {
    client: UpstreamClient,
    target: Url,
    pass_host_header: bool,
}

impl Forwarder {
    pub fn new(client: UpstreamClient, target: Url, pass_host_header: bool) -> Self {
        Self {
            client,
            target,
            pass_host_header,
        }
    }

    /// The origin this forwarder points at.
    pub fn target(&self) -> &Url {
        &self.target
    }
}

impl HttpHandler for Forwarder {
    fn call(self: Arc<Self>, mut req: Request<ProxyBody>) -> HandlerFuture {
        Box::pin(async move {
            if let Err(err) = direct_request(&mut req, &self.target, self.pass_host_header) {
                return error_response(&err);
            }

            debug!(target = %self.target, uri = %req.uri(), "forwarding request");

            match self.client.request(req).await {
                Ok(resp) => resp.map(boxed_incoming),
                Err(err) => error_response(&ForwardError::classify(err)),
            }
        })
    }
}
