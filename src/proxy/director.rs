//! Outbound request rewriting.
//!
//! Before a request leaves for an upstream, it is rewritten in place: the
//! target origin replaces scheme and authority, the raw query is normalized,
//! the protocol is pinned to HTTP/1.1 and the Host header follows the
//! pass-host-header policy. WebSocket upgrade requests get their
//! `Sec-WebSocket-*` headers re-asserted under the canonical names.

use http::uri::Uri;
use http::Version;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::Request;
use url::Url;

use super::{ForwardError, ProxyBody};

/// The five WebSocket handshake headers some servers match case-sensitively.
const WEBSOCKET_HEADERS: [&str; 5] = [
    "sec-websocket-key",
    "sec-websocket-extensions",
    "sec-websocket-accept",
    "sec-websocket-protocol",
    "sec-websocket-version",
];

/// Rewrite `req` so it is addressed to `target`.
///
/// The path and raw query are taken from the inbound request-URI; every `;`
/// in the raw query is replaced with `&` so middlewares emitting
/// semicolon-separated parameters cannot smuggle them upstream unencoded.
pub fn direct_request(
    req: &mut Request<ProxyBody>,
    target: &Url,
    pass_host_header: bool,
) -> Result<(), ForwardError> {
    let authority = target_authority(target)?;

    let raw = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let path_and_query = match raw.split_once('?') {
        Some((path, query)) => format!("{}?{}", path, query.replace(';', "&")),
        None => raw.to_string(),
    };

    let uri = Uri::builder()
        .scheme(target.scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .map_err(|e| ForwardError::Internal(Box::new(e)))?;

    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    // Do not pass the client Host header unless configured to.
    if !pass_host_header {
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| ForwardError::Internal(Box::new(e)))?;
        req.headers_mut().insert(header::HOST, host);
    }

    clean_websocket_headers(req.headers_mut());

    Ok(())
}

/// Re-assert the WebSocket handshake headers under their canonical names.
///
/// The websocket RFC says these headers are case-insensitive, but some
/// servers insist on the `Sec-WebSocket-*` spelling. Header names are
/// normalized inside the proxy, so any mis-cased wire form already collapsed
/// into the canonical entry on parse; this removes and re-appends the five
/// entries so values survive intact and mis-cased duplicates cannot linger.
pub fn clean_websocket_headers(headers: &mut HeaderMap) {
    if !is_websocket_upgrade(headers) {
        return;
    }

    for name in WEBSOCKET_HEADERS {
        let header_name = HeaderName::from_static(name);
        let values: Vec<HeaderValue> = headers.get_all(&header_name).iter().cloned().collect();
        if values.is_empty() {
            continue;
        }
        headers.remove(&header_name);
        for value in values {
            headers.append(header_name.clone(), value);
        }
    }
}

/// A request is a websocket upgrade when `Connection` contains the `Upgrade`
/// token and `Upgrade` equals `websocket`, both case-insensitively.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_has_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_has_upgrade
        && headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
}

fn target_authority(target: &Url) -> Result<String, ForwardError> {
    let host = target
        .host_str()
        .ok_or_else(|| ForwardError::Internal("target URL has no host".into()))?;
    Ok(match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
