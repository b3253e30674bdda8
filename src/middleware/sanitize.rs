//! Lexical URL path canonicalization.
//!
//! Rewrites the request path before routing: `.` and `..` segments are
//! resolved (never above the root), repeated slashes collapse, and a
//! trailing slash survives canonicalization. The sanitizer works on the
//! decoded path; the original percent-encoding is not preserved. The raw
//! query is left untouched.

use std::sync::Arc;

use http::uri::Uri;
use hyper::Request;
use tracing::debug;

use crate::proxy::{HandlerFuture, HttpHandler, ProxyBody};

/// Middleware rewriting `request.uri.path` to its canonical form.
pub struct SanitizePath {
    inner: Arc<dyn HttpHandler>,
}

impl SanitizePath {
    pub fn wrap(inner: Arc<dyn HttpHandler>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

impl HttpHandler for SanitizePath {
    fn call(self: Arc<Self>, mut req: Request<ProxyBody>) -> HandlerFuture {
        match sanitized_uri(req.uri()) {
            Some(uri) => *req.uri_mut() = uri,
            None => debug!(uri = %req.uri(), "uri could not be rebuilt, leaving as-is"),
        }
        self.inner.clone().call(req)
    }
}

/// Canonicalize a decoded, rooted URL path.
pub fn sanitize_path(path: &str) -> String {
    let trailing_slash = path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut clean = String::with_capacity(path.len());
    clean.push('/');
    clean.push_str(&segments.join("/"));
    if trailing_slash && clean.len() > 1 {
        clean.push('/');
    }
    clean
}

/// Rebuild the URI with the canonicalized path, preserving scheme,
/// authority and the raw query.
fn sanitized_uri(uri: &Uri) -> Option<Uri> {
    let decoded = percent_decode(uri.path());
    let clean = sanitize_path(&decoded);
    let encoded = encode_path(&clean);

    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", encoded, query),
        None => encoded,
    };

    let mut builder = Uri::builder();
    if let Some(scheme) = uri.scheme_str() {
        builder = builder.scheme(scheme);
    }
    if let Some(authority) = uri.authority() {
        builder = builder.authority(authority.as_str());
    }
    builder.path_and_query(path_and_query.as_str()).build().ok()
}

/// Decode `%XX` escapes; malformed escapes pass through verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2)))
            {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-encode the bytes that cannot appear literally in a URI path.
fn encode_path(path: &str) -> String {
    static HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'~'
            | b'!'
            | b'$'
            | b'&'
            | b'\''
            | b'('
            | b')'
            | b'*'
            | b'+'
            | b','
            | b';'
            | b'='
            | b':'
            | b'@'
            | b'/' => out.push(byte as char),
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0xf) as usize] as char);
            }
        }
    }
    out
}
