//! Sticky session cookies.
//!
//! The cookie value is a 16-hex-character truncated SHA-256 of the backend
//! name. Older releases issued the raw name, an FNV-64 hex digest, or an
//! FNV-64 digest of that digest; all three legacy forms stay resolvable so
//! existing sessions survive an upgrade, and are rewritten to the SHA-256
//! form the first time they are seen.

use std::hash::Hasher;

use fnv::FnvHasher;
use hyper::header::{self, HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    None,
    Lax,
    Strict,
    /// Attribute left unset.
    Default,
}

impl SameSite {
    /// Map the configuration string to an attribute; unknown values leave
    /// the attribute unset.
    pub fn from_config(value: &str) -> Self {
        match value {
            "none" => SameSite::None,
            "lax" => SameSite::Lax,
            "strict" => SameSite::Strict,
            _ => SameSite::Default,
        }
    }

    fn as_attribute(&self) -> Option<&'static str> {
        match self {
            SameSite::None => Some("None"),
            SameSite::Lax => Some("Lax"),
            SameSite::Strict => Some("Strict"),
            SameSite::Default => Option::None,
        }
    }
}

/// Sticky cookie configuration for a balancer.
#[derive(Debug, Clone)]
pub struct StickyCookie {
    pub name: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// Seconds; 0 omits the attribute, negative emits `Max-Age=0`.
    pub max_age: i32,
    pub path: String,
    pub domain: String,
}

impl StickyCookie {
    /// A cookie with the given name and default attributes (`Path=/`).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secure: false,
            http_only: false,
            same_site: SameSite::Default,
            max_age: 0,
            path: "/".to_string(),
            domain: String::new(),
        }
    }

    /// Extract this cookie's value from the request headers, if present.
    pub fn request_value(&self, headers: &HeaderMap) -> Option<String> {
        for raw in headers.get_all(header::COOKIE) {
            let raw = match raw.to_str() {
                Ok(v) => v,
                Err(_) => continue,
            };
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    if name == self.name {
                        return Some(value.to_string());
                    }
                }
            }
        }
        None
    }

    /// Append a `Set-Cookie` header carrying `value` with the configured
    /// attributes.
    pub fn write(&self, headers: &mut HeaderMap, value: &str) {
        if let Ok(header_value) = HeaderValue::from_str(&self.render(value)) {
            headers.append(header::SET_COOKIE, header_value);
        }
    }

    fn render(&self, value: &str) -> String {
        let mut cookie = format!("{}={}", self.name, value);
        if !self.path.is_empty() {
            cookie.push_str("; Path=");
            cookie.push_str(&self.path);
        }
        if !self.domain.is_empty() {
            cookie.push_str("; Domain=");
            cookie.push_str(&self.domain);
        }
        if self.max_age > 0 {
            cookie.push_str(&format!("; Max-Age={}", self.max_age));
        } else if self.max_age < 0 {
            cookie.push_str("; Max-Age=0");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        if let Some(attr) = self.same_site.as_attribute() {
            cookie.push_str("; SameSite=");
            cookie.push_str(attr);
        }
        cookie
    }
}

/// 16-hex-character truncated SHA-256 of the input.
pub fn sha256_16(input: &str) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    match digest.get(..16) {
        Some(prefix) => prefix.to_string(),
        None => digest,
    }
}

/// Lower-case hex FNV-64 of the input, without leading zeros.
pub fn fnv64_hex(input: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(input.as_bytes());
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_16_known_values() {
        assert_eq!(sha256_16("backend1"), "6ca5b11d5afe7abc");
        assert_eq!(sha256_16("backend2"), "20f02375d055cc7b");
        assert_eq!(sha256_16("backend1").len(), 16);
    }

    #[test]
    fn test_fnv64_hex_known_values() {
        assert_eq!(fnv64_hex("backend1"), "f316fee910f693da");
        assert_eq!(fnv64_hex(&fnv64_hex("backend1")), "601cdace2c838548");
    }

    #[test]
    fn test_same_site_mapping() {
        assert_eq!(SameSite::from_config("none"), SameSite::None);
        assert_eq!(SameSite::from_config("lax"), SameSite::Lax);
        assert_eq!(SameSite::from_config("strict"), SameSite::Strict);
        assert_eq!(SameSite::from_config("bogus"), SameSite::Default);
        assert_eq!(SameSite::from_config(""), SameSite::Default);
    }

    #[test]
    fn test_render_minimal() {
        let cookie = StickyCookie::new("lb");
        assert_eq!(cookie.render("abcd"), "lb=abcd; Path=/");
    }

    #[test]
    fn test_render_all_attributes() {
        let cookie = StickyCookie {
            name: "lb".to_string(),
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            max_age: 3600,
            path: "/app".to_string(),
            domain: "example.com".to_string(),
        };
        assert_eq!(
            cookie.render("deadbeefdeadbeef"),
            "lb=deadbeefdeadbeef; Path=/app; Domain=example.com; Max-Age=3600; HttpOnly; Secure; SameSite=Lax"
        );
    }

    #[test]
    fn test_negative_max_age_expires_cookie() {
        let mut cookie = StickyCookie::new("lb");
        cookie.max_age = -1;
        assert!(cookie.render("v").contains("Max-Age=0"));
    }

    #[test]
    fn test_request_value_parsing() {
        let cookie = StickyCookie::new("lb");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; lb=6ca5b11d5afe7abc; trailing=x".parse().unwrap(),
        );
        assert_eq!(
            cookie.request_value(&headers).as_deref(),
            Some("6ca5b11d5afe7abc")
        );

        headers.insert(header::COOKIE, "other=1".parse().unwrap());
        assert_eq!(cookie.request_value(&headers), None);
    }
}
