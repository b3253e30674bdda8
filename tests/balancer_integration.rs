//! End-to-end tests through the assembled data plane: configuration →
//! core → entrypoint → sanitizer → balancer → forwarder → live backends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{COOKIE, HOST, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use relaygate::{Config, Core};

/// Spawn a backend that answers every request with its own name.
async fn spawn_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| async move {
                    Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(
                        Bytes::from(name),
                    )))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

async fn start_core(config_yaml: &str) -> (Core, SocketAddr) {
    let config: Config = serde_yaml::from_str(config_yaml).unwrap();
    let core = Core::new(config).await.unwrap();
    let addr = core.entrypoints()[0].local_addr();
    core.start();
    (core, addr)
}

/// One GET over a fresh connection; returns (body, set-cookie).
async fn get_once(addr: SocketAddr, cookie: Option<&str>) -> (String, Option<String>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn);

    let mut builder = Request::builder().uri("/").header(HOST, "test");
    if let Some(cookie) = cookie {
        builder = builder.header(COOKIE, cookie);
    }
    let req = builder.body(Empty::new()).unwrap();

    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let set_cookie = resp
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (String::from_utf8(body.to_vec()).unwrap(), set_cookie)
}

#[tokio::test]
async fn test_weighted_distribution_end_to_end() {
    let heavy = spawn_backend("heavy").await;
    let light = spawn_backend("light").await;

    let config = format!(
        r#"
entrypoints:
  web:
    address: "127.0.0.1:0"
services:
  app:
    backends:
      - name: heavy
        url: http://{heavy}
        weight: 3
      - name: light
        url: http://{light}
        weight: 1
"#
    );
    let (_core, addr) = start_core(&config).await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..8 {
        let (body, _) = get_once(addr, None).await;
        *counts.entry(body).or_default() += 1;
    }

    assert_eq!(counts.get("heavy"), Some(&6), "counts: {counts:?}");
    assert_eq!(counts.get("light"), Some(&2), "counts: {counts:?}");
}

#[tokio::test]
async fn test_sticky_session_end_to_end() {
    let first = spawn_backend("first").await;
    let second = spawn_backend("second").await;

    let config = format!(
        r#"
entrypoints:
  web:
    address: "127.0.0.1:0"
services:
  app:
    backends:
      - name: first
        url: http://{first}
      - name: second
        url: http://{second}
    sticky:
      cookie:
        name: lb
        http_only: true
"#
    );
    let (_core, addr) = start_core(&config).await;

    let (pinned, set_cookie) = get_once(addr, None).await;
    let set_cookie = set_cookie.expect("fresh pick must set the sticky cookie");
    assert!(set_cookie.starts_with("lb="), "{set_cookie}");
    assert!(set_cookie.contains("HttpOnly"));

    let cookie_pair = set_cookie.split(';').next().unwrap().to_string();

    // Every request carrying the cookie lands on the pinned backend, and
    // the cookie is not re-issued on direct sticky hits.
    for _ in 0..6 {
        let (body, rewritten) = get_once(addr, Some(&cookie_pair)).await;
        assert_eq!(body, pinned);
        assert!(rewritten.is_none());
    }
}

#[tokio::test]
async fn test_fenced_backend_takes_no_fresh_traffic() {
    let serving = spawn_backend("serving").await;
    let fenced = spawn_backend("fenced").await;

    let config = format!(
        r#"
entrypoints:
  web:
    address: "127.0.0.1:0"
services:
  app:
    backends:
      - name: serving
        url: http://{serving}
      - name: fenced
        url: http://{fenced}
        fenced: true
"#
    );
    let (_core, addr) = start_core(&config).await;

    for _ in 0..6 {
        let (body, _) = get_once(addr, None).await;
        assert_eq!(body, "serving");
    }
}

#[tokio::test]
async fn test_all_backends_fenced_yields_503() {
    let only = spawn_backend("only").await;

    let config = format!(
        r#"
entrypoints:
  web:
    address: "127.0.0.1:0"
services:
  app:
    backends:
      - name: only
        url: http://{only}
        fenced: true
"#
    );
    let (_core, addr) = start_core(&config).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri("/")
        .header(HOST, "test")
        .body(Empty::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"no available server");
}

#[tokio::test]
async fn test_unreachable_backend_classified_as_bad_gateway() {
    // Reserve a port, then free it so nothing listens there.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = reserved.local_addr().unwrap();
    drop(reserved);

    let config = format!(
        r#"
entrypoints:
  web:
    address: "127.0.0.1:0"
services:
  app:
    backends:
      - name: dead
        url: http://{dead}
"#
    );
    let (_core, addr) = start_core(&config).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri("/")
        .header(HOST, "test")
        .body(Empty::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_core_shutdown_stops_all_entrypoints() {
    let backend = spawn_backend("b").await;
    let config = format!(
        r#"
entrypoints:
  web:
    address: "127.0.0.1:0"
services:
  app:
    backends:
      - name: b
        url: http://{backend}
"#
    );
    let (core, addr) = start_core(&config).await;

    let (body, _) = get_once(addr, None).await;
    assert_eq!(body, "b");

    tokio::time::timeout(Duration::from_secs(5), core.shutdown())
        .await
        .expect("core shutdown hung");

    assert!(TcpStream::connect(addr).await.is_err());
}
