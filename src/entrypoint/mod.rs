//! TCP entrypoint.
//!
//! An entrypoint owns one listener. Each accepted connection gets its first
//! byte peeked under the read timeout before any server learns about it;
//! the installed router then sends it down the raw TCP, HTTP/1.1 or H2c
//! pipeline (H2c is recognized by its connection preface). Keep-alive
//! limits bound how long an HTTP connection may be reused, and shutdown
//! drains in-flight traffic before force-closing what remains.
//!
//! # Shutdown
//!
//! ```text
//! Accepting
//!   │  shutdown()
//!   ▼
//! DrainingAccept        listener closed; dial now refused
//!   │  request_accept_grace_timeout
//!   ▼
//! DrainingConnections   HTTP servers drain, tracked conns get grace_timeout
//!   ▼
//! Terminated            survivors force-closed
//! ```

pub mod conn;
pub mod keepalive;
pub mod router;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::proxy::error::error_response;
use crate::proxy::{boxed_incoming, ForwardError, HttpHandler, ProxyBody};
use conn::{sniff_h2c_preface, CloseSignal, ConnTracker, TimedStream, TrackedConn};
use keepalive::{H2cRequestCap, KeepAliveGovernor};
use router::{Route, Router};

pub use router::{TcpHandler, TcpHandlerFn, TcpHandlerFuture};

/// Ping ack budget for H2c keep-alive probes.
const H2_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a handler, answering 499 when the connection dies first.
///
/// Dropping the losing handler future cancels its in-flight upstream
/// exchange, so a downstream disconnect propagates upstream. The response
/// usually has no live socket left to be written to; that write failure is
/// the connection loop's to log at debug.
async fn call_racing_disconnect(
    handler: Arc<dyn HttpHandler>,
    req: Request<ProxyBody>,
    closed: CloseSignal,
) -> Response<ProxyBody> {
    tokio::select! {
        resp = handler.call(req) => resp,
        _ = closed.wait() => error_response(&ForwardError::ClientGone),
    }
}

/// Grace periods applied during shutdown.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Pause between closing the listener and draining connections.
    pub request_accept_grace_timeout: Duration,
    /// How long in-flight connections may take to finish before being
    /// force-closed. Zero means terminate immediately.
    pub grace_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            request_accept_grace_timeout: Duration::ZERO,
            grace_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection-level limits for an entrypoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Budget for the first byte of a connection (and for request headers).
    /// Zero disables it.
    pub read_timeout: Duration,
    /// Per-write deadline on HTTP connections. Zero disables it.
    pub write_timeout: Duration,
    /// Keep-alive idle budget. Zero disables it.
    pub idle_timeout: Duration,
    /// Requests served per connection before it is closed. 0 = unlimited.
    pub keep_alive_max_requests: u32,
    /// Wall-clock budget for one connection. Zero = unlimited.
    pub keep_alive_max_time: Duration,
    pub lifecycle: LifecycleConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(180),
            keep_alive_max_requests: 0,
            keep_alive_max_time: Duration::ZERO,
            lifecycle: LifecycleConfig::default(),
        }
    }
}

/// Entrypoint lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntrypointState {
    /// Bound but not yet accepting.
    Bound = 0,
    Accepting = 1,
    DrainingAccept = 2,
    DrainingConnections = 3,
    Terminated = 4,
}

impl EntrypointState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EntrypointState::Bound,
            1 => EntrypointState::Accepting,
            2 => EntrypointState::DrainingAccept,
            3 => EntrypointState::DrainingConnections,
            _ => EntrypointState::Terminated,
        }
    }
}

/// A TCP entrypoint: listener, dispatch and coordinated shutdown.
pub struct TcpEntrypoint {
    name: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    router: ArcSwap<Router>,
    tracker: Arc<ConnTracker>,
    transport: TransportConfig,
    state: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_closed: Notify,
    accept_closed_flag: AtomicU8,
}

impl TcpEntrypoint {
    /// Bind the entrypoint. It does not accept until [`start`] runs.
    ///
    /// [`start`]: TcpEntrypoint::start
    pub async fn new(name: &str, address: &str, transport: TransportConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind entrypoint '{}' on {}", name, address))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read local address")?;

        info!(entrypoint = name, address = %local_addr, "entrypoint bound");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            name: name.to_string(),
            local_addr,
            listener: Mutex::new(Some(listener)),
            router: ArcSwap::from_pointee(Router::new()),
            tracker: ConnTracker::new(),
            transport,
            state: AtomicU8::new(EntrypointState::Bound as u8),
            shutdown_tx,
            shutdown_rx,
            accept_closed: Notify::new(),
            accept_closed_flag: AtomicU8::new(0),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> EntrypointState {
        EntrypointState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Atomically replace the active router. Connections already dispatched
    /// keep the router they were matched with; new peeks see the new one.
    pub fn switch_router(&self, router: Router) {
        self.router.store(Arc::new(router));
    }

    /// Run the accept loop until shutdown closes the listener.
    pub async fn start(self: Arc<Self>) {
        let listener = match self.listener.lock().expect("listener lock poisoned").take() {
            Some(listener) => listener,
            None => {
                warn!(entrypoint = %self.name, "entrypoint already started");
                return;
            }
        };

        let _ = self.state.compare_exchange(
            EntrypointState::Bound as u8,
            EntrypointState::Accepting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        info!(entrypoint = %self.name, address = %self.local_addr, "entrypoint accepting");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let entrypoint = self.clone();
                            tokio::spawn(async move {
                                entrypoint.handle_connection(stream, remote).await;
                            });
                        }
                        Err(e) => {
                            error!(entrypoint = %self.name, error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        // Dropping the listener is what makes new dials observe
        // ECONNREFUSED during the drain.
        drop(listener);
        self.accept_closed_flag.store(1, Ordering::SeqCst);
        self.accept_closed.notify_waiters();
        debug!(entrypoint = %self.name, "listener closed");
    }

    /// Drive the shutdown state machine to completion.
    pub async fn shutdown(&self) {
        let prev = self
            .state
            .fetch_max(EntrypointState::DrainingAccept as u8, Ordering::SeqCst);
        if prev >= EntrypointState::DrainingAccept as u8 {
            // Another caller is already draining.
            return;
        }
        info!(entrypoint = %self.name, "shutting down, closing listener");

        let _ = self.shutdown_tx.send(true);
        let taken_listener = self.listener.lock().expect("listener lock poisoned").take();
        match taken_listener {
            // Never started: the listener is still ours to close.
            Some(listener) => drop(listener),
            None => self.wait_accept_closed().await,
        }

        let lifecycle = &self.transport.lifecycle;
        if !lifecycle.request_accept_grace_timeout.is_zero() {
            tokio::time::sleep(lifecycle.request_accept_grace_timeout).await;
        }

        self.state
            .store(EntrypointState::DrainingConnections as u8, Ordering::SeqCst);
        debug!(
            entrypoint = %self.name,
            connections = self.tracker.len(),
            grace_secs = lifecycle.grace_timeout.as_secs_f64(),
            "draining connections"
        );

        match tokio::time::timeout(lifecycle.grace_timeout, self.tracker.wait_idle()).await {
            Ok(()) => debug!(entrypoint = %self.name, "all connections drained"),
            Err(_) => {
                warn!(
                    entrypoint = %self.name,
                    remaining = self.tracker.len(),
                    "grace timeout expired, force closing connections"
                );
                self.tracker.force_close_all();
                self.tracker.wait_idle().await;
            }
        }

        self.state
            .store(EntrypointState::Terminated as u8, Ordering::SeqCst);
        info!(entrypoint = %self.name, "entrypoint terminated");
    }

    async fn wait_accept_closed(&self) {
        loop {
            let notified = self.accept_closed.notified();
            if self.accept_closed_flag.load(Ordering::SeqCst) == 1 {
                return;
            }
            notified.await;
        }
    }

    /// Peek, route and serve one accepted connection.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        // Until this peek returns, no server knows about the connection: a
        // client that sends nothing within the read timeout just sees EOF.
        let mut first = [0u8; 1];
        let read_timeout = self.transport.read_timeout;
        let peeked = if read_timeout.is_zero() {
            stream.peek(&mut first).await
        } else {
            match tokio::time::timeout(read_timeout, stream.peek(&mut first)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(%remote, "no first byte within read timeout, closing");
                    return;
                }
            }
        };
        match peeked {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!(%remote, error = %e, "peek failed, closing");
                return;
            }
        }

        let tracked = self.tracker.register();
        let route = self.router.load().route(first[0]);
        match route {
            Some(Route::Tcp(handler)) => {
                debug!(%remote, "dispatching raw tcp connection");
                let serve = handler.serve(stream, remote);
                tokio::select! {
                    _ = serve => {}
                    _ = tracked.force_closed() => {
                        debug!(%remote, "raw connection force closed");
                    }
                }
            }
            Some(Route::Http(handler)) => {
                self.serve_http(stream, remote, handler, tracked).await;
            }
            None => {
                debug!(%remote, first_byte = first[0], "no route for connection, closing");
            }
        }
    }

    async fn serve_http(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        handler: Arc<dyn HttpHandler>,
        tracked: TrackedConn,
    ) {
        // The sniff shares the read-timeout budget and aborts on force-close
        // so a client stalling mid-preface cannot pin the shutdown.
        let read_timeout = self.transport.read_timeout;
        let sniff = async {
            if read_timeout.is_zero() {
                sniff_h2c_preface(stream).await
            } else {
                match tokio::time::timeout(read_timeout, sniff_h2c_preface(stream)).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "preface sniff timed out",
                    )),
                }
            }
        };
        let sniffed = tokio::select! {
            result = sniff => result,
            _ = tracked.force_closed() => {
                debug!(%remote, "connection force closed during sniff");
                return;
            }
        };
        let (stream, is_h2c) = match sniffed {
            Ok(sniffed) => sniffed,
            Err(e) => {
                debug!(%remote, error = %e, "preface sniff failed, closing");
                return;
            }
        };

        let write_timeout = Some(self.transport.write_timeout).filter(|t| !t.is_zero());
        let io = TokioIo::new(TimedStream::new(stream, write_timeout));
        let mut shutdown_rx = self.shutdown_rx.clone();

        if is_h2c {
            let cap = Arc::new(H2cRequestCap::new(self.transport.keep_alive_max_requests));
            let service_cap = cap.clone();
            let closed = tracked.close_signal();
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                let cap = service_cap.clone();
                let closed = closed.clone();
                async move {
                    let resp =
                        call_racing_disconnect(handler, req.map(boxed_incoming), closed).await;
                    cap.note_stream_complete();
                    Ok::<_, Infallible>(resp)
                }
            });

            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder.timer(TokioTimer::new());
            if !self.transport.idle_timeout.is_zero() {
                builder.keep_alive_interval(Some(self.transport.idle_timeout));
                builder.keep_alive_timeout(H2_KEEP_ALIVE_TIMEOUT);
            }
            let conn = builder.serve_connection(io, service);
            tokio::pin!(conn);

            let mut draining = *shutdown_rx.borrow_and_update();
            if draining {
                conn.as_mut().graceful_shutdown();
            }
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!(%remote, error = %e, "h2c connection ended");
                        }
                        break;
                    }
                    _ = cap.reached(), if !draining => {
                        debug!(%remote, "h2c request cap reached, sending goaway");
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    changed = shutdown_rx.changed(), if !draining => {
                        let _ = changed;
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    _ = tracked.force_closed() => {
                        debug!(%remote, "h2c connection force closed");
                        break;
                    }
                }
            }
        } else {
            let governor = Arc::new(KeepAliveGovernor::new(
                self.transport.keep_alive_max_requests,
                self.transport.keep_alive_max_time,
            ));
            let closed = tracked.close_signal();
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                let governor = governor.clone();
                let closed = closed.clone();
                async move {
                    let close = governor.note_request();
                    let mut resp =
                        call_racing_disconnect(handler, req.map(boxed_incoming), closed).await;
                    if close {
                        KeepAliveGovernor::mark_close(&mut resp);
                    }
                    Ok::<_, Infallible>(resp)
                }
            });

            let mut builder = http1::Builder::new();
            builder.timer(TokioTimer::new()).keep_alive(true);
            if !self.transport.read_timeout.is_zero() {
                builder.header_read_timeout(self.transport.read_timeout);
            }
            let conn = builder.serve_connection(io, service).with_upgrades();
            tokio::pin!(conn);

            let mut draining = *shutdown_rx.borrow_and_update();
            if draining {
                conn.as_mut().graceful_shutdown();
            }
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!(%remote, error = %e, "http connection ended");
                        }
                        break;
                    }
                    changed = shutdown_rx.changed(), if !draining => {
                        let _ = changed;
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    _ = tracked.force_closed() => {
                        debug!(%remote, "http connection force closed");
                        break;
                    }
                }
            }
        }
    }
}
