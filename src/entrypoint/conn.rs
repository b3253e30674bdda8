//! Connection plumbing for the entrypoint: the tracked-connection registry
//! used by graceful shutdown, preface sniffing, and the stream wrappers that
//! replay sniffed bytes and enforce the write timeout.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Sleep;

/// The HTTP/2 cleartext connection preface.
pub(crate) const H2C_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// One connection's close signal.
///
/// Cloneable so the connection loop and every in-flight request future can
/// wait on it at once; signaling wakes them all, and waiters arriving after
/// the signal return immediately.
#[derive(Clone)]
pub(crate) struct CloseSignal {
    inner: Arc<CloseInner>,
}

struct CloseInner {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    fn new() -> Self {
        Self {
            inner: Arc::new(CloseInner {
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    fn signal(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once the connection is closing.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Registry of live connections.
///
/// A connection registers once its first byte has been observed and
/// deregisters when its task finishes. Shutdown waits for the registry to
/// drain within the grace window, then force-closes the survivors.
pub(crate) struct ConnTracker {
    conns: Mutex<HashMap<u64, CloseSignal>>,
    next_id: AtomicU64,
    idle: Notify,
}

impl ConnTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            idle: Notify::new(),
        })
    }

    /// Track a connection; the returned guard deregisters on drop.
    pub fn register(self: &Arc<Self>) -> TrackedConn {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let close = CloseSignal::new();
        self.conns
            .lock()
            .expect("connection tracker lock poisoned")
            .insert(id, close.clone());
        TrackedConn {
            tracker: self.clone(),
            id,
            close,
        }
    }

    /// Signal every live connection to close now.
    pub fn force_close_all(&self) {
        let conns = self.conns.lock().expect("connection tracker lock poisoned");
        for close in conns.values() {
            close.signal();
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns
            .lock()
            .expect("connection tracker lock poisoned")
            .len()
    }

    /// Wait until no connection is tracked anymore.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn deregister(&self, id: u64) {
        let mut conns = self.conns.lock().expect("connection tracker lock poisoned");
        conns.remove(&id);
        if conns.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Guard for one tracked connection.
pub(crate) struct TrackedConn {
    tracker: Arc<ConnTracker>,
    id: u64,
    close: CloseSignal,
}

impl TrackedConn {
    /// Resolves when shutdown decides to force-close this connection.
    pub async fn force_closed(&self) {
        self.close.wait().await;
    }

    /// A shareable handle to this connection's close signal, for racing
    /// request handlers against the connection going away.
    pub fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        self.tracker.deregister(self.id);
    }
}

/// Decide whether a connection speaks H2c by consuming up to one preface
/// worth of bytes; whatever was consumed is replayed by the returned stream.
pub(crate) async fn sniff_h2c_preface(
    stream: TcpStream,
) -> io::Result<(SniffedStream<TcpStream>, bool)> {
    let mut buffer: Vec<u8> = Vec::with_capacity(H2C_PREFACE.len());
    let mut chunk = [0u8; 24];

    while buffer.len() < H2C_PREFACE.len() {
        stream.readable().await?;
        let needed = H2C_PREFACE.len() - buffer.len();
        match stream.try_read(&mut chunk[..needed]) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if !H2C_PREFACE.starts_with(&buffer) {
                    return Ok((SniffedStream::new(stream, buffer), false));
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }

    let is_h2c = buffer.len() == H2C_PREFACE.len();
    Ok((SniffedStream::new(stream, buffer), is_h2c))
}

/// A stream replaying sniffed bytes before reading from the wire again.
pub(crate) struct SniffedStream<S> {
    stream: S,
    buffer: Vec<u8>,
    cursor: usize,
}

impl<S> SniffedStream<S> {
    pub fn new(stream: S, buffer: Vec<u8>) -> Self {
        Self {
            stream,
            buffer,
            cursor: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cursor < self.buffer.len() && buf.remaining() > 0 {
            let remaining = self.buffer.len() - self.cursor;
            let to_copy = remaining.min(buf.remaining());
            let start = self.cursor;
            buf.put_slice(&self.buffer[start..start + to_copy]);
            self.cursor += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A stream applying a per-operation write deadline.
///
/// A write that stays pending past the deadline fails with `TimedOut`,
/// which truncates the response and closes the connection.
pub(crate) struct TimedStream<S> {
    inner: S,
    write_timeout: Option<Duration>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, write_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            write_timeout: write_timeout.filter(|t| !t.is_zero()),
            write_deadline: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if let Some(timeout) = this.write_timeout {
                    let deadline = this
                        .write_deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tracker_register_and_drop() {
        let tracker = ConnTracker::new();
        assert_eq!(tracker.len(), 0);

        let guard = tracker.register();
        assert_eq!(tracker.len(), 1);

        drop(guard);
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_last_deregistration() {
        let tracker = ConnTracker::new();
        let guard = tracker.register();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle never resolved")
            .unwrap();
    }

    #[tokio::test]
    async fn test_force_close_signal_is_not_lost() {
        let tracker = ConnTracker::new();
        let guard = tracker.register();

        // Signal before anyone awaits: late waiters still observe it.
        tracker.force_close_all();
        tokio::time::timeout(Duration::from_secs(1), guard.force_closed())
            .await
            .expect("force close signal lost");
    }

    #[tokio::test]
    async fn test_close_signal_wakes_every_waiter() {
        let tracker = ConnTracker::new();
        let guard = tracker.register();

        // The connection loop and an in-flight request wait concurrently.
        let request_side = guard.close_signal();
        let waiter = tokio::spawn(async move { request_side.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tracker.force_close_all();
        tokio::time::timeout(Duration::from_secs(1), guard.force_closed())
            .await
            .expect("connection-side waiter never woke");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("request-side waiter never woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sniffed_stream_replays_buffer() {
        let (client, server) = tokio::io::duplex(64);
        let mut sniffed = SniffedStream::new(server, b"PREFIX".to_vec());

        let mut client = client;
        client.write_all(b"-rest").await.unwrap();
        drop(client);

        let mut out = Vec::new();
        sniffed.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"PREFIX-rest");
    }

    #[tokio::test]
    async fn test_sniff_detects_h2c_preface() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(H2C_PREFACE).await.unwrap();
            stream.write_all(b"frames").await.unwrap();
            stream
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut sniffed, is_h2c) = sniff_h2c_preface(stream).await.unwrap();
        assert!(is_h2c);

        // The preface is replayed to whoever reads next.
        let mut replay = vec![0u8; H2C_PREFACE.len()];
        sniffed.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, H2C_PREFACE);

        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_sniff_rejects_http1_request_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            stream
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut sniffed, is_h2c) = sniff_h2c_preface(stream).await.unwrap();
        assert!(!is_h2c);

        let mut replay = vec![0u8; 4];
        sniffed.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, b"GET ");

        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_timed_stream_passthrough() {
        let (client, server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(client, Some(Duration::from_secs(1)));

        timed.write_all(b"hello").await.unwrap();
        drop(timed);

        let mut server = server;
        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_stream_write_deadline_fires() {
        // One-byte pipe: the second write stays pending until the deadline.
        let (client, _server) = tokio::io::duplex(1);
        let mut timed = TimedStream::new(client, Some(Duration::from_millis(50)));

        timed.write_all(b"a").await.unwrap();
        let err = timed.write_all(b"b").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
