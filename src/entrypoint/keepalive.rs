//! Keep-alive governance.
//!
//! HTTP/1.1 connections are bounded by a request count and a wall-clock
//! budget: when either limit is hit, the response that trips it carries
//! `Connection: close` and the server closes after writing it. H2c
//! connections are bounded by the request count alone, enforced by sending
//! GOAWAY once the capping stream completes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use hyper::header::{self, HeaderValue};
use hyper::Response;
use tokio::sync::Notify;

/// Per-connection request counter and age check for HTTP/1.1.
pub(crate) struct KeepAliveGovernor {
    /// 0 disables the cap.
    max_requests: u32,
    /// Zero disables the budget.
    max_time: Duration,
    started: Instant,
    served: AtomicU32,
}

impl KeepAliveGovernor {
    pub fn new(max_requests: u32, max_time: Duration) -> Self {
        Self {
            max_requests,
            max_time,
            started: Instant::now(),
            served: AtomicU32::new(0),
        }
    }

    /// Account for a request read off the connection. Returns true when the
    /// response to this request must carry `Connection: close`.
    ///
    /// The age check runs at request arrival, not response completion, so a
    /// slow handler does not retroactively close a connection that was
    /// within budget when the request came in.
    pub fn note_request(&self) -> bool {
        let served = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_requests > 0 && served >= self.max_requests {
            return true;
        }
        if !self.max_time.is_zero() && self.started.elapsed() > self.max_time {
            return true;
        }
        false
    }

    /// Mark the response so the connection closes after it is written.
    pub fn mark_close<B>(resp: &mut Response<B>) {
        resp.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
}

/// Stream cap for H2c connections.
///
/// Once `max` streams have completed, [`H2cRequestCap::reached`] resolves
/// and the connection loop sends GOAWAY.
pub(crate) struct H2cRequestCap {
    /// 0 disables the cap.
    max: u32,
    completed: AtomicU32,
    goaway: Notify,
}

impl H2cRequestCap {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            completed: AtomicU32::new(0),
            goaway: Notify::new(),
        }
    }

    /// Account for one completed stream.
    pub fn note_stream_complete(&self) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max > 0 && completed >= self.max {
            self.goaway.notify_one();
        }
    }

    /// Resolves once the cap is reached; never resolves when disabled.
    pub async fn reached(&self) {
        if self.max == 0 {
            std::future::pending::<()>().await;
        }
        self.goaway.notified().await;
    }
}
