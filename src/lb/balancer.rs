//! Weighted round-robin balancer based on Earliest Deadline First scheduling.
//!
//! Every backend carries a virtual deadline. A pick pops the smallest
//! deadline, advances it by `1/weight` and re-pushes the entry, giving
//! weighted fairness with floating point weights and an O(log n) pick.
//! Unhealthy and fenced backends still rotate through the heap (so they keep
//! aging alongside the healthy ones) but are never returned from a pick.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use hyper::{Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::lb::sticky::{fnv64_hex, sha256_16, StickyCookie};
use crate::proxy::{plain_text_response, HttpHandler, ProxyBody};

/// Body text of the 503 answered when no backend is selectable.
pub const NO_AVAILABLE_SERVER: &str = "no available server";

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("no available server")]
    NoAvailableServer,

    #[error("health check not enabled for this weighted service")]
    HealthCheckDisabled,
}

/// A backend registered with the balancer.
pub struct NamedHandler {
    name: String,
    hashed_name: String,
    weight: f64,
    handler: Arc<dyn HttpHandler>,
}

impl NamedHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sticky cookie value identifying this backend.
    pub fn hashed_name(&self) -> &str {
        &self.hashed_name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// Heap entry: the deadline lives here, next to the shared backend record.
#[derive(Clone)]
struct HeapEntry {
    deadline: f64,
    handler: Arc<NamedHandler>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.total_cmp(&other.deadline) == CmpOrdering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the std max-heap pops the smallest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.total_cmp(&self.deadline)
    }
}

type StatusUpdater = Box<dyn Fn(bool) + Send + Sync>;

/// Everything guarded by the balancer's single reader/writer lock.
struct BalancerState {
    handlers: BinaryHeap<HeapEntry>,
    /// Virtual clock; equals the deadline of the most recently picked
    /// handler and never decreases.
    cur_deadline: f64,
    /// Names of the currently healthy children.
    status: HashSet<String>,
    /// Terminating yet still serving children: reachable through sticky
    /// sessions, excluded from picks.
    fenced: HashSet<String>,
    sticky_map: HashMap<String, Arc<NamedHandler>>,
    compatibility_sticky_map: HashMap<String, Arc<NamedHandler>>,
}

/// Weighted round-robin load balancer with health awareness and cookie
/// stickiness.
pub struct Balancer {
    sticky_cookie: Option<StickyCookie>,
    wants_health_check: bool,
    state: RwLock<BalancerState>,
    /// Hooks run when the aggregated up/down status changes. Registered
    /// during configuration assembly, invoked under the state write lock;
    /// an updater must not call back into this balancer's write path.
    updaters: RwLock<Vec<StatusUpdater>>,
}

impl Balancer {
    pub fn new(sticky_cookie: Option<StickyCookie>, wants_health_check: bool) -> Self {
        Self {
            sticky_cookie,
            wants_health_check,
            state: RwLock::new(BalancerState {
                handlers: BinaryHeap::new(),
                cur_deadline: 0.0,
                status: HashSet::new(),
                fenced: HashSet::new(),
                sticky_map: HashMap::new(),
                compatibility_sticky_map: HashMap::new(),
            }),
            updaters: RwLock::new(Vec::new()),
        }
    }

    /// Register a backend.
    ///
    /// A backend with a non-positive weight is ignored. The new backend's
    /// first deadline is `cur_deadline + 1/weight`, so it competes fairly
    /// with the existing entries from the next pick on.
    pub fn add(&self, name: &str, handler: Arc<dyn HttpHandler>, weight: Option<i32>, fenced: bool) {
        let weight = weight.unwrap_or(1);
        if weight <= 0 {
            // non-positive weight is meaningless
            return;
        }

        let handler = Arc::new(NamedHandler {
            name: name.to_string(),
            hashed_name: sha256_16(name),
            weight: f64::from(weight),
            handler,
        });

        let mut state = self.state.write().expect("balancer lock poisoned");
        let deadline = state.cur_deadline + 1.0 / handler.weight;
        state.handlers.push(HeapEntry {
            deadline,
            handler: handler.clone(),
        });
        state.status.insert(name.to_string());
        if fenced {
            state.fenced.insert(name.to_string());
        }

        if self.sticky_cookie.is_some() {
            state
                .sticky_map
                .insert(handler.hashed_name.clone(), handler.clone());
            state
                .compatibility_sticky_map
                .insert(name.to_string(), handler.clone());

            let legacy = fnv64_hex(name);
            // Backend identifiers used to be hashed twice on some paths, so
            // both single and double digests may live in old cookies.
            state
                .compatibility_sticky_map
                .insert(fnv64_hex(&legacy), handler.clone());
            state.compatibility_sticky_map.insert(legacy, handler);
        }
    }

    /// Record the given child as up or down.
    ///
    /// Updaters fire only when the aggregated status (any child up) flips,
    /// and they run while the write lock is held so later registrations
    /// never observe earlier transitions.
    pub fn set_status(&self, child_name: &str, up: bool) {
        let mut state = self.state.write().expect("balancer lock poisoned");

        let up_before = !state.status.is_empty();
        debug!(child = child_name, up, "setting child status");

        if up {
            state.status.insert(child_name.to_string());
        } else {
            state.status.remove(child_name);
        }

        let up_after = !state.status.is_empty();
        if up_before == up_after {
            debug!(up = up_after, "aggregated status unchanged, not propagating");
            return;
        }

        debug!(up = up_after, "propagating new aggregated status");
        let updaters = self.updaters.read().expect("balancer lock poisoned");
        for updater in updaters.iter() {
            updater(up_after);
        }
    }

    /// Register a hook observing aggregated up/down transitions.
    ///
    /// Fails when health checking was not requested for this service.
    /// Not safe to call concurrently with itself; it runs during
    /// configuration assembly.
    pub fn register_status_updater(
        &self,
        updater: impl Fn(bool) + Send + Sync + 'static,
    ) -> Result<(), BalancerError> {
        if !self.wants_health_check {
            return Err(BalancerError::HealthCheckDisabled);
        }
        self.updaters
            .write()
            .expect("balancer lock poisoned")
            .push(Box::new(updater));
        Ok(())
    }

    /// Pick the healthy, non-fenced backend with the earliest deadline.
    fn next_server(&self) -> Result<Arc<NamedHandler>, BalancerError> {
        let mut state = self.state.write().expect("balancer lock poisoned");

        if state.handlers.is_empty()
            || state.status.is_empty()
            || state.fenced.len() == state.handlers.len()
        {
            return Err(BalancerError::NoAvailableServer);
        }

        loop {
            // The pre-check guarantees the loop terminates: at least one
            // handler passes the predicate, and rotations never remove
            // entries.
            let Some(mut entry) = state.handlers.pop() else {
                return Err(BalancerError::NoAvailableServer);
            };

            state.cur_deadline = entry.deadline;
            entry.deadline += 1.0 / entry.handler.weight;

            let handler = entry.handler.clone();
            state.handlers.push(entry);

            if state.status.contains(&handler.name) && !state.fenced.contains(&handler.name) {
                debug!(service = %handler.name, "service selected by wrr");
                return Ok(handler);
            }
        }
    }

    /// Dispatch a request: sticky session first, then a weighted pick.
    ///
    /// Fenced backends stay reachable through their sticky cookie; they are
    /// only excluded from fresh picks.
    pub async fn serve(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        if let Some(cookie) = &self.sticky_cookie {
            if let Some(value) = cookie.request_value(req.headers()) {
                let direct = {
                    let state = self.state.read().expect("balancer lock poisoned");
                    state
                        .sticky_map
                        .get(&value)
                        .filter(|h| state.status.contains(&h.name))
                        .cloned()
                };
                if let Some(handler) = direct {
                    return handler.handler.clone().call(req).await;
                }

                let legacy = {
                    let state = self.state.read().expect("balancer lock poisoned");
                    state
                        .compatibility_sticky_map
                        .get(&value)
                        .filter(|h| state.status.contains(&h.name))
                        .cloned()
                };
                if let Some(handler) = legacy {
                    // Rewrite the legacy cookie to its current form.
                    let mut resp = handler.handler.clone().call(req).await;
                    cookie.write(resp.headers_mut(), &handler.hashed_name);
                    return resp;
                }
            }
        }

        let server = match self.next_server() {
            Ok(server) => server,
            Err(BalancerError::NoAvailableServer) => {
                return plain_text_response(StatusCode::SERVICE_UNAVAILABLE, NO_AVAILABLE_SERVER);
            }
            Err(err) => {
                warn!(error = %err, "balancer failed to pick a server");
                return plain_text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
            }
        };

        let sticky = self
            .sticky_cookie
            .as_ref()
            .map(|cookie| (cookie.clone(), server.hashed_name.clone()));

        let mut resp = server.handler.clone().call(req).await;
        if let Some((cookie, hashed_name)) = sticky {
            cookie.write(resp.headers_mut(), &hashed_name);
        }
        resp
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .expect("balancer lock poisoned")
            .handlers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deadlines in pop order, for asserting the heap stays ordered.
    #[cfg(test)]
    fn deadlines_in_pop_order(&self) -> Vec<(String, f64)> {
        let state = self.state.read().expect("balancer lock poisoned");
        let mut heap = state.handlers.clone();
        let mut out = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            out.push((entry.handler.name.clone(), entry.deadline));
        }
        out
    }
}

impl HttpHandler for Balancer {
    fn call(self: Arc<Self>, req: Request<ProxyBody>) -> crate::proxy::HandlerFuture {
        Box::pin(async move { self.serve(req).await })
    }
}
