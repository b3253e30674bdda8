//! Load balancing subsystem.
//!
//! # Components
//!
//! - [`Balancer`]: weighted round-robin over an Earliest-Deadline-First
//!   schedule; O(log n) picks under a single reader/writer lock
//! - [`StickyCookie`]: cookie-based session affinity with legacy-hash
//!   compatibility
//!
//! # Selection
//!
//! Each backend holds a virtual deadline. A pick takes the earliest
//! deadline and advances it by `1/weight`, so a backend with weight 2 is
//! picked twice as often as one with weight 1. Backends reported down and
//! fenced backends (terminating but still serving existing sessions) keep
//! rotating through the schedule without ever being returned.
//!
//! # Concurrency
//!
//! One `RwLock` guards the heap, the health and fence sets and both sticky
//! maps. Picks and adds take the write lock; sticky lookups take the read
//! lock; no lock is held across a handler invocation.

pub mod balancer;
pub mod sticky;

pub use balancer::{Balancer, BalancerError, NamedHandler, NO_AVAILABLE_SERVER};
pub use sticky::{SameSite, StickyCookie};
