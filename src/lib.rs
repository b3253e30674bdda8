//! relaygate - dynamic HTTP/TCP reverse proxy data plane
//!
//! The crate is organized around two subsystems: TCP entrypoints that peek
//! the first byte of each connection to dispatch between raw TCP, HTTP/1.1
//! and H2c pipelines, and a weighted round-robin load balancer scheduled by
//! earliest deadline first. Everything else (config model, forwarder,
//! middlewares) exists to connect those two.

pub mod config;
pub mod core;
pub mod entrypoint;
pub mod lb;
pub mod middleware;
pub mod proxy;

pub use config::Config;
pub use core::Core;
