//! Request middlewares applied before routing.

pub mod sanitize;

pub use sanitize::SanitizePath;
