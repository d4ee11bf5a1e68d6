//! HTTP surface: router assembly and the `/v1/*` ingress handlers.

pub mod catalog;
pub mod ingress;
pub mod routes;

pub use routes::{serve, AppState};
