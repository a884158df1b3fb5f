//! The APT-facing proxy surface.
//!
//! Clients point their package manager at this HTTP server. Each request
//! is classified (package / index / release / unknown), validated against
//! the SSRF allowlist, and served from the cache, the peer swarm, or the
//! upstream mirror — in that order of preference. Index files passing
//! through are ingested so later package requests know their expected
//! hash and size.

pub mod classify;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod routes;

pub use classify::{classify, extract_target_url, RequestClass};
pub use error::ProxyError;
pub use handler::{ProxyConfig, ProxyDeps, ProxyService};
pub use metrics::ProxyMetrics;
pub use routes::router;
