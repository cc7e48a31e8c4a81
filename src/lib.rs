//! Node Probe - proxy node liveness and egress geolocation
//!
//! Probes a list of proxy node descriptors through a mihomo kernel, finds out
//! which nodes are alive and where their traffic exits, and renames them
//! accordingly. Also contains a reader for MaxMind-format geolocation
//! databases, used for offline lookups.

pub mod http;
pub mod kernel;
pub mod limiter;
pub mod mmdb;
pub mod probe;

#[cfg(test)]
pub(crate) mod testutil;

pub use limiter::Limiter;
pub use probe::{Pipeline, PipelineConfig, ProxyDescriptor};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
