//! Geolocation of a node's entrance, the server address clients connect to

use super::descriptor::{ProxyDescriptor, ENTRANCE_KEY};
use super::geo::{GeoDatabases, GeoRecord};
use crate::limiter::Limiter;
use anyhow::anyhow;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, error, info};

const DEFAULT_CONCURRENCY: usize = 10;

/// Looks server addresses up in the local databases.
///
/// Hostnames are resolved first; only IPv4 answers are used.
#[derive(Debug, Clone)]
pub struct EntranceLocator {
    databases: Arc<GeoDatabases>,
    lang: String,
    concurrency: usize,
}

impl EntranceLocator {
    pub fn new(databases: Arc<GeoDatabases>, lang: impl Into<String>) -> Self {
        Self {
            databases,
            lang: lang.into(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    async fn resolve_ipv4(server: &str) -> Option<Ipv4Addr> {
        if let Ok(ip) = server.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            };
        }
        match tokio::net::lookup_host((server, 0)).await {
            Ok(addrs) => addrs.into_iter().find_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            }),
            Err(e) => {
                debug!(server, error = %e, "failed to resolve server");
                None
            }
        }
    }

    /// Locate one server address.
    pub async fn locate(&self, server: &str) -> Option<GeoRecord> {
        let ip = Self::resolve_ipv4(server).await?;
        match self.databases.lookup(ip, &self.lang) {
            Ok(geo) => geo,
            Err(e) => {
                error!(server, ip = %ip, error = %e, "geolocation database lookup failed");
                None
            }
        }
    }

    /// Attach `_entrance` to every descriptor whose server could be located.
    /// Returns how many were annotated.
    pub async fn annotate(&self, descriptors: &mut [ProxyDescriptor]) -> usize {
        let servers: Vec<Option<String>> = descriptors
            .iter()
            .map(|d| d.server().map(str::to_string))
            .collect();
        let tasks = servers.iter().map(|server| {
            move || async move {
                let server = server.as_deref().ok_or_else(|| anyhow!("descriptor has no server"))?;
                self.locate(server)
                    .await
                    .ok_or_else(|| anyhow!("entrance {} could not be located", server))
            }
        });
        let located = Limiter::new(self.concurrency).run(tasks).await;

        let mut annotated = 0;
        for (descriptor, geo) in descriptors.iter_mut().zip(located) {
            let Some(geo) = geo else { continue };
            match serde_json::to_value(&geo) {
                Ok(value) => {
                    descriptor.insert(ENTRANCE_KEY, value);
                    annotated += 1;
                }
                Err(e) => error!(name = descriptor.name(), error = %e, "failed to serialise entrance"),
            }
        }
        info!(annotated, total = descriptors.len(), "entrance lookup finished");
        annotated
    }
}
