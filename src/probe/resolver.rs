//! Egress geolocation strategies
//!
//! Each strategy makes the geolocation query leave through the node being
//! located, so the answer describes the node's egress rather than this host.

use super::geo::{GeoRecord, GeoSource};
use crate::http::{HttpClient, HttpConfig};
use crate::kernel::{
    wait_for_port, wait_for_release, KernelConfig, KernelNode, KernelProcess, KernelSettings,
    MetaClient, SELECT_GROUP,
};
use crate::limiter::Limiter;
use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default number of nodes located at once
const DEFAULT_CONCURRENCY: usize = 5;

/// Default timeout of a geolocation request in milliseconds
const DEFAULT_GEO_TIMEOUT_MS: u64 = 10_000;

/// Dedicated kernels take ports `base .. base + PORT_SPAN`
const PORT_SPAN: usize = 900;

#[async_trait]
pub trait GeoResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Locate the egress of every node. Result `i` belongs to `nodes[i]`;
    /// `None` means the node could not be located.
    async fn resolve(&self, nodes: &[KernelNode], source: &GeoSource) -> Vec<Option<GeoRecord>>;
}

/// Configuration shared by all resolvers
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub concurrency: usize,
    /// Settings for requests sent through the node
    pub http: HttpConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            http: HttpConfig::new().with_timeout(Duration::from_millis(DEFAULT_GEO_TIMEOUT_MS)),
        }
    }
}

impl ResolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }
}

/// One single-node kernel per node, several in parallel
pub struct DedicatedProcessResolver {
    settings: KernelSettings,
    config: ResolverConfig,
}

impl DedicatedProcessResolver {
    pub fn new(settings: KernelSettings, config: ResolverConfig) -> Self {
        Self { settings, config }
    }

    /// Egress port for the `slot`-th node
    fn port_for(&self, slot: usize) -> u16 {
        self.settings.base_port.saturating_add((slot % PORT_SPAN) as u16)
    }
}

/// Locate one node through a single-node kernel listening on `port`.
async fn locate_dedicated(
    settings: &KernelSettings,
    http: HttpConfig,
    port: u16,
    node: &KernelNode,
    source: &GeoSource,
) -> Option<GeoRecord> {
    if !wait_for_release(port, settings.release_timeout).await {
        debug!(port, id = %node.id, "egress port still in use");
    }

    let config = KernelConfig::new(port).with_nodes(vec![node.clone()]);
    let process = match KernelProcess::spawn(&settings.binary, &config).await {
        Ok(p) => p,
        Err(e) => {
            error!(id = %node.id, error = %e, "failed to start kernel");
            return None;
        }
    };

    let geo = if wait_for_port(port, settings.dedicated_ready_timeout).await {
        match HttpClient::via_proxy(http, port) {
            Ok(client) => source.fetch(&client).await,
            Err(e) => {
                error!(id = %node.id, error = %e, "failed to build client");
                None
            }
        }
    } else {
        warn!(id = %node.id, port, "kernel never opened its egress port");
        None
    };

    process.terminate().await;
    geo
}

fn dedicated_task(
    settings: KernelSettings,
    http: HttpConfig,
    port: u16,
    node: KernelNode,
    source: GeoSource,
) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<GeoRecord>> + Send {
    move || {
        async move {
            locate_dedicated(&settings, http, port, &node, &source)
                .await
                .ok_or_else(|| anyhow!("{} could not be located", node.id))
        }
        .boxed()
    }
}

fn meta_task(
    http: HttpConfig,
    host: String,
    port: u16,
    id: String,
    source: GeoSource,
) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<GeoRecord>> + Send {
    move || {
        async move {
            let client = HttpClient::via_proxy_at(http, &host, port)?;
            source
                .fetch(&client)
                .await
                .ok_or_else(|| anyhow!("{} could not be located", id))
        }
        .boxed()
    }
}

#[async_trait]
impl GeoResolver for DedicatedProcessResolver {
    fn name(&self) -> &'static str {
        "dedicated"
    }

    async fn resolve(&self, nodes: &[KernelNode], source: &GeoSource) -> Vec<Option<GeoRecord>> {
        if nodes.is_empty() {
            return Vec::new();
        }
        let tasks: Vec<_> = nodes
            .iter()
            .enumerate()
            .map(|(slot, node)| {
                dedicated_task(
                    self.settings.clone(),
                    self.config.http.clone(),
                    self.port_for(slot),
                    node.clone(),
                    source.clone(),
                )
            })
            .collect();
        Limiter::new(self.config.concurrency).run(tasks).await
    }
}

/// One kernel carrying every node; the select group is switched to each node
/// in turn and the query goes out through the shared egress port.
///
/// Switching is global to the kernel, so nodes are located one at a time.
pub struct SharedProcessResolver {
    settings: KernelSettings,
    config: ResolverConfig,
}

impl SharedProcessResolver {
    pub fn new(settings: KernelSettings, config: ResolverConfig) -> Self {
        Self { settings, config }
    }
}

#[async_trait]
impl GeoResolver for SharedProcessResolver {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn resolve(&self, nodes: &[KernelNode], source: &GeoSource) -> Vec<Option<GeoRecord>> {
        let mut results = vec![None; nodes.len()];
        if nodes.is_empty() {
            return results;
        }

        if !wait_for_release(self.settings.controller_port, self.settings.release_timeout).await {
            warn!(port = self.settings.controller_port, "controller port still in use, starting anyway");
        }
        let config = self.settings.controlled_config(nodes.to_vec());
        let process = match KernelProcess::spawn(&self.settings.binary, &config).await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to start shared kernel");
                return results;
            }
        };
        let controller = match self.settings.controller() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to build controller client");
                process.terminate().await;
                return results;
            }
        };
        if !controller.wait_ready(self.settings.shared_ready_timeout).await {
            error!("shared kernel control plane never became ready");
            process.terminate().await;
            return results;
        }

        let port = config.mixed_port();
        for (node, slot) in nodes.iter().zip(results.iter_mut()) {
            if let Err(e) = controller.select(SELECT_GROUP, &node.id).await {
                warn!(id = %node.id, error = %e, "failed to switch to node");
                continue;
            }
            // A fresh client per node so no pooled connection outlives the switch.
            match HttpClient::via_proxy(self.config.http.clone(), port) {
                Ok(client) => *slot = source.fetch(&client).await,
                Err(e) => error!(id = %node.id, error = %e, "failed to build client"),
            }
        }

        process.terminate().await;
        results
    }
}

/// Kernels run by an http-meta service, one egress port per node
pub struct MetaResolver {
    client: MetaClient,
    config: ResolverConfig,
    /// Wait after start before the first query
    start_delay: Duration,
    /// Lifetime budget per node, used to size the session timeout
    node_timeout: Duration,
}

impl MetaResolver {
    pub fn new(client: MetaClient, config: ResolverConfig) -> Self {
        Self {
            client,
            config,
            start_delay: Duration::from_millis(3000),
            node_timeout: Duration::from_millis(10_000),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }
}

#[async_trait]
impl GeoResolver for MetaResolver {
    fn name(&self) -> &'static str {
        "meta"
    }

    async fn resolve(&self, nodes: &[KernelNode], source: &GeoSource) -> Vec<Option<GeoRecord>> {
        if nodes.is_empty() {
            return Vec::new();
        }

        let lifetime = self.start_delay + self.node_timeout * nodes.len() as u32;
        let session = match self.client.start(nodes, lifetime).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "http-meta start failed");
                return vec![None; nodes.len()];
            }
        };
        info!(
            wait_ms = self.start_delay.as_millis() as u64,
            "waiting for http-meta kernel"
        );
        tokio::time::sleep(self.start_delay).await;

        let host = self.client.host().to_string();
        let tasks: Vec<_> = nodes
            .iter()
            .zip(&session.ports)
            .map(|(node, &port)| {
                meta_task(
                    self.config.http.clone(),
                    host.clone(),
                    port,
                    node.id.clone(),
                    source.clone(),
                )
            })
            .collect();
        let results = Limiter::new(self.config.concurrency).run(tasks).await;

        if let Err(e) = self.client.stop(session.pid).await {
            error!(pid = session.pid, error = %e, "http-meta stop failed");
        }
        results
    }
}
