//! Liveness testing: one kernel carrying every node, delay tests through its
//! control plane

use crate::kernel::{wait_for_release, Controller, KernelNode, KernelProcess, KernelSettings};
use crate::limiter::Limiter;
use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;
use tracing::{error, info, warn};

/// Default URL the kernel fetches to measure delay
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Default timeout of a single delay test in milliseconds
const DEFAULT_TEST_TIMEOUT_MS: u64 = 5000;

/// Default number of delay samples per node
const DEFAULT_SAMPLES: usize = 3;

/// Default number of nodes tested at once
const DEFAULT_CONCURRENCY: usize = 10;

/// Outcome of a liveness run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatencyOutcome {
    /// The kernel did not start or its control plane never became ready
    KernelUnavailable,
    /// Best delay per node, in input order; `None` means dead
    Measured(Vec<Option<u64>>),
}

#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn measure(&self, nodes: &[KernelNode]) -> LatencyOutcome;
}

/// Configuration for delay tests
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    pub test_url: String,
    /// Timeout the kernel applies to each sample
    pub timeout: Duration,
    /// Samples per node; the smallest is kept
    pub samples: usize,
    pub concurrency: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_TEST_URL.to_string(),
            timeout: Duration::from_millis(DEFAULT_TEST_TIMEOUT_MS),
            samples: DEFAULT_SAMPLES,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl LatencyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Take up to `samples` delay measurements of node `id` and keep the smallest.
///
/// The first failed sample ends sampling and the node counts as dead: one
/// timeout is already a sign of an unstable node.
pub async fn sample_delay(controller: &Controller, id: &str, config: &LatencyConfig) -> Option<u64> {
    let mut best: Option<u64> = None;
    for _ in 0..config.samples.max(1) {
        let delay = controller
            .query_delay(id, &config.test_url, config.timeout)
            .await?;
        best = Some(best.map_or(delay, |b| b.min(delay)));
    }
    best
}

/// Liveness through a locally spawned kernel
pub struct KernelLatencyProbe {
    settings: KernelSettings,
    config: LatencyConfig,
}

impl KernelLatencyProbe {
    pub fn new(settings: KernelSettings, config: LatencyConfig) -> Self {
        Self { settings, config }
    }

    async fn measure_with(&self, controller: &Controller, nodes: &[KernelNode]) -> Vec<Option<u64>> {
        let tasks: Vec<_> = nodes
            .iter()
            .map(|node| delay_task(controller.clone(), node.id.clone(), self.config.clone()))
            .collect();
        Limiter::new(self.config.concurrency).run(tasks).await
    }
}

/// Delay test task over owned data
fn delay_task(
    controller: Controller,
    id: String,
    config: LatencyConfig,
) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<u64>> + Send {
    move || {
        async move {
            sample_delay(&controller, &id, &config)
                .await
                .ok_or_else(|| anyhow!("{} did not answer every delay test", id))
        }
        .boxed()
    }
}

#[async_trait]
impl LatencyProbe for KernelLatencyProbe {
    async fn measure(&self, nodes: &[KernelNode]) -> LatencyOutcome {
        if nodes.is_empty() {
            return LatencyOutcome::Measured(Vec::new());
        }

        let port = self.settings.controller_port;
        if !wait_for_release(port, self.settings.release_timeout).await {
            warn!(port, "controller port still in use, starting anyway");
        }

        let config = self.settings.controlled_config(nodes.to_vec());
        let process = match KernelProcess::spawn(&self.settings.binary, &config).await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to start kernel for liveness test");
                return LatencyOutcome::KernelUnavailable;
            }
        };

        let controller = match self.settings.controller() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to build controller client");
                process.terminate().await;
                return LatencyOutcome::KernelUnavailable;
            }
        };
        if !controller.wait_ready(self.settings.shared_ready_timeout).await {
            error!(
                port,
                timeout_ms = self.settings.shared_ready_timeout.as_millis() as u64,
                "kernel control plane never became ready"
            );
            process.terminate().await;
            return LatencyOutcome::KernelUnavailable;
        }

        let delays = self.measure_with(&controller, nodes).await;
        process.terminate().await;

        let alive = delays.iter().filter(|d| d.is_some()).count();
        info!(alive, total = nodes.len(), "liveness test finished");
        LatencyOutcome::Measured(delays)
    }
}
