//! Client for an http-meta service, which runs kernels on our behalf and hands
//! back one egress port per submitted node.

use super::config::KernelNode;
use crate::Result;
use anyhow::{anyhow, Context};
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Default http-meta endpoint
pub const DEFAULT_META_URL: &str = "http://127.0.0.1:9876";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct StartRequest {
    proxies: Vec<Value>,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    pid: Option<u32>,
    ports: Option<Vec<u16>>,
}

#[derive(Debug, Serialize)]
struct StopRequest {
    pid: Vec<u32>,
}

/// A kernel started by the service. `ports[i]` is the egress port for node `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaSession {
    pub pid: u32,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct MetaClient {
    client: Client,
    base: Url,
    authorization: Option<String>,
}

impl MetaClient {
    pub fn new(base: &str, authorization: Option<String>) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid http-meta url {}", base))?;
        let client = Client::builder()
            .no_proxy()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base,
            authorization: authorization.filter(|a| !a.is_empty()),
        })
    }

    /// Host the egress ports listen on.
    pub fn host(&self) -> &str {
        self.base.host_str().unwrap_or("127.0.0.1")
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("http-meta url cannot carry a path"))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.authorization {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        }
    }

    /// Start one kernel carrying `nodes`. The service stops it by itself once
    /// `lifetime` has passed without a `stop`.
    pub async fn start(&self, nodes: &[KernelNode], lifetime: Duration) -> Result<MetaSession> {
        let body = StartRequest {
            proxies: nodes.iter().map(KernelNode::to_json).collect(),
            timeout: lifetime.as_millis() as u64,
        };
        let response: StartResponse = self
            .authorize(self.client.post(self.endpoint("start")?))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed http-meta start response")?;

        let (Some(pid), Some(ports)) = (response.pid, response.ports) else {
            return Err(anyhow!("http-meta start response lacks pid or ports"));
        };
        if ports.len() < nodes.len() {
            return Err(anyhow!(
                "http-meta returned {} ports for {} nodes",
                ports.len(),
                nodes.len()
            ));
        }
        info!(pid, ports = ports.len(), "http-meta kernel started");
        Ok(MetaSession { pid, ports })
    }

    pub async fn stop(&self, pid: u32) -> Result<()> {
        self.authorize(self.client.post(self.endpoint("stop")?))
            .json(&StopRequest { pid: vec![pid] })
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to stop http-meta kernel {}", pid))?;
        info!(pid, "http-meta kernel stopped");
        Ok(())
    }
}
