//! Client for a kernel's local control plane

use crate::Result;
use anyhow::{anyhow, Context};
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Interval between readiness polls
const READY_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Per-request deadline for control calls other than delay tests
const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

/// Slack added on top of the delay-test timeout the kernel is asked to honour
const DELAY_DEADLINE_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct DelayResponse {
    delay: Option<i64>,
    message: Option<String>,
}

/// Control-plane client for one kernel listening on `127.0.0.1:<port>`
#[derive(Debug, Clone)]
pub struct Controller {
    client: Client,
    base: Url,
    secret: Option<String>,
}

impl Controller {
    pub fn new(port: u16, secret: Option<String>) -> Result<Self> {
        let base = Url::parse(&format!("http://127.0.0.1:{}/", port))?;
        Self::with_base(base, secret)
    }

    pub fn with_base(base: Url, secret: Option<String>) -> Result<Self> {
        let client = Client::builder().no_proxy().build()?;
        Ok(Self {
            client,
            base,
            secret,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("controller base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            Some(secret) => request.bearer_auth(secret),
            None => request,
        }
    }

    /// Version string reported by `GET /version`.
    pub async fn version(&self) -> Result<String> {
        let url = self.endpoint(&["version"])?;
        let response = self
            .authorize(self.client.get(url))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body: VersionResponse = response.json().await.context("malformed version response")?;
        Ok(body.version)
    }

    /// Poll `/version` until it answers with a well-formed body or `max_wait`
    /// elapses. A connectable socket alone does not count as ready.
    pub async fn wait_ready(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.version().await {
                Ok(version) if !version.is_empty() => {
                    debug!(version = %version, "control plane ready");
                    return true;
                }
                Ok(_) => debug!("control plane returned an empty version"),
                Err(e) => debug!(error = %e, "control plane not ready"),
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// One delay test of node `id` against `test_url`.
    ///
    /// `None` on timeout, a non-2xx reply, or a reply without a positive delay.
    pub async fn query_delay(&self, id: &str, test_url: &str, timeout: Duration) -> Option<u64> {
        let mut url = self.endpoint(&["proxies", id, "delay"]).ok()?;
        url.query_pairs_mut()
            .append_pair("url", test_url)
            .append_pair("timeout", &timeout.as_millis().to_string());

        let response = self
            .authorize(self.client.get(url))
            .timeout(timeout + DELAY_DEADLINE_SLACK)
            .send()
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(id, error = %e, "delay request failed");
                return None;
            }
        };
        let status = response.status();
        let body: Option<DelayResponse> = response.json().await.ok();
        if !status.is_success() {
            debug!(
                id,
                status = status.as_u16(),
                message = body.and_then(|b| b.message).unwrap_or_default(),
                "delay test failed"
            );
            return None;
        }
        body.and_then(|b| b.delay)
            .filter(|delay| *delay > 0)
            .map(|delay| delay as u64)
    }

    /// Point `group` at node `id` (`PUT /proxies/{group}`).
    pub async fn select(&self, group: &str, id: &str) -> Result<()> {
        let url = self.endpoint(&["proxies", group])?;
        self.authorize(self.client.put(url))
            .timeout(CONTROL_TIMEOUT)
            .json(&json!({ "name": id }))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to switch {} to {}", group, id))?;
        Ok(())
    }
}
