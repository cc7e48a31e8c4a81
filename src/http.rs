//! Timed, retryable HTTP requests, optionally routed through a kernel egress port

use crate::Result;
use anyhow::Context;
use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::debug;

/// Default timeout for a single request in milliseconds
const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default delay before the first retry in milliseconds
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

const DEFAULT_USER_AGENT: &str = "curl/7.88.0";

/// Configuration for outgoing requests
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Deadline for each attempt
    pub timeout: Duration,
    /// Extra attempts after the first failure
    pub retries: u32,
    /// Base backoff; attempt `n` waits `n * retry_delay`
    pub retry_delay: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retries: 1,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HttpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Status and body of a completed request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Thin wrapper over a reqwest client adding retries with linear backoff
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpConfig,
}

impl HttpClient {
    /// A client that talks to the network directly.
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Self::builder(&config).no_proxy().build()?;
        Ok(Self { client, config })
    }

    /// A client whose every request leaves through the kernel listening on
    /// `127.0.0.1:<port>`, so it originates from that node's egress.
    pub fn via_proxy(config: HttpConfig, port: u16) -> Result<Self> {
        Self::via_proxy_at(config, "127.0.0.1", port)
    }

    /// Like [`HttpClient::via_proxy`] for a kernel on another host.
    pub fn via_proxy_at(config: HttpConfig, host: &str, port: u16) -> Result<Self> {
        let proxy = Proxy::all(format!("http://{}:{}", host, port))?;
        let client = Self::builder(&config)
            .proxy(proxy)
            // A fresh connection per request keeps traffic on the current upstream.
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client, config })
    }

    fn builder(config: &HttpConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// GET `url` and return status and body. Transport failures are retried;
    /// an HTTP error status is a completed request and is returned as is.
    pub async fn get_text(&self, url: &str) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            match self.try_get(url).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    debug!(url, attempt, error = %e, "request failed, retrying");
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
                Err(e) => return Err(e).with_context(|| format!("GET {} failed", url)),
            }
        }
    }

    async fn try_get(&self, url: &str) -> Result<HttpResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}
