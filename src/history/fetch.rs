use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;
use url::Url;

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Returns the page body as text.
    async fn fetch(&self, url: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct HttpPageFetcher {
    agent: ureq::Agent,
    max_body_bytes: u64,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration, max_body_bytes: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(5)
            .user_agent(concat!("pagelens-host/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            max_body_bytes,
        }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).with_context(|| format!("invalid page url {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("unsupported scheme for page fetch: {}", parsed.scheme());
        }

        let agent = self.agent.clone();
        let limit = self.max_body_bytes;
        let target = parsed.to_string();
        tokio::task::spawn_blocking(move || fetch_blocking(&agent, &target, limit))
            .await
            .context("page fetch worker terminated unexpectedly")?
    }
}

fn fetch_blocking(agent: &ureq::Agent, url: &str, limit: u64) -> Result<String> {
    let response = agent
        .get(url)
        .set("Accept", "text/html,application/xhtml+xml")
        .call()
        .map_err(|err| anyhow!("failed to fetch {url}: {err}"))?;

    let mut body = Vec::new();
    response
        .into_reader()
        .take(limit)
        .read_to_end(&mut body)
        .with_context(|| format!("failed to read body of {url}"))?;

    debug!(target: "history_sync", %url, bytes = body.len(), "page fetched");
    Ok(String::from_utf8_lossy(&body).into_owned())
}
