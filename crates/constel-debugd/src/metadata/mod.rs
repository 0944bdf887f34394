//! Cloud metadata adapters used to find other debugd instances.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod qemu;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use constel_core::state::{CSP_ENV, CloudProvider};

/// Resource tag / label carrying the cluster's unique ID.
pub const UID_TAG: &str = "constellation-uid";

/// Finds debugd peers of the current node.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// VPC IPs of other nodes of this cluster.
    async fn discover_debugd_ips(&self) -> Result<Vec<String>>;

    /// Address of the cluster load balancer, if there is one.
    async fn discover_loadbalancer_ip(&self) -> Result<Option<String>>;
}

/// Fetcher for unknown environments: finds nothing.
pub struct FallbackFetcher;

#[async_trait]
impl Fetcher for FallbackFetcher {
    async fn discover_debugd_ips(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn discover_loadbalancer_ip(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Pick the adapter for `CONSTEL_CSP`.
pub fn fetcher_from_env() -> Result<Arc<dyn Fetcher>> {
    let raw = std::env::var(CSP_ENV).unwrap_or_default();
    match raw.parse::<CloudProvider>() {
        Ok(provider) => fetcher_for(provider),
        Err(_) => {
            warn!(
                env = CSP_ENV,
                value = %raw,
                "Unknown cloud provider, peer discovery disabled"
            );
            Ok(Arc::new(FallbackFetcher))
        }
    }
}

pub fn fetcher_for(provider: CloudProvider) -> Result<Arc<dyn Fetcher>> {
    info!(provider = %provider, "Using cloud metadata for peer discovery");
    let client = http_client()?;
    Ok(match provider {
        CloudProvider::Gcp => Arc::new(gcp::GcpFetcher::new(client)),
        CloudProvider::Azure => Arc::new(azure::AzureFetcher::new(client)),
        CloudProvider::Aws => Arc::new(aws::AwsFetcher::new(client)),
        CloudProvider::Qemu => Arc::new(qemu::QemuFetcher::new(client)),
    })
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("constellation-debugd/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .with_context(|| "Failed to build HTTP client")
}

/// Sort and de-duplicate, dropping empty entries.
pub fn normalize_ips(mut ips: Vec<String>) -> Vec<String> {
    ips.retain(|ip| !ip.is_empty());
    ips.sort();
    ips.dedup();
    ips
}

/// Send a request and fail on non-success status codes.
async fn send_checked(req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
    let resp = req
        .send()
        .await
        .with_context(|| format!("HTTP request failed: {}", what))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("HTTP {} for {}", status, what);
    }
    Ok(resp)
}

async fn fetch_json(req: reqwest::RequestBuilder, what: &str) -> Result<serde_json::Value> {
    send_checked(req, what)
        .await?
        .json::<serde_json::Value>()
        .await
        .with_context(|| format!("Failed to parse JSON from {}", what))
}

async fn fetch_text(req: reqwest::RequestBuilder, what: &str) -> Result<String> {
    send_checked(req, what)
        .await?
        .text()
        .await
        .with_context(|| format!("Failed to read response body from {}", what))
}
