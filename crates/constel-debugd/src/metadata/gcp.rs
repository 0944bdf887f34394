use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{Fetcher, UID_TAG, fetch_json, fetch_text, normalize_ips};

const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
const COMPUTE_URL: &str = "https://compute.googleapis.com/compute/v1";

pub struct GcpFetcher {
    client: reqwest::Client,
}

/// Facts about the current instance from the metadata server.
struct SelfInfo {
    project: String,
    zone: String,
    name: String,
    token: String,
}

impl GcpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn metadata(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", METADATA_URL, path);
        let req = self.client.get(&url).header("Metadata-Flavor", "Google");
        Ok(fetch_text(req, &url).await?.trim().to_string())
    }

    async fn self_info(&self) -> Result<SelfInfo> {
        let project = self.metadata("project/project-id").await?;
        let zone = last_segment(&self.metadata("instance/zone").await?).to_string();
        let name = self.metadata("instance/name").await?;
        let token: Value = serde_json::from_str(
            &self
                .metadata("instance/service-accounts/default/token")
                .await?,
        )
        .with_context(|| "Malformed access token response")?;
        let token = token
            .get("access_token")
            .and_then(Value::as_str)
            .with_context(|| "Access token response has no access_token")?
            .to_string();
        Ok(SelfInfo {
            project,
            zone,
            name,
            token,
        })
    }

    async fn compute(&self, token: &str, path: &str) -> Result<Value> {
        let url = format!("{}/{}", COMPUTE_URL, path);
        fetch_json(self.client.get(&url).bearer_auth(token), &url).await
    }

    async fn uid(&self, me: &SelfInfo) -> Result<String> {
        let instance = self
            .compute(
                &me.token,
                &format!(
                    "projects/{}/zones/{}/instances/{}",
                    me.project, me.zone, me.name
                ),
            )
            .await?;
        instance
            .pointer(&format!("/labels/{}", UID_TAG))
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("Instance {} has no {} label", me.name, UID_TAG))
    }
}

#[async_trait]
impl Fetcher for GcpFetcher {
    async fn discover_debugd_ips(&self) -> Result<Vec<String>> {
        let me = self.self_info().await?;
        let uid = self.uid(&me).await?;
        let listing = self
            .compute(
                &me.token,
                &format!(
                    "projects/{}/zones/{}/instances?filter=labels.{}%3D{}",
                    me.project, me.zone, UID_TAG, uid
                ),
            )
            .await?;
        Ok(instance_ips(&listing, &me.name))
    }

    async fn discover_loadbalancer_ip(&self) -> Result<Option<String>> {
        let me = self.self_info().await?;
        let uid = self.uid(&me).await?;
        let listing = self
            .compute(
                &me.token,
                &format!(
                    "projects/{}/regions/{}/forwardingRules?filter=labels.{}%3D{}",
                    me.project,
                    zone_region(&me.zone),
                    UID_TAG,
                    uid
                ),
            )
            .await?;
        Ok(listing
            .pointer("/items/0/IPAddress")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

/// Primary internal IPs of all listed instances except `self_name`.
pub fn instance_ips(listing: &Value, self_name: &str) -> Vec<String> {
    let items = listing
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let ips = items
        .iter()
        .filter(|item| item.get("name").and_then(Value::as_str) != Some(self_name))
        .filter_map(|item| item.pointer("/networkInterfaces/0/networkIP"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    normalize_ips(ips)
}

fn last_segment(s: &str) -> &str {
    s.rsplit('/').next().unwrap_or(s)
}

/// `europe-west3-b` -> `europe-west3`.
pub fn zone_region(zone: &str) -> &str {
    zone.rsplit_once('-').map(|(region, _)| region).unwrap_or(zone)
}
