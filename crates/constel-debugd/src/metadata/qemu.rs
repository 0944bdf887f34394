use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use super::{Fetcher, fetch_json, fetch_text, normalize_ips};

/// Metadata API served by the QEMU host on the VM network.
pub const QEMU_METADATA_ENDPOINT: &str = "http://10.42.0.1:8080";

pub struct QemuFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl QemuFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, QEMU_METADATA_ENDPOINT)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Fetcher for QemuFetcher {
    async fn discover_debugd_ips(&self) -> Result<Vec<String>> {
        let url = format!("{}/peers", self.base_url);
        let peers = fetch_json(self.client.get(&url), &url).await?;
        Ok(parse_peers(&peers))
    }

    async fn discover_loadbalancer_ip(&self) -> Result<Option<String>> {
        let url = format!("{}/endpoint", self.base_url);
        let body = fetch_text(self.client.get(&url), &url).await?;
        Ok(parse_endpoint(&body))
    }
}

/// VPC IPs of a `/peers` listing.
pub fn parse_peers(peers: &serde_json::Value) -> Vec<String> {
    let ips = peers
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|peer| peer.get("VPCIP").or_else(|| peer.get("vpcip")))
                .filter_map(|ip| ip.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    normalize_ips(ips)
}

/// Host part of the `/endpoint` answer (a bare or JSON-quoted `host[:port]`).
pub fn parse_endpoint(body: &str) -> Option<String> {
    let body = body.trim();
    let raw = serde_json::from_str::<String>(body).unwrap_or_else(|_| body.to_string());
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<SocketAddr>() {
        Ok(addr) => Some(addr.ip().to_string()),
        Err(_) => Some(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned JSON response per accepted connection.
    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_parse_peers() {
        let peers = serde_json::json!([
            {"Name": "worker-1", "VPCIP": "10.42.1.3"},
            {"Name": "cp-0", "VPCIP": "10.42.1.2"},
            {"Name": "cp-0-dup", "vpcip": "10.42.1.2"},
            {"Name": "no-ip"}
        ]);
        assert_eq!(parse_peers(&peers), vec!["10.42.1.2", "10.42.1.3"]);
        assert!(parse_peers(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("\"10.42.2.1:6443\"").as_deref(), Some("10.42.2.1"));
        assert_eq!(parse_endpoint("10.42.2.1\n").as_deref(), Some("10.42.2.1"));
        assert_eq!(parse_endpoint(""), None);
    }

    #[tokio::test]
    async fn test_discover_over_http() {
        let base = serve_once(r#"[{"VPCIP":"10.42.1.9"},{"VPCIP":"10.42.1.8"}]"#).await;
        let fetcher = QemuFetcher::with_base_url(reqwest::Client::new(), base);
        assert_eq!(
            fetcher.discover_debugd_ips().await.unwrap(),
            vec!["10.42.1.8", "10.42.1.9"]
        );
    }
}
