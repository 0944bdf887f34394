use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{Fetcher, UID_TAG, fetch_text, normalize_ips, send_checked};

const IMDS_URL: &str = "http://169.254.169.254";
const EC2_API_VERSION: &str = "2016-11-15";

static PRIVATE_IP: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<privateIpAddress>([0-9.]+)</privateIpAddress>").ok());

pub struct AwsFetcher {
    client: reqwest::Client,
}

/// Role credentials served by IMDS.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Token", default)]
    pub session_token: Option<String>,
}

struct InstanceContext {
    region: String,
    uid: String,
    credentials: Credentials,
}

impl AwsFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn imds_token(&self) -> Result<String> {
        let url = format!("{}/latest/api/token", IMDS_URL);
        let req = self
            .client
            .put(&url)
            .header("X-aws-ec2-metadata-token-ttl-seconds", "21600");
        fetch_text(req, &url).await
    }

    async fn imds(&self, token: &str, path: &str) -> Result<String> {
        let url = format!("{}/latest/meta-data/{}", IMDS_URL, path);
        let req = self
            .client
            .get(&url)
            .header("X-aws-ec2-metadata-token", token);
        Ok(fetch_text(req, &url).await?.trim().to_string())
    }

    async fn context(&self) -> Result<InstanceContext> {
        let token = self.imds_token().await?;
        let region = self.imds(&token, "placement/region").await?;
        let uid = self
            .imds(&token, &format!("tags/instance/{}", UID_TAG))
            .await
            .with_context(|| format!("Instance has no {} tag", UID_TAG))?;
        let role = self.imds(&token, "iam/security-credentials/").await?;
        let role = role.lines().next().unwrap_or_default().to_string();
        let raw = self
            .imds(&token, &format!("iam/security-credentials/{}", role))
            .await?;
        let credentials: Credentials =
            serde_json::from_str(&raw).with_context(|| "Malformed role credentials")?;
        Ok(InstanceContext {
            region,
            uid,
            credentials,
        })
    }
}

#[async_trait]
impl Fetcher for AwsFetcher {
    async fn discover_debugd_ips(&self) -> Result<Vec<String>> {
        let ctx = self.context().await?;
        let host = format!("ec2.{}.amazonaws.com", ctx.region);
        let query = vec![
            ("Action".to_string(), "DescribeInstances".to_string()),
            ("Version".to_string(), EC2_API_VERSION.to_string()),
            ("Filter.1.Name".to_string(), format!("tag:{}", UID_TAG)),
            ("Filter.1.Value.1".to_string(), ctx.uid.clone()),
            ("Filter.2.Name".to_string(), "instance-state-name".to_string()),
            ("Filter.2.Value.1".to_string(), "running".to_string()),
        ];
        let request = SignedRequest {
            method: "GET",
            host: &host,
            path: "/",
            query: &query,
            headers: &[],
            body: b"",
        };
        let headers = request.sign(&ctx.credentials, &ctx.region, "ec2", Utc::now())?;

        let url = format!("https://{}/?{}", host, canonical_query(&query));
        let mut req = self.client.get(&url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let body = fetch_text(req, "ec2:DescribeInstances").await?;
        Ok(private_ips(&body))
    }

    async fn discover_loadbalancer_ip(&self) -> Result<Option<String>> {
        let ctx = self.context().await?;
        let host = format!("tagging.{}.amazonaws.com", ctx.region);
        let body = serde_json::to_vec(&serde_json::json!({
            "ResourceTypeFilters": ["elasticloadbalancing:loadbalancer"],
            "TagFilters": [{"Key": UID_TAG, "Values": [ctx.uid]}],
        }))?;
        let extra = [
            ("content-type", "application/x-amz-json-1.1"),
            ("x-amz-target", "ResourceGroupsTaggingAPI_20170126.GetResources"),
        ];
        let request = SignedRequest {
            method: "POST",
            host: &host,
            path: "/",
            query: &[],
            headers: &extra,
            body: &body,
        };
        let headers = request.sign(&ctx.credentials, &ctx.region, "tagging", Utc::now())?;

        let url = format!("https://{}/", host);
        let mut req = self.client.post(&url).body(body.clone());
        for (name, value) in extra.iter().map(|(n, v)| (n.to_string(), v.to_string())).chain(headers) {
            req = req.header(name, value);
        }
        let resources = send_checked(req, "tagging:GetResources")
            .await?
            .json::<serde_json::Value>()
            .await
            .with_context(|| "Malformed GetResources response")?;
        Ok(resources
            .pointer("/ResourceTagMappingList/0/ResourceARN")
            .and_then(serde_json::Value::as_str)
            .and_then(|arn| load_balancer_dns_name(arn, &ctx.region)))
    }
}

/// Private IPs in a `DescribeInstances` XML response.
pub fn private_ips(xml: &str) -> Vec<String> {
    let Some(re) = PRIVATE_IP.as_ref() else {
        return Vec::new();
    };
    let ips = re
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect();
    normalize_ips(ips)
}

/// DNS name of a network load balancer from its ARN
/// (`...:loadbalancer/net/<name>/<id>` -> `<name>-<id>.elb.<region>.amazonaws.com`).
pub fn load_balancer_dns_name(arn: &str, region: &str) -> Option<String> {
    let (_, resource) = arn.split_once(":loadbalancer/")?;
    let mut parts = resource.split('/');
    let (_kind, name, id) = (parts.next()?, parts.next()?, parts.next()?);
    Some(format!("{}-{}.elb.{}.amazonaws.com", name, id, region))
}

// ============================================================================
// Signature version 4
// ============================================================================

/// The parts of an HTTP request covered by a SigV4 signature.
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// Additional headers to sign, lowercase names.
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

impl SignedRequest<'_> {
    /// Headers (`x-amz-date`, optional `x-amz-security-token`,
    /// `authorization`) to attach to the request.
    pub fn sign(
        &self,
        creds: &Credentials,
        region: &str,
        service: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.push(("host".to_string(), self.host.to_string()));
        headers.push(("x-amz-date".to_string(), amz_date.clone()));
        if let Some(token) = &creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(n, v)| format!("{}:{}\n", n, v))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.path,
            canonical_query(self.query),
            canonical_headers,
            signed_headers,
            hex(&Sha256::digest(self.body))
        );

        let scope = format!("{}/{}/{}/aws4_request", date, region, service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex(&Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(&creds.secret_access_key, &date, region, service)?;
        let signature = hex(&hmac_sha256(&key, string_to_sign.as_bytes())?);

        let mut out = vec![("x-amz-date".to_string(), amz_date)];
        if let Some(token) = &creds.session_token {
            out.push(("x-amz-security-token".to_string(), token.clone()));
        }
        out.push((
            "authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                creds.access_key_id, scope, signed_headers, signature
            ),
        ));
        Ok(out)
    }
}

pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sorted, RFC 3986 encoded query string.
pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn example_credentials() -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn test_signing_key_matches_published_example() {
        let key = signing_key(
            &example_credentials().secret_access_key,
            "20150830",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex(&key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_signature_matches_published_example() {
        let query = vec![
            ("Version".to_string(), "2010-05-08".to_string()),
            ("Action".to_string(), "ListUsers".to_string()),
        ];
        let extra = [(
            "content-type",
            "application/x-www-form-urlencoded; charset=utf-8",
        )];
        let request = SignedRequest {
            method: "GET",
            host: "iam.amazonaws.com",
            path: "/",
            query: &query,
            headers: &extra,
            body: b"",
        };
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let headers = request
            .sign(&example_credentials(), "us-east-1", "iam", now)
            .unwrap();

        assert_eq!(headers[0], ("x-amz-date".to_string(), "20150830T123600Z".to_string()));
        assert_eq!(
            headers[1].1,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, \
             Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
    }

    #[test]
    fn test_canonical_query_encodes_and_sorts() {
        let query = vec![
            ("b".to_string(), "x y".to_string()),
            ("a".to_string(), "tag:constellation-uid".to_string()),
        ];
        assert_eq!(canonical_query(&query), "a=tag%3Aconstellation-uid&b=x%20y");
    }

    #[test]
    fn test_private_ips_from_describe_instances() {
        let xml = r#"<DescribeInstancesResponse>
            <reservationSet><item><instancesSet><item>
              <privateIpAddress>192.168.1.7</privateIpAddress>
              <networkInterfaceSet><item>
                <privateIpAddress>192.168.1.7</privateIpAddress>
              </item></networkInterfaceSet>
            </item><item>
              <privateIpAddress>192.168.1.5</privateIpAddress>
            </item></instancesSet></item></reservationSet>
        </DescribeInstancesResponse>"#;
        assert_eq!(private_ips(xml), vec!["192.168.1.5", "192.168.1.7"]);
    }

    #[test]
    fn test_load_balancer_dns_name() {
        assert_eq!(
            load_balancer_dns_name(
                "arn:aws:elasticloadbalancing:eu-central-1:123456789012:loadbalancer/net/constell-lb/50dc6c495c0c9188",
                "eu-central-1"
            )
            .as_deref(),
            Some("constell-lb-50dc6c495c0c9188.elb.eu-central-1.amazonaws.com")
        );
        assert_eq!(load_balancer_dns_name("arn:aws:ec2:instance/i-1", "x"), None);
    }
}
