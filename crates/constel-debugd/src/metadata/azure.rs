use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{Fetcher, UID_TAG, fetch_json, normalize_ips};

const IMDS_URL: &str = "http://169.254.169.254/metadata";
const ARM_URL: &str = "https://management.azure.com";

pub struct AzureFetcher {
    client: reqwest::Client,
}

/// Facts about the current VM from the instance metadata service.
#[derive(Debug, PartialEq, Eq)]
pub struct VmInfo {
    pub subscription_id: String,
    pub resource_group: String,
    pub uid: String,
}

impl AzureFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn imds(&self, path: &str) -> Result<Value> {
        let url = format!("{}/{}", IMDS_URL, path);
        fetch_json(self.client.get(&url).header("Metadata", "true"), &url).await
    }

    async fn arm_token(&self) -> Result<String> {
        let token = self
            .imds("identity/oauth2/token?api-version=2018-02-01&resource=https://management.azure.com/")
            .await?;
        token
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| "IMDS token response has no access_token")
    }

    async fn arm(&self, token: &str, path: &str) -> Result<Value> {
        let url = format!("{}{}", ARM_URL, path);
        fetch_json(self.client.get(&url).bearer_auth(token), &url).await
    }

    async fn context(&self) -> Result<(VmInfo, String)> {
        let instance = self.imds("instance?api-version=2021-02-01").await?;
        let vm = parse_vm_info(&instance)?;
        let token = self.arm_token().await?;
        Ok((vm, token))
    }
}

#[async_trait]
impl Fetcher for AzureFetcher {
    async fn discover_debugd_ips(&self) -> Result<Vec<String>> {
        let (vm, token) = self.context().await?;
        let rg_path = format!(
            "/subscriptions/{}/resourceGroups/{}",
            vm.subscription_id, vm.resource_group
        );
        let scale_sets = self
            .arm(
                &token,
                &format!(
                    "{}/providers/Microsoft.Compute/virtualMachineScaleSets?api-version=2022-08-01",
                    rg_path
                ),
            )
            .await?;

        let mut ips = Vec::new();
        for name in tagged_names(&scale_sets, &vm.uid) {
            let nics = self
                .arm(
                    &token,
                    &format!(
                        "{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}/networkInterfaces?api-version=2018-10-01",
                        rg_path, name
                    ),
                )
                .await?;
            ips.extend(nic_private_ips(&nics));
        }
        Ok(normalize_ips(ips))
    }

    async fn discover_loadbalancer_ip(&self) -> Result<Option<String>> {
        let (vm, token) = self.context().await?;
        let public_ips = self
            .arm(
                &token,
                &format!(
                    "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/publicIPAddresses?api-version=2021-05-01",
                    vm.subscription_id, vm.resource_group
                ),
            )
            .await?;
        Ok(tagged_items(&public_ips, &vm.uid)
            .filter_map(|item| item.pointer("/properties/ipAddress"))
            .filter_map(Value::as_str)
            .map(str::to_string)
            .next())
    }
}

pub fn parse_vm_info(instance: &Value) -> Result<VmInfo> {
    let field = |name: &str| {
        instance
            .pointer(&format!("/compute/{}", name))
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("IMDS response has no compute.{}", name))
    };
    let uid = instance
        .pointer("/compute/tagsList")
        .and_then(Value::as_array)
        .and_then(|tags| {
            tags.iter()
                .find(|tag| tag.get("name").and_then(Value::as_str) == Some(UID_TAG))
        })
        .and_then(|tag| tag.get("value"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("VM has no {} tag", UID_TAG))?;
    Ok(VmInfo {
        subscription_id: field("subscriptionId")?,
        resource_group: field("resourceGroupName")?,
        uid,
    })
}

fn tagged_items<'a>(listing: &'a Value, uid: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    listing
        .get("value")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(move |item| {
            item.pointer(&format!("/tags/{}", UID_TAG))
                .and_then(Value::as_str)
                == Some(uid)
        })
}

/// Names of listed resources tagged with `uid`.
pub fn tagged_names(listing: &Value, uid: &str) -> Vec<String> {
    tagged_items(listing, uid)
        .filter_map(|item| item.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Private IPs of every IP configuration of the listed interfaces.
pub fn nic_private_ips(nics: &Value) -> Vec<String> {
    nics.get("value")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|nic| nic.pointer("/properties/ipConfigurations"))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|cfg| cfg.pointer("/properties/privateIPAddress"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_info() {
        let instance = serde_json::json!({
            "compute": {
                "subscriptionId": "sub",
                "resourceGroupName": "rg",
                "tagsList": [
                    {"name": "other", "value": "x"},
                    {"name": "constellation-uid", "value": "abc123"}
                ]
            }
        });
        assert_eq!(
            parse_vm_info(&instance).unwrap(),
            VmInfo {
                subscription_id: "sub".to_string(),
                resource_group: "rg".to_string(),
                uid: "abc123".to_string(),
            }
        );
        assert!(parse_vm_info(&serde_json::json!({"compute": {}})).is_err());
    }

    #[test]
    fn test_tagged_names_and_nic_ips() {
        let scale_sets = serde_json::json!({"value": [
            {"name": "cp", "tags": {"constellation-uid": "abc"}},
            {"name": "foreign", "tags": {"constellation-uid": "zzz"}},
            {"name": "worker", "tags": {"constellation-uid": "abc"}}
        ]});
        assert_eq!(tagged_names(&scale_sets, "abc"), vec!["cp", "worker"]);

        let nics = serde_json::json!({"value": [
            {"properties": {"ipConfigurations": [
                {"properties": {"privateIPAddress": "10.9.0.5"}},
                {"properties": {"privateIPAddress": "10.9.0.6"}}
            ]}},
            {"properties": {}}
        ]});
        assert_eq!(nic_private_ips(&nics), vec!["10.9.0.5", "10.9.0.6"]);
    }
}
