//! Log collection on debug clusters.
//!
//! Once the info map arrives with `logcollect = true`, a podman pod running
//! logstash and filebeat ships the node's journal to OpenSearch.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

use constel_core::fs::HostFs;
use constel_core::state::CloudProvider;

use crate::info::{InfoMap, Trigger};

/// Info key enabling log collection.
pub const LOGCOLLECT_KEY: &str = "logcollect";
/// Prefix of info keys forwarded as log fields.
pub const LOGCOLLECT_PREFIX: &str = "logcollect.";
/// Info key carrying the OpenSearch password on QEMU.
pub const QEMU_OPENSEARCH_PASSWORD_KEY: &str = "qemu.opensearch-pw";
const QEMU_OPENSEARCH_USER: &str = "cluster-instance-qemu";

const OPENSEARCH_HOST: &str =
    "https://search-e2e-logs-y46renozy42lcojbvrt3qq7csm.eu-central-1.es.amazonaws.com:443";
const LOGSTASH_IMAGE: &str = "ghcr.io/edgelesssys/constellation/logstash-debugd:latest";
const FILEBEAT_IMAGE: &str = "ghcr.io/edgelesssys/constellation/filebeat-debugd:latest";
const LOGSTASH_PORT: u16 = 5044;
const POD_NAME: &str = "logcollection";

/// Where rendered configuration lands.
pub const LOGCOLLECT_DIR: &str = "/run/logcollect";

const PIPELINE_TEMPLATE: &str = r#"input {
  beats {
    port => {{ port }}
  }
}

filter {
  mutate {
    add_field => {
{%- for key, value in fields %}
      "{{ key }}" => "{{ value }}"
{%- endfor %}
    }
  }
}

output {
  opensearch {
    hosts => "{{ host }}"
    index => "systemd-logs-%{+YYYY.MM.dd}"
    user => "{{ username }}"
    password => "{{ password }}"
    ssl => true
  }
}
"#;

const FILEBEAT_TEMPLATE: &str = r#"filebeat.inputs:
  - type: journald
    id: journald
  - type: filestream
    id: container
    paths:
      - /var/log/pods/*/*/*.log

output.logstash:
  hosts: ["{{ logstash_host }}"]
{% if add_cloud_metadata %}
processors:
  - add_cloud_metadata: ~
{% endif %}
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Runs podman with the given arguments.
#[async_trait]
pub trait PodRunner: Send + Sync {
    async fn podman(&self, args: &[String]) -> Result<()>;
}

/// [`PodRunner`] invoking the `podman` binary.
pub struct Podman;

#[async_trait]
impl PodRunner for Podman {
    async fn podman(&self, args: &[String]) -> Result<()> {
        info!(args = ?args, "Running podman");
        let output = tokio::process::Command::new("podman")
            .args(args)
            .output()
            .await
            .with_context(|| "Failed to run podman")?;
        if !output.status.success() {
            anyhow::bail!(
                "podman {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Starts the log collection pod when the info map asks for it.
pub struct LogCollector {
    fs: HostFs,
    provider: Option<CloudProvider>,
    podman: Arc<dyn PodRunner>,
}

impl LogCollector {
    pub fn new(fs: HostFs, provider: Option<CloudProvider>, podman: Arc<dyn PodRunner>) -> Self {
        Self {
            fs,
            provider,
            podman,
        }
    }

    /// A trigger for [`InfoMap::register_on_receive_trigger`]. The work runs
    /// on a spawned task; failures are logged.
    pub fn start_trigger(self: Arc<Self>) -> Trigger {
        Box::new(move |map: &InfoMap| {
            let info = match map.get_copy() {
                Ok(info) => info,
                Err(e) => {
                    error!(error = %e, "Reading info map failed");
                    return;
                }
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                error!("No async runtime, log collection not started");
                return;
            };
            let collector = Arc::clone(&self);
            runtime.spawn(async move {
                if let Err(e) = collector.start(&info).await {
                    error!(error = %format!("{:#}", e), "Starting log collection failed");
                }
            });
        })
    }

    /// Render configuration and start the pod if `logcollect = true`.
    /// Returns whether collection was started.
    pub async fn start(&self, info: &BTreeMap<String, String>) -> Result<bool> {
        if info.get(LOGCOLLECT_KEY).map(String::as_str) != Some("true") {
            info!("Log collection not enabled");
            return Ok(false);
        }

        let creds = credentials(self.provider, info).with_context(|| "Getting OpenSearch credentials")?;
        let mut fields = filter_info_map(info);
        if let Some(provider) = self.provider {
            fields.insert("provider".to_string(), provider.to_string());
        }

        let pipeline = render_pipeline(&fields, &creds)?;
        let pipeline_dir = format!("{}/logstash/pipeline", LOGCOLLECT_DIR);
        self.fs
            .write(format!("{}/pipeline.conf", pipeline_dir), pipeline.as_bytes(), 0o600)
            .await
            .with_context(|| "Writing logstash pipeline")?;

        let filebeat = render_filebeat(&format!("localhost:{}", LOGSTASH_PORT), true)?;
        let filebeat_path = format!("{}/filebeat/filebeat.yml", LOGCOLLECT_DIR);
        self.fs
            .write(&filebeat_path, filebeat.as_bytes(), 0o644)
            .await
            .with_context(|| "Writing filebeat config")?;

        info!("Starting log collection pod");
        for args in pod_commands(
            &self.fs.resolve(&pipeline_dir).display().to_string(),
            &self.fs.resolve(&filebeat_path).display().to_string(),
        ) {
            self.podman.podman(&args).await?;
        }
        Ok(true)
    }
}

/// OpenSearch credentials for `provider`.
pub fn credentials(
    provider: Option<CloudProvider>,
    info: &BTreeMap<String, String>,
) -> Result<Credentials> {
    match provider {
        Some(CloudProvider::Qemu) => {
            let password = info
                .get(QEMU_OPENSEARCH_PASSWORD_KEY)
                .filter(|pw| !pw.is_empty())
                .with_context(|| format!("Info key {} not set", QEMU_OPENSEARCH_PASSWORD_KEY))?;
            Ok(Credentials {
                username: QEMU_OPENSEARCH_USER.to_string(),
                password: password.clone(),
            })
        }
        Some(other) => anyhow::bail!("Log collection credentials not supported on {}", other),
        None => anyhow::bail!("Cloud provider unknown"),
    }
}

/// The `logcollect.*` entries with their prefix removed.
pub fn filter_info_map(info: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    info.iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(LOGCOLLECT_PREFIX)
                .map(|field| (field.to_string(), v.clone()))
        })
        .collect()
}

pub fn render_pipeline(fields: &BTreeMap<String, String>, creds: &Credentials) -> Result<String> {
    let mut tera = tera::Tera::default();
    tera.add_raw_template("pipeline.conf", PIPELINE_TEMPLATE)
        .map_err(|e| anyhow::anyhow!("Failed to parse pipeline template: {}", e))?;

    let mut ctx = tera::Context::new();
    ctx.insert("port", &LOGSTASH_PORT);
    ctx.insert("host", OPENSEARCH_HOST);
    ctx.insert("fields", fields);
    ctx.insert("username", &creds.username);
    ctx.insert("password", &creds.password);

    tera.render("pipeline.conf", &ctx)
        .map_err(|e| anyhow::anyhow!("Failed to render pipeline template: {}", e))
}

pub fn render_filebeat(logstash_host: &str, add_cloud_metadata: bool) -> Result<String> {
    let mut tera = tera::Tera::default();
    tera.add_raw_template("filebeat.yml", FILEBEAT_TEMPLATE)
        .map_err(|e| anyhow::anyhow!("Failed to parse filebeat template: {}", e))?;

    let mut ctx = tera::Context::new();
    ctx.insert("logstash_host", logstash_host);
    ctx.insert("add_cloud_metadata", &add_cloud_metadata);

    tera.render("filebeat.yml", &ctx)
        .map_err(|e| anyhow::anyhow!("Failed to render filebeat template: {}", e))
}

fn pod_commands(pipeline_dir: &str, filebeat_config: &str) -> Vec<Vec<String>> {
    let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        args(&["pod", "create", POD_NAME]),
        args(&[
            "run",
            "--detach",
            "--rm",
            "--name=logstash",
            &format!("--pod={}", POD_NAME),
            "--log-driver=none",
            &format!("--volume={}:/usr/share/logstash/pipeline/:ro", pipeline_dir),
            LOGSTASH_IMAGE,
        ]),
        args(&[
            "run",
            "--detach",
            "--rm",
            "--name=filebeat",
            &format!("--pod={}", POD_NAME),
            "--privileged",
            "--log-driver=none",
            "--volume=/run/log/journal:/run/log/journal:ro",
            "--volume=/etc/machine-id:/etc/machine-id:ro",
            "--volume=/run/systemd:/run/systemd:ro",
            "--volume=/var/log:/var/log:ro",
            &format!("--volume={}:/usr/share/filebeat/filebeat.yml:ro", filebeat_config),
            FILEBEAT_IMAGE,
        ]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPodman {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl PodRunner for RecordingPodman {
        async fn podman(&self, args: &[String]) -> Result<()> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(())
        }
    }

    fn info(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_filter_info_map() {
        let filtered = filter_info_map(&info(&[
            ("logcollect", "true"),
            ("logcollect.admin", "alice"),
            ("logcollect.uid", "abc"),
            ("qemu.opensearch-pw", "pw"),
        ]));
        assert_eq!(filtered, info(&[("admin", "alice"), ("uid", "abc")]));
    }

    #[test]
    fn test_qemu_credentials() {
        let creds = credentials(
            Some(CloudProvider::Qemu),
            &info(&[("qemu.opensearch-pw", "secret")]),
        )
        .unwrap();
        assert_eq!(creds.username, "cluster-instance-qemu");
        assert_eq!(creds.password, "secret");

        assert!(credentials(Some(CloudProvider::Qemu), &info(&[])).is_err());
        assert!(credentials(Some(CloudProvider::Gcp), &info(&[])).is_err());
        assert!(credentials(None, &info(&[])).is_err());
    }

    #[test]
    fn test_render_pipeline_includes_fields() {
        let rendered = render_pipeline(
            &info(&[("admin", "alice"), ("uid", "abc")]),
            &Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
            },
        )
        .unwrap();
        assert!(rendered.contains("port => 5044"));
        assert!(rendered.contains(r#""admin" => "alice""#));
        assert!(rendered.contains(r#""uid" => "abc""#));
        assert!(rendered.contains(r#"user => "u""#));
        assert!(rendered.contains("%{+YYYY.MM.dd}"));
    }

    #[test]
    fn test_render_filebeat() {
        let with = render_filebeat("localhost:5044", true).unwrap();
        assert!(with.contains(r#"hosts: ["localhost:5044"]"#));
        assert!(with.contains("add_cloud_metadata"));
        let without = render_filebeat("localhost:5044", false).unwrap();
        assert!(!without.contains("add_cloud_metadata"));
    }

    #[tokio::test]
    async fn test_start_renders_and_runs_pod() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(dir.path());
        let podman = Arc::new(RecordingPodman::default());
        let collector = LogCollector::new(fs.clone(), Some(CloudProvider::Qemu), podman.clone());

        let started = collector
            .start(&info(&[
                ("logcollect", "true"),
                ("logcollect.uid", "abc"),
                ("qemu.opensearch-pw", "secret"),
            ]))
            .await
            .unwrap();
        assert!(started);

        let pipeline = fs
            .read_to_string("/run/logcollect/logstash/pipeline/pipeline.conf")
            .await
            .unwrap();
        assert!(pipeline.contains(r#""provider" => "qemu""#));
        assert!(pipeline.contains(r#"password => "secret""#));
        assert!(fs.exists("/run/logcollect/filebeat/filebeat.yml").await);

        let calls = podman.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], vec!["pod", "create", "logcollection"]);
        assert!(calls[1].contains(&"--name=logstash".to_string()));
        assert!(calls[2].contains(&"--name=filebeat".to_string()));
    }

    #[tokio::test]
    async fn test_start_without_flag_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let podman = Arc::new(RecordingPodman::default());
        let collector = LogCollector::new(
            HostFs::rooted(dir.path()),
            Some(CloudProvider::Qemu),
            podman.clone(),
        );
        assert!(!collector.start(&info(&[("logcollect", "false")])).await.unwrap());
        assert!(podman.calls.lock().unwrap().is_empty());
    }
}
