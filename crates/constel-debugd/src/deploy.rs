use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zbus::zvariant::OwnedObjectPath;

use constel_core::constants::{
    BOOTSTRAPPER_DEPLOY_PATH, BOOTSTRAPPER_UNIT, SYSTEMD_RUNTIME_UNIT_DIR, SYSTEMD_UNIT_DIR,
};
use constel_core::fs::HostFs;
use constel_core::naming;
use constel_core::protocol::debugd::ServiceUnit;

/// Serializes every unit-file write in the process.
static UNIT_WRITE_LOCK: Mutex<()> = Mutex::const_new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemdAction {
    Start,
    Stop,
    Restart,
    /// `daemon-reload`; the unit is ignored.
    Reload,
}

impl fmt::Display for SystemdAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("systemd job {action} on {unit} finished with result {result:?}, expected \"done\"")]
    JobFailed {
        action: SystemdAction,
        unit: String,
        result: String,
    },
}

/// The systemd manager as seen over D-Bus.
#[async_trait]
pub trait SystemdBus: Send + Sync {
    /// Enqueue a start/stop/restart job in mode `replace` and wait for its
    /// result string (`done`, `failed`, ...).
    async fn run_job(&self, action: SystemdAction, unit: &str) -> Result<String>;

    async fn daemon_reload(&self) -> Result<()>;
}

// ============================================================================
// Service manager
// ============================================================================

/// Performs systemd actions and maintains unit files.
pub struct ServiceManager {
    bus: Arc<dyn SystemdBus>,
    fs: HostFs,
}

impl ServiceManager {
    pub fn new(bus: Arc<dyn SystemdBus>, fs: HostFs) -> Self {
        Self { bus, fs }
    }

    pub async fn systemd_action(&self, unit: &str, action: SystemdAction) -> Result<()> {
        if action == SystemdAction::Reload {
            self.bus
                .daemon_reload()
                .await
                .with_context(|| "Failed to perform systemd daemon-reload")?;
            info!("daemon-reload succeeded");
            return Ok(());
        }

        let result = self
            .bus
            .run_job(action, unit)
            .await
            .with_context(|| format!("Failed to {} systemd unit {}", action, unit))?;
        if result != "done" {
            return Err(ServiceError::JobFailed {
                action,
                unit: unit.to_string(),
                result,
            }
            .into());
        }
        info!(unit = %unit, action = %action, "Systemd action succeeded");
        Ok(())
    }

    /// Write a unit below the systemd unit directory and reload the daemon.
    pub async fn write_systemd_unit_file(&self, unit: &ServiceUnit) -> Result<()> {
        naming::validate_unit_name(&unit.name)?;
        let path = PathBuf::from(SYSTEMD_UNIT_DIR).join(&unit.name);
        info!(path = %path.display(), "Writing systemd unit file");
        {
            let _lock = UNIT_WRITE_LOCK.lock().await;
            self.fs
                .write(&path, unit.contents.as_bytes(), 0o644)
                .await
                .with_context(|| format!("Failed to write systemd unit file {}", unit.name))?;
        }
        self.systemd_action(&unit.name, SystemdAction::Reload)
            .await
    }

    /// Point `unit_name`'s `ExecStart` at `exec_start` through a runtime
    /// drop-in, then restart the unit.
    pub async fn override_service_unit_exec_start(
        &self,
        unit_name: &str,
        exec_start: &str,
    ) -> Result<()> {
        naming::validate_unit_name(unit_name)?;
        naming::validate_unit_value(exec_start)?;

        let path = PathBuf::from(SYSTEMD_RUNTIME_UNIT_DIR)
            .join(format!("{}.service.d", unit_name))
            .join("override.conf");
        let contents = format!("[Service]\nExecStart=\nExecStart={}\n", exec_start);
        info!(path = %path.display(), exec_start = %exec_start, "Overriding unit ExecStart");
        {
            let _lock = UNIT_WRITE_LOCK.lock().await;
            self.fs
                .write(&path, contents.as_bytes(), 0o644)
                .await
                .with_context(|| format!("Failed to write override drop-in for {}", unit_name))?;
        }

        // A failed reload may be unrelated to this drop-in.
        if let Err(e) = self.systemd_action(unit_name, SystemdAction::Reload).await {
            warn!(unit = %unit_name, error = %e, "daemon-reload failed");
        }
        self.systemd_action(&format!("{}.service", unit_name), SystemdAction::Restart)
            .await
            .with_context(|| format!("Failed to restart {} after override", unit_name))
    }

    /// Install the bootstrapper unit unless one is present.
    pub async fn ensure_bootstrapper_unit(&self) -> Result<()> {
        let name = format!("{}.service", BOOTSTRAPPER_UNIT);
        let path = PathBuf::from(SYSTEMD_UNIT_DIR).join(&name);
        if self.fs.exists(&path).await {
            return Ok(());
        }
        self.write_systemd_unit_file(&ServiceUnit {
            name,
            contents: bootstrapper_unit_contents(),
        })
        .await
    }
}

pub fn bootstrapper_unit_contents() -> String {
    format!(
        "[Unit]\n\
         Description=Constellation Bootstrapper\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         RemainAfterExit=yes\n\
         Restart=on-failure\n\
         EnvironmentFile=/run/constellation.env\n\
         ExecStart={}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        BOOTSTRAPPER_DEPLOY_PATH
    )
}

// ============================================================================
// D-Bus backend
// ============================================================================

const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";

/// [`SystemdBus`] over the system D-Bus.
pub struct DbusSystemd {
    connection: zbus::Connection,
}

impl DbusSystemd {
    pub async fn connect() -> Result<Self> {
        let connection = zbus::Connection::system()
            .await
            .with_context(|| "Failed to connect to the system bus")?;
        // The manager only emits JobRemoved to subscribed clients.
        connection
            .call_method(
                Some(SYSTEMD_DESTINATION),
                SYSTEMD_PATH,
                Some(MANAGER_INTERFACE),
                "Subscribe",
                &(),
            )
            .await
            .with_context(|| "Failed to subscribe to systemd signals")?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl SystemdBus for DbusSystemd {
    async fn run_job(&self, action: SystemdAction, unit: &str) -> Result<String> {
        let method = match action {
            SystemdAction::Start => "StartUnit",
            SystemdAction::Stop => "StopUnit",
            SystemdAction::Restart => "RestartUnit",
            SystemdAction::Reload => anyhow::bail!("reload is not a unit job"),
        };

        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(SYSTEMD_DESTINATION)?
            .interface(MANAGER_INTERFACE)?
            .member("JobRemoved")?
            .build();
        // Subscribe before enqueueing so the completion cannot be missed.
        let mut signals = zbus::MessageStream::for_match_rule(rule, &self.connection, None)
            .await
            .with_context(|| "Failed to watch systemd job completions")?;

        let reply = self
            .connection
            .call_method(
                Some(SYSTEMD_DESTINATION),
                SYSTEMD_PATH,
                Some(MANAGER_INTERFACE),
                method,
                &(unit, "replace"),
            )
            .await
            .with_context(|| format!("{} {} failed", method, unit))?;
        let job: OwnedObjectPath = reply
            .body()
            .deserialize()
            .with_context(|| format!("Unexpected {} reply", method))?;

        while let Some(msg) = signals.next().await {
            let msg = msg.with_context(|| "Failed to read systemd signal")?;
            let (_id, path, _unit, result): (u32, OwnedObjectPath, String, String) =
                match msg.body().deserialize() {
                    Ok(body) => body,
                    Err(_) => continue,
                };
            if path == job {
                return Ok(result);
            }
        }
        anyhow::bail!("System bus closed while waiting for job {}", job.as_str())
    }

    async fn daemon_reload(&self) -> Result<()> {
        self.connection
            .call_method(
                Some(SYSTEMD_DESTINATION),
                SYSTEMD_PATH,
                Some(MANAGER_INTERFACE),
                "Reload",
                &(),
            )
            .await
            .with_context(|| "Reload failed")?;
        Ok(())
    }
}

// ============================================================================
// Test double
// ============================================================================

/// In-memory [`SystemdBus`] recording every call.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FakeSystemd {
    pub calls: std::sync::Mutex<Vec<(SystemdAction, String)>>,
    /// Result reported for unit jobs; `done` when unset.
    pub job_result: Option<String>,
    pub fail_reload: bool,
}

#[cfg(test)]
impl FakeSystemd {
    pub fn calls(&self) -> Vec<(SystemdAction, String)> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, action: SystemdAction, unit: &str) {
        match self.calls.lock() {
            Ok(mut calls) => calls.push((action, unit.to_string())),
            Err(poisoned) => poisoned.into_inner().push((action, unit.to_string())),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl SystemdBus for FakeSystemd {
    async fn run_job(&self, action: SystemdAction, unit: &str) -> Result<String> {
        self.record(action, unit);
        Ok(self.job_result.clone().unwrap_or_else(|| "done".to_string()))
    }

    async fn daemon_reload(&self) -> Result<()> {
        self.record(SystemdAction::Reload, "");
        if self.fail_reload {
            anyhow::bail!("reload refused");
        }
        Ok(())
    }
}
