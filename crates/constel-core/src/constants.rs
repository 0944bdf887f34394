use std::time::Duration;

// ============================================================================
// Ports
// ============================================================================

/// Plaintext debugd port.
pub const DEBUGD_PORT: u16 = 4000;

/// Attested activation service port.
pub const ACTIVATION_PORT: u16 = 9090;

/// Attested recovery key API port.
pub const RECOVERY_PORT: u16 = 9999;

// ============================================================================
// debugd
// ============================================================================

/// Where a deployed bootstrapper binary lands on the node.
pub const BOOTSTRAPPER_DEPLOY_PATH: &str = "/opt/bootstrapper";

/// Systemd unit (without `.service`) running the bootstrapper.
pub const BOOTSTRAPPER_UNIT: &str = "bootstrapper";

/// Minimum time between two download attempts against the same endpoint.
pub const BOOTSTRAPPER_DOWNLOAD_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Period of the peer discovery loop.
pub const DISCOVER_DEBUGD_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for a single file chunk on the wire.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Clients may not ping the debugd server more often than this.
pub const KEEPALIVE_MIN_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Dial timeout for peer connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory for systemd units written by debugd.
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Directory for runtime drop-in fragments.
pub const SYSTEMD_RUNTIME_UNIT_DIR: &str = "/run/systemd/system";

// ============================================================================
// Activation
// ============================================================================

/// Persisted cluster identity on control-plane nodes.
pub const ACTIVATION_ID_FILENAME: &str = "/var/lib/constellation/activation-id.json";

/// Kubernetes admin kubeconfig written by kubeadm.
pub const ADMIN_CONF_FILENAME: &str = "/etc/kubernetes/admin.conf";

/// Cluster CA certificate.
pub const KUBERNETES_CA_CERT_FILENAME: &str = "/etc/kubernetes/pki/ca.crt";

/// Cluster CA private key.
pub const KUBERNETES_CA_KEY_FILENAME: &str = "/etc/kubernetes/pki/ca.key";

/// Master secret as provisioned on control-plane nodes.
pub const NODE_MASTER_SECRET_FILENAME: &str = "/var/lib/constellation/mastersecret.base64";

/// Upper bound for outbound sub-calls of one activation request.
pub const ACTIVATION_REQUEST_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Join token lifetime handed to joining workers.
pub const JOIN_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// CLI-side files
// ============================================================================

/// Default master secret file written by the CLI.
pub const MASTER_SECRET_FILENAME: &str = "constellation-mastersecret.base64";

/// Default identity file written by `identity init`.
pub const IDENTITY_FILENAME: &str = "activation-id.json";

/// Persisted CLI state file.
pub const STATE_FILENAME: &str = "constellation-state.json";

// ============================================================================
// Recovery
// ============================================================================

/// Device-mapper name of the unlocked state disk.
pub const STATE_DISK_MAPPER_NAME: &str = "state";
