use serde::{Deserialize, Serialize};

use super::{RpcError, base64_bytes};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateNodeRequest {
    pub disk_uuid: String,
    pub node_name: String,
}

/// Everything a joining worker needs to unlock its disk and join Kubernetes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateNodeResponse {
    #[serde(with = "base64_bytes")]
    pub state_disk_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub cluster_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub owner_id: Vec<u8>,
    pub api_server_endpoint: String,
    pub token: String,
    pub discovery_token_ca_cert_hash: String,
    #[serde(with = "base64_bytes")]
    pub kubelet_cert: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub kubelet_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivationRequest {
    ActivateNode(ActivateNodeRequest),
    /// Reserved; the service answers `Unimplemented`.
    ActivateCoordinator,
    Ping,
}

impl ActivationRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::ActivateNode(_) => "ActivateNode",
            Self::ActivateCoordinator => "ActivateCoordinator",
            Self::Ping => "Ping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivationResponse {
    ActivateNode(ActivateNodeResponse),
    Pong,
    Error(RpcError),
}
