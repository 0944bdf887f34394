use serde::{Deserialize, Serialize};

use super::{RpcError, base64_bytes};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecoveryRequest {
    PushStateDiskKey {
        #[serde(with = "base64_bytes")]
        state_disk_key: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecoveryResponse {
    PushStateDiskKey,
    Error(RpcError),
}
