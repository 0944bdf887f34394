use serde::{Deserialize, Serialize};

use super::{RpcError, base64_bytes};

/// A slice of a file on the wire. The final chunk of a file carries `last`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub last: bool,
}

/// One message of a multi-file transfer: a header opens each file, chunks follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileTransferMessage {
    Header {
        target_path: String,
        mode: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        override_service_unit: Option<String>,
    },
    Chunk(Chunk),
}

/// One key/value pair of the info map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoEntry {
    pub key: String,
    pub value: String,
}

impl InfoEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A systemd unit to install on the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnit {
    pub name: String,
    pub contents: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetInfoStatus {
    Success,
    AlreadySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadBootstrapperStatus {
    Success,
    UploadFailed,
    StartFailed,
    FileExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadFilesStatus {
    Success,
    UploadFailed,
    AlreadyStarted,
    AlreadyFinished,
    StartFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadSystemdServiceUnitsStatus {
    Success,
    Failure,
}

/// First frame of every debugd connection.
///
/// Streaming variants are followed by `StreamItem` frames: `UploadBootstrapper`
/// by chunks and `UploadFiles` by file-transfer messages from the client;
/// `DownloadBootstrapper` and `DownloadFiles` by the same from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DebugdRequest {
    SetInfo { info: Vec<InfoEntry> },
    GetInfo,
    UploadBootstrapper,
    DownloadBootstrapper,
    UploadFiles,
    DownloadFiles,
    UploadSystemServiceUnits { units: Vec<ServiceUnit> },
    Ping,
}

impl DebugdRequest {
    /// RPC method name, used for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::SetInfo { .. } => "SetInfo",
            Self::GetInfo => "GetInfo",
            Self::UploadBootstrapper => "UploadBootstrapper",
            Self::DownloadBootstrapper => "DownloadBootstrapper",
            Self::UploadFiles => "UploadFiles",
            Self::DownloadFiles => "DownloadFiles",
            Self::UploadSystemServiceUnits { .. } => "UploadSystemServiceUnits",
            Self::Ping => "Ping",
        }
    }
}

/// Response to a unary or client-streaming debugd request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DebugdResponse {
    SetInfo { status: SetInfoStatus },
    GetInfo { info: Vec<InfoEntry> },
    UploadBootstrapper { status: UploadBootstrapperStatus },
    UploadFiles { status: UploadFilesStatus },
    UploadSystemServiceUnits { status: UploadSystemdServiceUnitsStatus },
    Pong,
    Error(RpcError),
}
