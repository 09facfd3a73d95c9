//! Messages exchanged with the inference worker. Every message carries the
//! id of the request it belongs to.

use serde::{Deserialize, Serialize};

use coach_core::Message;

pub type RequestId = u64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init { id: RequestId },
    Generate { id: RequestId, messages: Vec<Message> },
    Abort { id: RequestId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Status { id: RequestId, message: String },
    Ready { id: RequestId },
    Token { id: RequestId, token: String },
    Done { id: RequestId, text: String },
    Error { id: RequestId, error: String },
}

impl WorkerResponse {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Status { id, .. }
            | Self::Ready { id }
            | Self::Token { id, .. }
            | Self::Done { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }
}
